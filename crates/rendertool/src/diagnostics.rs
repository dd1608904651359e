use std::io::{self, BufRead, Write};
use std::sync::{Mutex, PoisonError};

use treerender::{StallReport, StallReporter, StallResponse};

/// Prints stall reports and asks the operator whether to kill.
pub struct PromptReporter {
    input: Mutex<Box<dyn BufRead + Send>>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl PromptReporter {
    pub fn stdio() -> Self {
        Self::new(Box::new(io::BufReader::new(io::stdin())), Box::new(io::stderr()))
    }

    pub fn new(input: Box<dyn BufRead + Send>, output: Box<dyn Write + Send>) -> Self {
        Self {
            input: Mutex::new(input),
            output: Mutex::new(output),
        }
    }

    fn ask(&self, report: &StallReport) -> io::Result<String> {
        {
            let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
            writeln!(output, "{report}")?;
            write!(output, "Kill stalled renders? [y/N] ")?;
            output.flush()?;
        }
        let mut answer = String::new();
        self.input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read_line(&mut answer)?;
        Ok(answer)
    }
}

impl StallReporter for PromptReporter {
    fn on_stall(&self, report: &StallReport) -> StallResponse {
        tracing::warn!(
            render = %report.render,
            stalled = report.threads.len(),
            "render did not honour abort request"
        );
        match self.ask(report) {
            Ok(answer) => parse_answer(&answer),
            Err(err) => {
                tracing::warn!(%err, "could not read kill confirmation; leaving renders alone");
                StallResponse::Ignore
            }
        }
    }
}

pub fn parse_answer(answer: &str) -> StallResponse {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => StallResponse::Kill,
        _ => StallResponse::Ignore,
    }
}
