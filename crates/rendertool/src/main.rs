mod cli;
mod diagnostics;
mod effects;
mod graph;
mod run;

use anyhow::Result;
use cli::Command;

fn main() -> Result<()> {
    let cli = cli::parse();

    match cli.command {
        Command::Render(args) => run::render(args),
        Command::CheckConfig(args) => run::check_config(&args.path),
    }
}
