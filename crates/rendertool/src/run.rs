use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::TryRecvError;
use renderconfig::EngineConfig;
use scheduler::EventLoop;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use treerender::{
    Layer, LogStallReporter, OutputPlanes, RectI, RenderEnvironment, RenderError,
    RenderInvocation, RenderRequest, RenderScale, SharedContextPool, StallReporter, TimeValue,
    ViewIdx, WorkerId, WorkerThread,
};

use crate::cli::RenderArgs;
use crate::diagnostics::PromptReporter;
use crate::graph::Graph;

const CONTEXTS_PER_KIND: usize = 2;

/// `RUST_LOG` wins over the configured filter, which wins over `info`.
pub fn initialise_tracing(configured: Option<&str>) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => configured
            .and_then(|directive| EnvFilter::try_new(directive).ok())
            .unwrap_or_else(|| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load engine config at {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

pub fn check_config(path: &Path) -> Result<()> {
    initialise_tracing(None);
    let config = load_config(Some(path))?;
    println!("{}: ok", path.display());
    println!(
        "  abort_timeout:      {}",
        humantime::format_duration(config.abort_timeout)
    );
    println!("  interactive:        {}", config.interactive);
    println!("  handle_nans:        {}", config.handle_nans);
    println!("  use_concatenations: {}", config.use_concatenations);
    println!("  gpu.enabled:        {}", config.gpu.enabled);
    if let Some(filter) = &config.log_filter {
        println!("  log_filter:         {filter}");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Status {
    Ok,
    Aborted,
    Failed,
    Killed,
}

#[derive(Debug, Serialize)]
struct LayerSummary {
    layer: String,
    bounds: RectI,
    first_sample: Option<f32>,
}

#[derive(Debug, Serialize)]
struct Summary {
    status: Status,
    root: String,
    time: f64,
    view: usize,
    contexts: usize,
    gpu: bool,
    aborted: bool,
    layers: Vec<LayerSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn render(args: RenderArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if args.interactive {
        config.interactive = true;
    }
    if let Some(timeout) = args.abort_timeout {
        config.abort_timeout = timeout;
    }
    if args.no_gpu {
        config.gpu.enabled = false;
    }
    config.validate().context("invalid engine configuration")?;
    initialise_tracing(config.log_filter.as_deref());

    let graph = Graph::load(&args.graph)?;
    let root = graph.root(args.root.as_deref())?;
    tracing::debug!(nodes = graph.len(), root = %root.name(), "rendering graph");

    let event_loop = EventLoop::new();
    let reporter: Arc<dyn StallReporter> = if config.interactive {
        Arc::new(PromptReporter::stdio())
    } else {
        Arc::new(LogStallReporter)
    };
    let env = RenderEnvironment::new(config, event_loop.handle())
        .with_pool(Arc::new(SharedContextPool::new(CONTEXTS_PER_KIND)))
        .with_reporter(reporter);

    let request = RenderRequest::new(root)
        .time(TimeValue(args.time))
        .view(ViewIdx(args.view))
        .scale(RenderScale::uniform(args.scale));
    let invocation =
        RenderInvocation::construct(request, &env).context("failed to build render tree")?;

    if let Some(delay) = args.abort_after {
        let target = Arc::downgrade(&invocation);
        env.owner.start_timer(delay, move || {
            if let Some(invocation) = target.upgrade() {
                tracing::info!(after = %humantime::format_duration(delay), "requesting abort");
                invocation.request_abort();
            }
        })?;
    }

    let layers = (!args.layers.is_empty())
        .then(|| args.layers.iter().map(Layer::new).collect::<Vec<_>>());
    let worker = Arc::new(
        WorkerThread::new(WorkerId(1), "render-1")
            .with_kill_hook(|| tracing::error!("render-1 killed; its results are discarded")),
    );

    let (sender, receiver) = crossbeam_channel::bounded(1);
    let render_thread = {
        let invocation = Arc::clone(&invocation);
        let worker = Arc::clone(&worker);
        let roi = args.roi;
        thread::Builder::new()
            .name("render-1".into())
            .spawn(move || {
                let registration = invocation.register_current_thread(worker);
                let result = invocation.launch(roi, layers);
                drop(registration);
                let _ = sender.send(result);
            })
            .context("failed to spawn render thread")?
    };

    let mut outcome: Option<Result<OutputPlanes, RenderError>> = None;
    let mut disconnected = false;
    event_loop.run_until(|| {
        match receiver.try_recv() {
            Ok(result) => outcome = Some(result),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => disconnected = true,
        }
        outcome.is_some() || disconnected || worker.is_killed()
    });

    let mut summary = Summary {
        status: Status::Ok,
        root: invocation.root().name(),
        time: args.time,
        view: args.view,
        contexts: invocation.context_count(),
        gpu: invocation.gpu_context().is_some(),
        aborted: invocation.is_aborted(),
        layers: Vec::new(),
        error: None,
    };

    let failure = match outcome {
        Some(Ok(planes)) => {
            summary.layers = planes
                .iter()
                .map(|(layer, plane)| LayerSummary {
                    layer: layer.name().to_string(),
                    bounds: plane.bounds,
                    first_sample: plane.samples.first().copied(),
                })
                .collect();
            None
        }
        Some(Err(err)) if err.is_aborted() => {
            summary.status = Status::Aborted;
            None
        }
        Some(Err(err)) => {
            let err = anyhow::Error::new(err);
            summary.status = Status::Failed;
            summary.error = Some(format!("{err:#}"));
            Some(err)
        }
        None if worker.is_killed() => {
            // The thread cannot be joined; it dies with the process.
            summary.status = Status::Killed;
            None
        }
        None => {
            let panic = render_thread
                .join()
                .err()
                .and_then(|payload| {
                    payload
                        .downcast_ref::<&str>()
                        .map(|message| message.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                })
                .unwrap_or_else(|| "render thread exited without a result".to_string());
            summary.status = Status::Failed;
            summary.error = Some(panic.clone());
            Some(anyhow!(panic))
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("failed to serialise render summary")?
    );
    match failure {
        Some(err) => Err(err.context("render failed")),
        None => Ok(()),
    }
}
