//! Render-tree construction and cooperative abort for node-graph compositing.
//!
//! A caller describes what it wants with a [`RenderRequest`] and turns it into
//! a [`RenderInvocation`]. Construction freezes the graph upstream of the root
//! so that concurrent edits never leak into a render in flight; launching
//! walks the frozen tree:
//!
//! ```text
//!   RenderRequest
//!        │ construct()
//!        ▼
//!   ContextLease::acquire ──▶ TreeBuilder::build ──▶ RenderNodeContext per node
//!        │ launch()
//!        ▼
//!   RoD / layer queries ──▶ RoI pass (once) ──▶ Effect::render(root) ──▶ inputs…
//!        ▲
//!        └── request_abort() ──▶ AbortSupervisor ──▶ watchdog on owner thread
//! ```
//!
//! Computation itself lives behind the [`Effect`] trait; the engine only
//! decides what to compute, in which isolated context, and how to stop it.

pub mod abort;
pub mod context;
pub mod error;
pub mod gpu;
pub mod invocation;
pub mod node;
pub mod stats;
pub mod tree;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use abort::{
    current_worker, AbortSupervisor, AbortableWorker, ActionInfo, LogStallReporter, StallReport,
    StallReporter, StallResponse, StalledThread, SupervisorSettings, WorkerId, WorkerRegistration,
};
pub use context::{current_context, ContextMap, RenderNodeContext};
pub use error::{ContextError, QueryKind, RenderError, TreeBuildError};
pub use gpu::{
    ContextKind, ContextLease, ContextPair, DeviceContext, GpuContextPool, GpuError,
    PaintContextAffinity, SharedContextPool,
};
pub use invocation::{
    launch_render, InvocationId, NodeScope, RenderEnvironment, RenderInvocation, RenderRequest,
};
pub use node::{Effect, EffectKind, Node, NodeId, NodeRef, ParamSnapshot, ParamValue};
pub use stats::{NodeTiming, RecordedStats, RenderStats};
pub use tree::TreeBuilder;
pub use types::{
    ImagePlane, Layer, LayerSet, OutputPlanes, PlaneRequest, RectD, RectI, RenderScale, TimeValue,
    ViewIdx,
};
pub use worker::WorkerThread;
