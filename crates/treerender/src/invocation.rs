//! The per-request render object.
//!
//! [`RenderInvocation::construct`] leases device contexts and freezes the
//! graph upstream of the root into [`RenderNodeContext`]s.
//! [`RenderInvocation::launch`] then resolves the region and layers to
//! produce, propagates regions of interest once through the frozen tree and
//! computes the root, which pulls its inputs through [`NodeScope`].

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Instant;

use renderconfig::EngineConfig;
use scheduler::LoopHandle;

use crate::abort::{
    current_worker, AbortSupervisor, AbortableWorker, ActionScope, LogStallReporter,
    StallReporter, SupervisorSettings, WorkerRegistration,
};
use crate::context::{bind as bind_context, ContextMap, RenderNodeContext};
use crate::error::{ContextError, QueryKind, RenderError, TreeBuildError};
use crate::gpu::{ContextLease, DeviceContext, GpuContextPool, PaintContextAffinity};
use crate::node::{NodeId, NodeRef, ParamSnapshot};
use crate::stats::RenderStats;
use crate::tree::TreeBuilder;
use crate::types::{Layer, OutputPlanes, PlaneRequest, RectD, RenderScale, TimeValue, ViewIdx};

static NEXT_INVOCATION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationId(pub u64);

impl InvocationId {
    fn next() -> Self {
        InvocationId(NEXT_INVOCATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// What to render, and how.
#[derive(Clone)]
pub struct RenderRequest {
    root: NodeRef,
    time: TimeValue,
    view: ViewIdx,
    scale: RenderScale,
    roi: Option<RectD>,
    layers: Option<Vec<Layer>>,
    playback: bool,
    draft: bool,
    bypass_cache: bool,
    stats: Option<Arc<dyn RenderStats>>,
    painting: Option<Arc<dyn PaintContextAffinity>>,
    owner_worker: Option<Arc<dyn AbortableWorker>>,
}

impl RenderRequest {
    pub fn new(root: NodeRef) -> Self {
        Self {
            root,
            time: TimeValue::default(),
            view: ViewIdx::default(),
            scale: RenderScale::default(),
            roi: None,
            layers: None,
            playback: false,
            draft: false,
            bypass_cache: false,
            stats: None,
            painting: None,
            owner_worker: None,
        }
    }

    pub fn time(mut self, time: TimeValue) -> Self {
        self.time = time;
        self
    }

    pub fn view(mut self, view: ViewIdx) -> Self {
        self.view = view;
        self
    }

    pub fn scale(mut self, scale: RenderScale) -> Self {
        self.scale = scale;
        self
    }

    /// Region to produce; the root's region of definition when unset.
    pub fn region(mut self, roi: RectD) -> Self {
        self.roi = Some(roi);
        self
    }

    /// Layers to produce; the root's produced layers when unset.
    pub fn layers(mut self, layers: Vec<Layer>) -> Self {
        self.layers = Some(layers);
        self
    }

    pub fn playback(mut self, playback: bool) -> Self {
        self.playback = playback;
        self
    }

    pub fn draft(mut self, draft: bool) -> Self {
        self.draft = draft;
        self
    }

    pub fn bypass_cache(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self
    }

    pub fn stats(mut self, stats: Arc<dyn RenderStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Marks the render as a stroke of `tool`, which keeps its device
    /// contexts across renders.
    pub fn painting(mut self, tool: Arc<dyn PaintContextAffinity>) -> Self {
        self.painting = Some(tool);
        self
    }

    /// Worker that constructs the invocation, if it is not the thread's
    /// registered worker.
    pub fn owner_worker(mut self, worker: Arc<dyn AbortableWorker>) -> Self {
        self.owner_worker = Some(worker);
        self
    }
}

/// Process-level collaborators shared by all invocations.
#[derive(Clone)]
pub struct RenderEnvironment {
    pub config: EngineConfig,
    pub pool: Option<Arc<dyn GpuContextPool>>,
    pub owner: LoopHandle,
    pub reporter: Arc<dyn StallReporter>,
}

impl RenderEnvironment {
    pub fn new(config: EngineConfig, owner: LoopHandle) -> Self {
        Self {
            config,
            pool: None,
            owner,
            reporter: Arc::new(LogStallReporter),
        }
    }

    pub fn with_pool(mut self, pool: Arc<dyn GpuContextPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn StallReporter>) -> Self {
        self.reporter = reporter;
        self
    }
}

pub struct RenderInvocation {
    id: InvocationId,
    root: NodeRef,
    time: TimeValue,
    view: ViewIdx,
    scale: RenderScale,
    playback: bool,
    draft: bool,
    bypass_cache: bool,
    handle_nans: bool,
    use_concatenations: bool,
    stats: Option<Arc<dyn RenderStats>>,
    contexts: Mutex<ContextMap>,
    tree_root: OnceLock<Arc<RenderNodeContext>>,
    lease: ContextLease,
    supervisor: Arc<AbortSupervisor>,
    owner_thread: ThreadId,
}

impl fmt::Debug for RenderInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderInvocation")
            .field("id", &self.id)
            .field("root", &self.root.name())
            .field("time", &self.time)
            .field("view", &self.view)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

impl RenderInvocation {
    /// Leases device contexts and builds the render tree under the root.
    pub fn construct(
        request: RenderRequest,
        env: &RenderEnvironment,
    ) -> Result<Arc<Self>, TreeBuildError> {
        let RenderRequest {
            root,
            time,
            view,
            scale,
            playback,
            draft,
            bypass_cache,
            stats,
            painting,
            owner_worker,
            ..
        } = request;

        if !root.is_activated() {
            return Err(TreeBuildError::RootNotActivated {
                id: root.id(),
                name: root.name(),
            });
        }

        let pool = if env.config.gpu.enabled {
            env.pool.as_deref()
        } else {
            None
        };
        let lease = ContextLease::acquire(pool, painting.as_deref());

        let supervisor = AbortSupervisor::new(
            root.name(),
            env.owner.clone(),
            SupervisorSettings {
                timeout: env.config.abort_timeout,
                interactive: env.config.interactive,
            },
            Arc::clone(&env.reporter),
        );

        let id = InvocationId::next();
        let invocation = Arc::new_cyclic(|weak| Self {
            id,
            root: Arc::clone(&root),
            time,
            view,
            scale,
            playback,
            draft,
            bypass_cache,
            handle_nans: env.config.handle_nans,
            use_concatenations: env.config.use_concatenations,
            stats,
            contexts: Mutex::new(ContextMap::new(id, weak.clone())),
            tree_root: OnceLock::new(),
            lease,
            supervisor,
            owner_thread: thread::current().id(),
        });

        if let Some(worker) = owner_worker.or_else(current_worker) {
            worker.set_current_render(Arc::downgrade(&invocation));
        }

        let tree_root = invocation.build_subtree(&root)?;
        let _ = invocation.tree_root.set(tree_root);

        tracing::debug!(
            invocation = id.0,
            root = %root.name(),
            contexts = invocation.context_count(),
            gpu = invocation.lease.gpu().is_some(),
            pinned = invocation.lease.is_pinned(),
            "render invocation constructed"
        );
        Ok(invocation)
    }

    /// Builds (or finds) the contexts under `node` within this invocation.
    pub fn build_subtree(&self, node: &NodeRef) -> Result<Arc<RenderNodeContext>, TreeBuildError> {
        let mut contexts = self.contexts();
        TreeBuilder::new(&mut contexts).build(node)
    }

    /// Computes the root for `roi` and `layers`, querying the root for
    /// whichever is not given.
    pub fn launch(
        self: &Arc<Self>,
        roi: Option<RectD>,
        layers: Option<Vec<Layer>>,
    ) -> Result<OutputPlanes, RenderError> {
        let root = self.tree_root_or_missing()?;
        if self.is_aborted() {
            return Err(RenderError::Aborted);
        }
        let started = Instant::now();
        let scope = NodeScope::new(self, &root);

        let roi = match roi {
            Some(roi) => roi,
            None => {
                let _binding = bind_context(&root);
                let _action = ActionScope::enter(root.node(), "region_of_definition");
                root.effect()
                    .region_of_definition(&scope)
                    .map_err(|source| query_error(QueryKind::RegionOfDefinition, &root, source))?
            }
        };

        let layers = match layers {
            Some(layers) if !layers.is_empty() => layers,
            _ => {
                let _binding = bind_context(&root);
                let _action = ActionScope::enter(root.node(), "layers");
                root.effect()
                    .layers(&scope)
                    .map_err(|source| query_error(QueryKind::Layers, &root, source))?
                    .produced
            }
        };

        self.propagate_regions_of_interest(&root, &roi)?;

        let par = {
            let _binding = bind_context(&root);
            root.effect().aspect_ratio(&scope)
        };
        let request = PlaneRequest {
            roi: roi.to_pixel_enclosing(self.scale, par),
            layers,
        };
        let planes = self.render_context(&root, &request)?;

        if self.is_aborted() {
            tracing::info!(invocation = self.id.0, root = %self.root.name(), "render aborted");
            return Err(RenderError::Aborted);
        }
        tracing::info!(
            invocation = self.id.0,
            root = %self.root.name(),
            planes = planes.len(),
            elapsed = %humantime::format_duration(started.elapsed()),
            "render finished"
        );
        Ok(planes)
    }

    /// Pushes `roi` from the root to every reachable input, one visit per
    /// node, each node seeing the union of all its consumers' requests.
    fn propagate_regions_of_interest(
        &self,
        root: &Arc<RenderNodeContext>,
        roi: &RectD,
    ) -> Result<(), RenderError> {
        let mut order = Vec::new();
        post_order(root, &mut HashSet::new(), &mut order);
        for context in &order {
            context.reset_roi();
        }
        root.request_roi(roi);

        // Consumers come before their inputs in reverse post-order.
        for context in order.iter().rev() {
            let Some(requested) = context.requested_roi() else {
                continue;
            };
            context.mark_roi_visit();
            if requested.is_null() {
                continue;
            }
            let scope = NodeScope::new(self, context);
            let _binding = bind_context(context);
            let _action = ActionScope::enter(context.node(), "regions_of_interest");
            let regions = context
                .effect()
                .regions_of_interest(&scope, &requested)
                .map_err(|source| query_error(QueryKind::RegionsOfInterest, context, source))?;
            for (slot, region) in regions {
                match context.input(slot) {
                    Some(input) if !region.is_null() => input.request_roi(&region),
                    Some(_) => {}
                    None => tracing::trace!(
                        node = %context.node().name(),
                        slot,
                        "region requested from unconnected input"
                    ),
                }
            }
        }
        Ok(())
    }

    pub(crate) fn render_context(
        &self,
        context: &Arc<RenderNodeContext>,
        request: &PlaneRequest,
    ) -> Result<OutputPlanes, RenderError> {
        if self.is_aborted() {
            return Err(RenderError::Aborted);
        }
        let _binding = bind_context(context);
        let _action = ActionScope::enter(context.node(), "render");
        let scope = NodeScope::new(self, context);

        let started = Instant::now();
        let result = context.effect().render(&scope, request);
        if let Some(stats) = &self.stats {
            stats.record_node(
                context.node_id(),
                &context.node().name(),
                started.elapsed(),
                result.is_ok(),
            );
        }

        // Failures of an input keep the identity of the node that failed.
        result.map_err(|source| match source.downcast::<RenderError>() {
            Ok(inner) => inner,
            Err(source) => RenderError::Compute {
                node: context.node().name(),
                source,
            },
        })
    }

    /// Registers `worker` for this invocation until the guard is dropped.
    pub fn register_current_thread(
        self: &Arc<Self>,
        worker: Arc<dyn AbortableWorker>,
    ) -> WorkerRegistration {
        worker.set_current_render(Arc::downgrade(self));
        self.supervisor.enter(worker)
    }

    /// Cooperative; returns true for the call that actually aborted.
    pub fn request_abort(&self) -> bool {
        self.supervisor.request_abort()
    }

    pub fn is_aborted(&self) -> bool {
        self.supervisor.is_aborted()
    }

    pub fn id(&self) -> InvocationId {
        self.id
    }

    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    pub fn time(&self) -> TimeValue {
        self.time
    }

    pub fn view(&self) -> ViewIdx {
        self.view
    }

    pub fn scale(&self) -> RenderScale {
        self.scale
    }

    pub fn tree_root(&self) -> Option<&Arc<RenderNodeContext>> {
        self.tree_root.get()
    }

    pub fn is_playback(&self) -> bool {
        self.playback
    }

    pub fn is_draft(&self) -> bool {
        self.draft
    }

    pub fn is_bypass_cache(&self) -> bool {
        self.bypass_cache
    }

    pub fn handles_nans(&self) -> bool {
        self.handle_nans
    }

    pub fn uses_concatenations(&self) -> bool {
        self.use_concatenations
    }

    pub fn stats(&self) -> Option<&Arc<dyn RenderStats>> {
        self.stats.as_ref()
    }

    pub fn gpu_context(&self) -> Option<&Arc<DeviceContext>> {
        self.lease.gpu()
    }

    pub fn cpu_context(&self) -> Option<&Arc<DeviceContext>> {
        self.lease.cpu()
    }

    pub fn lease(&self) -> &ContextLease {
        &self.lease
    }

    pub fn supervisor(&self) -> &Arc<AbortSupervisor> {
        &self.supervisor
    }

    pub fn owner_thread(&self) -> ThreadId {
        self.owner_thread
    }

    pub fn context_for(&self, node: NodeId) -> Option<Arc<RenderNodeContext>> {
        self.contexts().get(node).cloned()
    }

    pub fn context_count(&self) -> usize {
        self.contexts().len()
    }

    fn tree_root_or_missing(&self) -> Result<Arc<RenderNodeContext>, RenderError> {
        self.tree_root.get().cloned().ok_or_else(|| {
            RenderError::TreeBuild(TreeBuildError::Context(ContextError::Missing(
                self.root.id(),
            )))
        })
    }

    fn contexts(&self) -> MutexGuard<'_, ContextMap> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn query_error(query: QueryKind, context: &RenderNodeContext, source: anyhow::Error) -> RenderError {
    RenderError::Query {
        query,
        node: context.node().name(),
        source,
    }
}

fn post_order(
    context: &Arc<RenderNodeContext>,
    seen: &mut HashSet<NodeId>,
    order: &mut Vec<Arc<RenderNodeContext>>,
) {
    if !seen.insert(context.node_id()) {
        return;
    }
    for slot in 0..context.input_count() {
        if let Some(input) = context.input(slot) {
            post_order(input, seen, order);
        }
    }
    order.push(Arc::clone(context));
}

/// Builds, constructs and launches in one go.
pub fn launch_render(
    request: RenderRequest,
    env: &RenderEnvironment,
) -> Result<OutputPlanes, RenderError> {
    let roi = request.roi;
    let layers = request.layers.clone();
    let invocation = RenderInvocation::construct(request, env)?;
    invocation.launch(roi, layers)
}

/// What an effect sees of the render while one of its actions runs.
pub struct NodeScope<'a> {
    invocation: &'a RenderInvocation,
    context: &'a Arc<RenderNodeContext>,
}

impl<'a> NodeScope<'a> {
    pub(crate) fn new(invocation: &'a RenderInvocation, context: &'a Arc<RenderNodeContext>) -> Self {
        Self {
            invocation,
            context,
        }
    }

    pub fn time(&self) -> TimeValue {
        self.invocation.time
    }

    pub fn view(&self) -> ViewIdx {
        self.invocation.view
    }

    pub fn scale(&self) -> RenderScale {
        self.invocation.scale
    }

    pub fn is_draft(&self) -> bool {
        self.invocation.draft
    }

    pub fn is_playback(&self) -> bool {
        self.invocation.playback
    }

    /// Effects with caches of their own should recompute when set.
    pub fn is_bypass_cache(&self) -> bool {
        self.invocation.bypass_cache
    }

    /// Whether NaN samples should be replaced before they leave the effect.
    pub fn handles_nans(&self) -> bool {
        self.invocation.handle_nans
    }

    pub fn uses_concatenations(&self) -> bool {
        self.invocation.use_concatenations
    }

    /// Parameters as they were when the invocation was constructed.
    pub fn parameters(&self) -> &ParamSnapshot {
        self.context.parameters()
    }

    pub fn node(&self) -> &NodeRef {
        self.context.node()
    }

    pub fn context(&self) -> &Arc<RenderNodeContext> {
        self.context
    }

    /// Long computations should poll this and bail out with
    /// [`RenderError::Aborted`].
    pub fn is_aborted(&self) -> bool {
        self.invocation.is_aborted()
    }

    pub fn gpu_context(&self) -> Option<&Arc<DeviceContext>> {
        self.invocation.gpu_context()
    }

    pub fn connected_inputs(&self) -> Vec<usize> {
        self.context.connected_inputs()
    }

    /// Region the input at `slot` was asked for by the current launch.
    pub fn input_roi(&self, slot: usize) -> Option<RectD> {
        self.context.input(slot).and_then(|input| input.requested_roi())
    }

    pub fn input_region_of_definition(&self, slot: usize) -> Result<RectD, RenderError> {
        let input = self.connected_input(slot)?;
        let scope = NodeScope::new(self.invocation, input);
        let _binding = bind_context(input);
        let _action = ActionScope::enter(input.node(), "region_of_definition");
        input
            .effect()
            .region_of_definition(&scope)
            .map_err(|source| query_error(QueryKind::RegionOfDefinition, input, source))
    }

    /// Pixel request covering what the input at `slot` was asked for, or
    /// `None` if the launch needs nothing from it.
    pub fn input_request(&self, slot: usize, layers: &[Layer]) -> Option<PlaneRequest> {
        let input = self.context.input(slot)?;
        let roi = input.requested_roi()?;
        let par = {
            let _binding = bind_context(input);
            input.effect().aspect_ratio(&NodeScope::new(self.invocation, input))
        };
        Some(PlaneRequest {
            roi: roi.to_pixel_enclosing(self.invocation.scale, par),
            layers: layers.to_vec(),
        })
    }

    /// Computes the input at `slot` under this invocation.
    pub fn render_input(&self, slot: usize, request: &PlaneRequest) -> Result<OutputPlanes, RenderError> {
        let input = self.connected_input(slot)?;
        self.invocation.render_context(input, request)
    }

    fn connected_input(&self, slot: usize) -> Result<&'a Arc<RenderNodeContext>, RenderError> {
        let context: &'a Arc<RenderNodeContext> = self.context;
        context
            .input(slot)
            .ok_or_else(|| RenderError::InputNotConnected {
                node: self.context.node().name(),
                slot,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;
    use std::time::Duration;

    use super::*;
    use crate::abort::{StallResponse, WorkerId};
    use crate::gpu::SharedContextPool;
    use crate::stats::RecordedStats;
    use crate::node::{Node, ParamValue};
    use crate::testing::{MockNode, RecordingReporter, TestLoop};
    use crate::types::RectI;
    use crate::worker::WorkerThread;

    fn chain() -> (Arc<MockNode>, Arc<MockNode>, Arc<MockNode>) {
        let source = MockNode::source(1, "Read1");
        let filter = MockNode::filter(2, "Grade1");
        let output = MockNode::filter(3, "Write1");
        filter.connect(0, &source);
        output.connect(0, &filter);
        (source, filter, output)
    }

    #[test]
    fn three_node_chain_renders_produced_layer() {
        let rig = TestLoop::new();
        let (_source, filter, output) = chain();
        let request = RenderRequest::new(output.node())
            .time(TimeValue(1.0))
            .view(ViewIdx(0));
        let invocation = RenderInvocation::construct(request, &rig.env()).unwrap();
        let planes = invocation.launch(None, None).unwrap();

        assert_eq!(planes.len(), 1);
        let plane = &planes[&Layer::rgba()];
        assert_eq!(plane.bounds, RectI::new(0, 0, 100, 100));
        assert_eq!(filter.snapshot_calls(), 1);
        assert_eq!(invocation.context_count(), 3);
        assert_eq!(invocation.time(), TimeValue(1.0));
        // Each node adds its gain (1.0) to what its input produced.
        assert_eq!(plane.samples[0], 3.0);
    }

    #[test]
    fn contexts_are_bound_during_every_action() {
        let rig = TestLoop::new();
        let (source, filter, output) = chain();
        let invocation =
            RenderInvocation::construct(RenderRequest::new(output.node()), &rig.env()).unwrap();
        invocation.launch(None, None).unwrap();

        assert_eq!(
            output.effect_handle().bound_actions(),
            vec!["region_of_definition", "layers", "regions_of_interest", "render"]
        );
        assert_eq!(
            filter.effect_handle().bound_actions(),
            vec!["regions_of_interest", "render"]
        );
        assert_eq!(source.effect_handle().bound_actions(), vec!["regions_of_interest", "render"]);
        assert!(crate::context::current_context(NodeId(3)).is_none());
    }

    #[test]
    fn scope_exposes_invocation_flags() {
        let rig = TestLoop::new();
        let (_source, _filter, output) = chain();
        let mut config = EngineConfig::default();
        config.handle_nans = false;
        let env = RenderEnvironment::new(config, rig.event_loop.handle());
        let request = RenderRequest::new(output.node())
            .playback(true)
            .bypass_cache(true);
        let invocation = RenderInvocation::construct(request, &env).unwrap();

        let root = invocation.tree_root().unwrap();
        let scope = NodeScope::new(&invocation, root);
        assert!(scope.is_playback());
        assert!(scope.is_bypass_cache());
        assert!(!scope.is_draft());
        assert!(!scope.handles_nans());
        assert!(scope.uses_concatenations());
    }

    #[test]
    fn region_of_definition_failure_fails_launch() {
        let rig = TestLoop::new();
        let (_source, _filter, output) = chain();
        output.effect_handle().fail_region_of_definition();
        let invocation =
            RenderInvocation::construct(RenderRequest::new(output.node()), &rig.env()).unwrap();
        let err = invocation.launch(None, None).unwrap_err();
        assert!(matches!(
            err,
            RenderError::Query {
                query: QueryKind::RegionOfDefinition,
                ..
            }
        ));
        assert_eq!(output.effect_handle().render_calls(), 0);
    }

    #[test]
    fn explicit_region_skips_definition_query() {
        let rig = TestLoop::new();
        let (_source, _filter, output) = chain();
        output.effect_handle().fail_region_of_definition();
        let invocation =
            RenderInvocation::construct(RenderRequest::new(output.node()), &rig.env()).unwrap();
        let planes = invocation
            .launch(Some(RectD::new(10.0, 10.0, 20.0, 30.0)), None)
            .unwrap();
        assert_eq!(planes[&Layer::rgba()].bounds, RectI::new(10, 10, 20, 30));
    }

    #[test]
    fn layer_query_failure_fails_launch() {
        let rig = TestLoop::new();
        let (_source, _filter, output) = chain();
        output.effect_handle().fail_layers();
        let invocation =
            RenderInvocation::construct(RenderRequest::new(output.node()), &rig.env()).unwrap();
        let err = invocation.launch(None, None).unwrap_err();
        assert!(matches!(err, RenderError::Query { query: QueryKind::Layers, .. }));

        let planes = invocation
            .launch(None, Some(vec![Layer::new("Forward.Motion")]))
            .unwrap();
        assert!(planes.contains_key(&Layer::new("Forward.Motion")));
    }

    #[test]
    fn compute_failure_names_failing_node() {
        let rig = TestLoop::new();
        let (source, _filter, output) = chain();
        source.effect_handle().fail_render();
        let invocation =
            RenderInvocation::construct(RenderRequest::new(output.node()), &rig.env()).unwrap();
        match invocation.launch(None, None).unwrap_err() {
            RenderError::Compute { node, .. } => assert_eq!(node, "Read1"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn aborted_invocation_yields_no_images() {
        let rig = TestLoop::new();
        let (_source, _filter, output) = chain();
        let invocation =
            RenderInvocation::construct(RenderRequest::new(output.node()), &rig.env()).unwrap();
        assert!(invocation.request_abort());
        assert!(matches!(invocation.launch(None, None), Err(RenderError::Aborted)));
        assert_eq!(output.effect_handle().render_calls(), 0);
    }

    #[test]
    fn abort_during_render_unwinds_to_caller() {
        let rig = TestLoop::new();
        let (source, filter, output) = chain();
        let invocation =
            RenderInvocation::construct(RenderRequest::new(output.node()), &rig.env()).unwrap();
        let weak: Weak<RenderInvocation> = Arc::downgrade(&invocation);
        filter.effect_handle().before_render(move || {
            if let Some(invocation) = weak.upgrade() {
                invocation.request_abort();
            }
        });
        let err = invocation.launch(None, None).unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(source.effect_handle().render_calls(), 0);
    }

    #[test]
    fn parameter_snapshot_is_frozen_at_construction() {
        let rig = TestLoop::new();
        let (_source, filter, output) = chain();
        filter.set_param("gain", ParamValue::Double(2.0));
        let invocation =
            RenderInvocation::construct(RenderRequest::new(output.node()), &rig.env()).unwrap();
        filter.set_param("gain", ParamValue::Double(5.0));

        let context = invocation.context_for(filter.id()).unwrap();
        assert_eq!(context.parameters().double("gain"), Some(2.0));
        invocation.launch(None, None).unwrap();
        assert_eq!(filter.effect_handle().seen_gains(), vec![Some(2.0)]);

        // A fresh invocation sees the edit.
        let next =
            RenderInvocation::construct(RenderRequest::new(output.node()), &rig.env()).unwrap();
        let context = next.context_for(filter.id()).unwrap();
        assert_eq!(context.parameters().double("gain"), Some(5.0));
    }

    #[test]
    fn diamond_regions_are_unioned_in_one_pass() {
        let rig = TestLoop::new();
        let source = MockNode::source(1, "Read1");
        let blur = MockNode::filter(2, "Blur1");
        let grade = MockNode::filter(3, "Grade1");
        let merge = MockNode::merge(4, "Merge1");
        blur.connect(0, &source);
        grade.connect(0, &source);
        merge.connect(0, &blur);
        merge.connect(1, &grade);
        blur.effect_handle().set_roi_margin(10.0);

        let invocation =
            RenderInvocation::construct(RenderRequest::new(merge.node()), &rig.env()).unwrap();
        invocation
            .launch(Some(RectD::new(0.0, 0.0, 50.0, 50.0)), None)
            .unwrap();

        let source_ctx = invocation.context_for(source.id()).unwrap();
        assert_eq!(
            source_ctx.requested_roi(),
            Some(RectD::new(-10.0, -10.0, 60.0, 60.0))
        );
        for node in [&source, &blur, &grade, &merge] {
            let context = invocation.context_for(node.id()).unwrap();
            assert_eq!(context.roi_visits(), 1, "{}", node.name());
        }
        // Subtree builds within the invocation resolve to the same context.
        let again = invocation.build_subtree(&source.node()).unwrap();
        assert!(Arc::ptr_eq(&again, &source_ctx));
    }

    #[test]
    fn region_converts_with_scale_and_aspect_ratio() {
        let rig = TestLoop::new();
        let output = MockNode::source(1, "Anamorphic");
        output.effect_handle().set_aspect_ratio(2.0);
        output
            .effect_handle()
            .set_region_of_definition(RectD::new(0.0, 0.0, 1920.0, 1080.0));
        let request = RenderRequest::new(output.node()).scale(RenderScale::uniform(0.5));
        let invocation = RenderInvocation::construct(request, &rig.env()).unwrap();
        let planes = invocation.launch(None, None).unwrap();
        assert_eq!(planes[&Layer::rgba()].bounds, RectI::new(0, 0, 480, 540));
    }

    #[test]
    fn stats_receive_every_compute() {
        let rig = TestLoop::new();
        let (_source, _filter, output) = chain();
        let stats = Arc::new(RecordedStats::new());
        let request = RenderRequest::new(output.node()).stats(stats.clone());
        launch_render(request, &rig.env()).unwrap();
        let names: Vec<String> = stats.timings().into_iter().map(|t| t.name).collect();
        assert_eq!(names, ["Read1", "Grade1", "Write1"]);
    }

    #[test]
    fn inactive_root_is_rejected() {
        let rig = TestLoop::new();
        let output = MockNode::filter(1, "Write1");
        output.set_activated(false);
        let err = RenderInvocation::construct(RenderRequest::new(output.node()), &rig.env())
            .unwrap_err();
        assert!(matches!(err, TreeBuildError::RootNotActivated { .. }));
    }

    #[test]
    fn unconnected_input_cannot_be_rendered() {
        let rig = TestLoop::new();
        let merge = MockNode::merge(1, "Merge1");
        merge.connect(0, &MockNode::source(2, "Read1"));
        let invocation =
            RenderInvocation::construct(RenderRequest::new(merge.node()), &rig.env()).unwrap();
        let root = invocation.tree_root().unwrap();
        let scope = NodeScope::new(&invocation, root);
        let request = PlaneRequest {
            roi: RectI::new(0, 0, 1, 1),
            layers: vec![Layer::rgba()],
        };
        assert!(matches!(
            scope.render_input(1, &request),
            Err(RenderError::InputNotConnected { slot: 1, .. })
        ));
        assert!(scope.render_input(0, &request).is_ok());
    }

    #[test]
    fn lease_follows_configuration() {
        let rig = TestLoop::new();
        let output = MockNode::source(1, "Constant1");
        let pool: Arc<dyn GpuContextPool> = Arc::new(SharedContextPool::new(2));
        let env = rig.env().with_pool(pool.clone());
        let invocation =
            RenderInvocation::construct(RenderRequest::new(output.node()), &env).unwrap();
        assert!(invocation.gpu_context().is_some());
        assert!(invocation.cpu_context().is_some());

        let mut disabled = rig.env().with_pool(pool);
        disabled.config.gpu.enabled = false;
        let invocation =
            RenderInvocation::construct(RenderRequest::new(output.node()), &disabled).unwrap();
        assert!(invocation.gpu_context().is_none());
        assert!(invocation.cpu_context().is_none());
    }

    #[test]
    fn owner_worker_learns_its_invocation() {
        let rig = TestLoop::new();
        let output = MockNode::source(1, "Constant1");
        let owner = Arc::new(WorkerThread::new(WorkerId(1), "main"));
        let request = RenderRequest::new(output.node()).owner_worker(owner.clone());
        let invocation = RenderInvocation::construct(request, &rig.env()).unwrap();
        assert_eq!(owner.current_render().unwrap().id(), invocation.id());
        assert!(owner.abort_current_render());
        assert!(invocation.is_aborted());
    }

    #[test]
    fn watchdog_reports_worker_stuck_in_node() {
        let rig = TestLoop::new();
        let reporter = Arc::new(RecordingReporter::answering(StallResponse::Ignore));
        let env = rig.env().with_reporter(reporter.clone());
        let (_source, filter, output) = chain();
        let invocation = RenderInvocation::construct(RenderRequest::new(output.node()), &env).unwrap();

        let busy = Arc::new(WorkerThread::new(WorkerId(1), "render-1"));
        let idle = Arc::new(WorkerThread::new(WorkerId(2), "render-2"));
        invocation.supervisor().register_thread(busy.clone());
        invocation.supervisor().register_thread(idle);
        busy.set_current_action(Some(crate::abort::ActionInfo {
            action: "render".into(),
            node: filter.node(),
        }));

        // Abort arrives from a foreign thread and is marshalled to the owner.
        let remote = Arc::clone(&invocation);
        thread::spawn(move || remote.request_abort()).join().unwrap();
        rig.event_loop.run_pending();
        rig.clock.advance(Duration::from_millis(5001));
        rig.event_loop.run_pending();

        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].render, "Write1");
        assert_eq!(reports[0].threads[0].node_name, "Grade1");
        assert_eq!(reports[0].threads[0].action, "render");
    }

    #[test]
    fn registered_thread_is_released_after_render() {
        let rig = TestLoop::new();
        let (_source, _filter, output) = chain();
        let invocation =
            RenderInvocation::construct(RenderRequest::new(output.node()), &rig.env()).unwrap();
        let worker = Arc::new(WorkerThread::new(WorkerId(5), "render-5"));
        let remote = Arc::clone(&invocation);
        let recorded = worker.clone();
        let planes = thread::spawn(move || {
            let _registration = remote.register_current_thread(worker);
            remote.launch(None, None)
        })
        .join()
        .unwrap()
        .unwrap();
        assert_eq!(planes.len(), 1);
        assert_eq!(invocation.supervisor().worker_count(), 0);
        assert!(recorded.current_action().is_none());
        assert_eq!(recorded.current_render().unwrap().id(), invocation.id());
    }
}
