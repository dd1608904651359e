//! In-memory graph used by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{bail, Result};
use renderconfig::EngineConfig;
use scheduler::{EventLoop, ManualClock};

use crate::abort::{StallReport, StallReporter, StallResponse};
use crate::context::current_context;
use crate::invocation::{NodeScope, RenderEnvironment};
use crate::node::{Effect, EffectKind, Node, NodeId, NodeRef, ParamSnapshot, ParamValue};
use crate::types::{ImagePlane, Layer, LayerSet, OutputPlanes, PlaneRequest, RectD};

type Hook = Box<dyn Fn() + Send + Sync>;

pub(crate) struct MockEffect {
    kind: EffectKind,
    region: Mutex<RectD>,
    aspect_ratio: Mutex<f64>,
    roi_margin: Mutex<f64>,
    fail_rod: AtomicBool,
    fail_layers: AtomicBool,
    fail_render: AtomicBool,
    render_calls: AtomicUsize,
    seen_gains: Mutex<Vec<Option<f64>>>,
    before_render: Mutex<Option<Hook>>,
    bound_actions: Mutex<Vec<&'static str>>,
}

impl MockEffect {
    fn new(kind: EffectKind) -> Self {
        Self {
            kind,
            region: Mutex::new(RectD::new(0.0, 0.0, 100.0, 100.0)),
            aspect_ratio: Mutex::new(1.0),
            roi_margin: Mutex::new(0.0),
            fail_rod: AtomicBool::new(false),
            fail_layers: AtomicBool::new(false),
            fail_render: AtomicBool::new(false),
            render_calls: AtomicUsize::new(0),
            seen_gains: Mutex::new(Vec::new()),
            before_render: Mutex::new(None),
            bound_actions: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn fail_region_of_definition(&self) {
        self.fail_rod.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_layers(&self) {
        self.fail_layers.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_render(&self) {
        self.fail_render.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_region_of_definition(&self, region: RectD) {
        *self.region.lock().unwrap() = region;
    }

    pub(crate) fn set_aspect_ratio(&self, par: f64) {
        *self.aspect_ratio.lock().unwrap() = par;
    }

    /// Grows the region asked of every input by `margin` on each side.
    pub(crate) fn set_roi_margin(&self, margin: f64) {
        *self.roi_margin.lock().unwrap() = margin;
    }

    pub(crate) fn before_render(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.before_render.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn render_calls(&self) -> usize {
        self.render_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn seen_gains(&self) -> Vec<Option<f64>> {
        self.seen_gains.lock().unwrap().clone()
    }

    /// Actions that found their own context bound to the calling thread.
    pub(crate) fn bound_actions(&self) -> Vec<&'static str> {
        self.bound_actions.lock().unwrap().clone()
    }

    fn note_binding(&self, scope: &NodeScope<'_>, action: &'static str) {
        let bound = current_context(scope.node().id())
            .is_some_and(|current| Arc::ptr_eq(&current, scope.context()));
        if bound {
            self.bound_actions.lock().unwrap().push(action);
        }
    }
}

impl Effect for MockEffect {
    fn kind(&self) -> EffectKind {
        self.kind
    }

    fn region_of_definition(&self, scope: &NodeScope<'_>) -> Result<RectD> {
        self.note_binding(scope, "region_of_definition");
        if self.fail_rod.load(Ordering::SeqCst) {
            bail!("region of definition unavailable");
        }
        Ok(*self.region.lock().unwrap())
    }

    fn layers(&self, scope: &NodeScope<'_>) -> Result<LayerSet> {
        self.note_binding(scope, "layers");
        if self.fail_layers.load(Ordering::SeqCst) {
            bail!("layer query failed");
        }
        Ok(LayerSet::producing([Layer::rgba()]))
    }

    fn regions_of_interest(&self, scope: &NodeScope<'_>, roi: &RectD) -> Result<Vec<(usize, RectD)>> {
        self.note_binding(scope, "regions_of_interest");
        let margin = *self.roi_margin.lock().unwrap();
        let grown = RectD::new(roi.x1 - margin, roi.y1 - margin, roi.x2 + margin, roi.y2 + margin);
        Ok(scope
            .connected_inputs()
            .into_iter()
            .map(|slot| (slot, grown))
            .collect())
    }

    fn aspect_ratio(&self, _scope: &NodeScope<'_>) -> f64 {
        *self.aspect_ratio.lock().unwrap()
    }

    fn render(&self, scope: &NodeScope<'_>, request: &PlaneRequest) -> Result<OutputPlanes> {
        self.render_calls.fetch_add(1, Ordering::SeqCst);
        self.note_binding(scope, "render");
        if let Some(hook) = self.before_render.lock().unwrap().as_ref() {
            hook();
        }
        let gain = scope.parameters().double("gain");
        self.seen_gains.lock().unwrap().push(gain);

        let mut value = gain.unwrap_or(1.0) as f32;
        for slot in scope.connected_inputs() {
            let Some(input_request) = scope.input_request(slot, &request.layers) else {
                continue;
            };
            let upstream = scope.render_input(slot, &input_request)?;
            value += upstream
                .values()
                .next()
                .and_then(|plane| plane.samples.first().copied())
                .unwrap_or(0.0);
        }
        if self.fail_render.load(Ordering::SeqCst) {
            bail!("mock render failure");
        }
        Ok(request
            .layers
            .iter()
            .map(|layer| {
                let plane = ImagePlane::filled(layer.clone(), request.roi, scope.scale(), value);
                (layer.clone(), plane)
            })
            .collect())
    }
}

pub(crate) struct MockNode {
    id: NodeId,
    name: String,
    plugin_id: String,
    max_inputs: usize,
    activated: AtomicBool,
    created: AtomicBool,
    group: AtomicBool,
    inputs: Mutex<Vec<Option<Arc<MockNode>>>>,
    expressions: Mutex<Vec<Weak<MockNode>>>,
    effect: Option<Arc<MockEffect>>,
    params: Mutex<ParamSnapshot>,
    snapshot_calls: AtomicUsize,
}

impl MockNode {
    fn build(id: u64, name: &str, max_inputs: usize, kind: Option<EffectKind>) -> Arc<Self> {
        let plugin_id = match kind {
            Some(kind) => format!("test.{kind:?}").to_lowercase(),
            None => "test.dot".to_string(),
        };
        Arc::new(Self {
            id: NodeId(id),
            name: name.to_string(),
            plugin_id,
            max_inputs,
            activated: AtomicBool::new(true),
            created: AtomicBool::new(true),
            group: AtomicBool::new(false),
            inputs: Mutex::new(vec![None; max_inputs]),
            expressions: Mutex::new(Vec::new()),
            effect: kind.map(|kind| Arc::new(MockEffect::new(kind))),
            params: Mutex::new(ParamSnapshot::new()),
            snapshot_calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn source(id: u64, name: &str) -> Arc<Self> {
        Self::build(id, name, 0, Some(EffectKind::Generator))
    }

    pub(crate) fn filter(id: u64, name: &str) -> Arc<Self> {
        Self::build(id, name, 1, Some(EffectKind::Filter))
    }

    pub(crate) fn merge(id: u64, name: &str) -> Arc<Self> {
        Self::build(id, name, 2, Some(EffectKind::Filter))
    }

    pub(crate) fn with_kind(id: u64, name: &str, kind: EffectKind) -> Arc<Self> {
        Self::build(id, name, 1, Some(kind))
    }

    pub(crate) fn without_effect(id: u64, name: &str) -> Arc<Self> {
        Self::build(id, name, 1, None)
    }

    pub(crate) fn node(self: &Arc<Self>) -> NodeRef {
        Arc::clone(self) as NodeRef
    }

    pub(crate) fn into_ref(self: Arc<Self>) -> NodeRef {
        self
    }

    pub(crate) fn effect_handle(&self) -> Arc<MockEffect> {
        Arc::clone(self.effect.as_ref().expect("mock node has an effect"))
    }

    pub(crate) fn connect(&self, slot: usize, input: &Arc<MockNode>) {
        self.inputs.lock().unwrap()[slot] = Some(Arc::clone(input));
    }

    pub(crate) fn disconnect(&self, slot: usize) {
        self.inputs.lock().unwrap()[slot] = None;
    }

    pub(crate) fn add_expression_dependency(&self, target: &Arc<MockNode>) {
        self.expressions.lock().unwrap().push(Arc::downgrade(target));
    }

    pub(crate) fn set_activated(&self, activated: bool) {
        self.activated.store(activated, Ordering::SeqCst);
    }

    pub(crate) fn set_created(&self, created: bool) {
        self.created.store(created, Ordering::SeqCst);
    }

    pub(crate) fn set_group(&self, group: bool) {
        self.group.store(group, Ordering::SeqCst);
    }

    pub(crate) fn set_param(&self, name: &str, value: ParamValue) {
        self.params.lock().unwrap().insert(name, value);
    }

    pub(crate) fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }
}

impl Node for MockNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn plugin_id(&self) -> String {
        self.plugin_id.clone()
    }

    fn is_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    fn is_node_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    fn is_group(&self) -> bool {
        self.group.load(Ordering::SeqCst)
    }

    fn max_input_count(&self) -> usize {
        self.max_inputs
    }

    fn input(&self, slot: usize) -> Option<NodeRef> {
        let inputs = self.inputs.lock().unwrap();
        inputs.get(slot)?.as_ref().map(|node| Arc::clone(node) as NodeRef)
    }

    fn effect(&self) -> Option<Arc<dyn Effect>> {
        self.effect
            .as_ref()
            .map(|effect| Arc::clone(effect) as Arc<dyn Effect>)
    }

    fn expression_dependencies(&self) -> Vec<NodeRef> {
        self.expressions
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|node| node as NodeRef)
            .collect()
    }

    fn snapshot_parameters(&self) -> ParamSnapshot {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        self.params.lock().unwrap().clone()
    }
}

/// Collects stall reports and answers with a fixed response.
pub(crate) struct RecordingReporter {
    response: StallResponse,
    reports: Mutex<Vec<StallReport>>,
}

impl RecordingReporter {
    pub(crate) fn answering(response: StallResponse) -> Self {
        Self {
            response,
            reports: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn reports(&self) -> Vec<StallReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl StallReporter for RecordingReporter {
    fn on_stall(&self, report: &StallReport) -> StallResponse {
        self.reports.lock().unwrap().push(report.clone());
        self.response
    }
}

/// Owner-thread loop driven by a manual clock.
pub(crate) struct TestLoop {
    pub(crate) event_loop: EventLoop,
    pub(crate) clock: Arc<ManualClock>,
}

impl TestLoop {
    pub(crate) fn new() -> Self {
        let clock = Arc::new(ManualClock::new());
        Self {
            event_loop: EventLoop::with_clock(clock.clone()),
            clock,
        }
    }

    pub(crate) fn env(&self) -> RenderEnvironment {
        RenderEnvironment::new(EngineConfig::default(), self.event_loop.handle())
    }
}
