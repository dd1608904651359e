//! Effects behind the demo node kinds.
//!
//! Planes hold one `f32` per pixel. `reader` and `writer` stand in for file
//! I/O and `stall` for a plug-in that takes its time honouring an abort.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use serde::Deserialize;
use treerender::{
    Effect, EffectKind, ImagePlane, Layer, LayerSet, NodeScope, OutputPlanes, PlaneRequest, RectD,
    RectI, RenderError,
};

const DEFAULT_SIZE: i64 = 256;
const STALL_STEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DemoKind {
    Constant,
    Gain,
    Merge,
    Reader,
    Writer,
    Stall,
}

impl DemoKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DemoKind::Constant => "constant",
            DemoKind::Gain => "gain",
            DemoKind::Merge => "merge",
            DemoKind::Reader => "reader",
            DemoKind::Writer => "writer",
            DemoKind::Stall => "stall",
        }
    }

    pub fn max_inputs(self) -> usize {
        match self {
            DemoKind::Constant | DemoKind::Reader => 0,
            DemoKind::Gain | DemoKind::Writer | DemoKind::Stall => 1,
            DemoKind::Merge => 2,
        }
    }
}

#[derive(Debug)]
pub struct DemoEffect {
    kind: DemoKind,
}

impl DemoEffect {
    pub fn new(kind: DemoKind) -> Self {
        Self { kind }
    }

    fn format(scope: &NodeScope<'_>) -> RectD {
        let params = scope.parameters();
        let width = params.int("width").unwrap_or(DEFAULT_SIZE);
        let height = params.int("height").unwrap_or(DEFAULT_SIZE);
        RectD::new(0.0, 0.0, width as f64, height as f64)
    }

    fn inputs_union(scope: &NodeScope<'_>) -> Result<RectD> {
        let mut region = RectD::default();
        for slot in scope.connected_inputs() {
            region = region.union(&scope.input_region_of_definition(slot)?);
        }
        Ok(region)
    }

    fn render_inputs(scope: &NodeScope<'_>, request: &PlaneRequest) -> Result<Vec<ImagePlane>> {
        let mut planes = Vec::new();
        for slot in scope.connected_inputs() {
            let Some(input_request) = scope.input_request(slot, &request.layers) else {
                continue;
            };
            let mut upstream = scope.render_input(slot, &input_request)?;
            if let Some(plane) = request
                .layers
                .first()
                .and_then(|layer| upstream.remove(layer))
            {
                planes.push(plane);
            }
        }
        Ok(planes)
    }
}

impl Effect for DemoEffect {
    fn kind(&self) -> EffectKind {
        match self.kind {
            DemoKind::Constant => EffectKind::Generator,
            DemoKind::Reader => EffectKind::Reader,
            DemoKind::Writer => EffectKind::Writer,
            DemoKind::Gain | DemoKind::Merge | DemoKind::Stall => EffectKind::Filter,
        }
    }

    fn region_of_definition(&self, scope: &NodeScope<'_>) -> Result<RectD> {
        match self.kind {
            DemoKind::Constant => Ok(Self::format(scope)),
            DemoKind::Reader => {
                if let Some(path) = scope.parameters().text("path") {
                    if !Path::new(path).exists() {
                        bail!("cannot open '{path}'");
                    }
                }
                Ok(Self::format(scope))
            }
            DemoKind::Stall if scope.connected_inputs().is_empty() => Ok(Self::format(scope)),
            DemoKind::Gain | DemoKind::Merge | DemoKind::Writer | DemoKind::Stall => {
                Self::inputs_union(scope)
            }
        }
    }

    fn layers(&self, _scope: &NodeScope<'_>) -> Result<LayerSet> {
        let mut layers = LayerSet::producing([Layer::rgba()]);
        for slot in 0..self.kind.max_inputs() {
            layers.needed.insert(slot, vec![Layer::rgba()]);
        }
        Ok(layers)
    }

    fn regions_of_interest(&self, scope: &NodeScope<'_>, roi: &RectD) -> Result<Vec<(usize, RectD)>> {
        let mut regions = Vec::new();
        for slot in scope.connected_inputs() {
            let defined = scope.input_region_of_definition(slot)?;
            if let Some(needed) = roi.intersect(&defined) {
                regions.push((slot, needed));
            }
        }
        Ok(regions)
    }

    fn aspect_ratio(&self, scope: &NodeScope<'_>) -> f64 {
        scope.parameters().double("par").unwrap_or(1.0)
    }

    fn render(&self, scope: &NodeScope<'_>, request: &PlaneRequest) -> Result<OutputPlanes> {
        let params = scope.parameters();
        let mut samples = match self.kind {
            DemoKind::Constant => fill(request.roi, params.double("value").unwrap_or(1.0) as f32),
            DemoKind::Reader => {
                // File I/O does not look at the abort flag.
                if let Some(delay) = params.int("delay_ms") {
                    thread::sleep(Duration::from_millis(delay.max(0) as u64));
                }
                fill(request.roi, params.double("value").unwrap_or(1.0) as f32)
            }
            DemoKind::Gain => {
                let gain = params.double("gain").unwrap_or(1.0) as f32;
                let inputs = Self::render_inputs(scope, request)?;
                combine(request.roi, &inputs, |value| value * gain)
            }
            DemoKind::Merge => {
                let inputs = Self::render_inputs(scope, request)?;
                combine(request.roi, &inputs, |value| value)
            }
            DemoKind::Writer => {
                let inputs = Self::render_inputs(scope, request)?;
                if let Some(delay) = params.int("delay_ms") {
                    thread::sleep(Duration::from_millis(delay.max(0) as u64));
                }
                combine(request.roi, &inputs, |value| value)
            }
            DemoKind::Stall => {
                let seconds = params.double("seconds").unwrap_or(1.0).max(0.0);
                let honour_abort = params.bool("honor_abort").unwrap_or(false);
                let until = Instant::now() + Duration::from_secs_f64(seconds);
                while Instant::now() < until {
                    if honour_abort && scope.is_aborted() {
                        return Err(RenderError::Aborted.into());
                    }
                    thread::sleep(STALL_STEP);
                }
                let inputs = Self::render_inputs(scope, request)?;
                if inputs.is_empty() {
                    fill(request.roi, params.double("value").unwrap_or(1.0) as f32)
                } else {
                    combine(request.roi, &inputs, |value| value)
                }
            }
        };
        if scope.handles_nans() {
            replace_nans(&mut samples);
        }

        Ok(request
            .layers
            .iter()
            .map(|layer| {
                let plane = ImagePlane {
                    layer: layer.clone(),
                    bounds: request.roi,
                    scale: scope.scale(),
                    samples: samples.clone(),
                };
                (layer.clone(), plane)
            })
            .collect())
    }
}

fn fill(bounds: RectI, value: f32) -> Vec<f32> {
    vec![value; bounds.area()]
}

/// Sums the inputs pixel by pixel over `bounds`, then applies `map`.
fn combine(bounds: RectI, inputs: &[ImagePlane], map: impl Fn(f32) -> f32) -> Vec<f32> {
    let mut samples = Vec::with_capacity(bounds.area());
    for y in bounds.y1..bounds.y2 {
        for x in bounds.x1..bounds.x2 {
            let sum: f32 = inputs.iter().map(|plane| sample_at(plane, x, y)).sum();
            samples.push(map(sum));
        }
    }
    samples
}

fn replace_nans(samples: &mut [f32]) {
    for sample in samples.iter_mut().filter(|sample| sample.is_nan()) {
        *sample = 0.0;
    }
}

/// Zero outside the plane.
fn sample_at(plane: &ImagePlane, x: i32, y: i32) -> f32 {
    let bounds = plane.bounds;
    if x < bounds.x1 || x >= bounds.x2 || y < bounds.y1 || y >= bounds.y2 {
        return 0.0;
    }
    let index = (y - bounds.y1) as usize * bounds.width() as usize + (x - bounds.x1) as usize;
    plane.samples.get(index).copied().unwrap_or(0.0)
}
