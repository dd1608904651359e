use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Frame time at which a graph is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize)]
pub struct TimeValue(pub f64);

/// Index of the view (eye) being rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct ViewIdx(pub usize);

/// Resolution scale applied when going from canonical to pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RenderScale {
    pub x: f64,
    pub y: f64,
}

impl RenderScale {
    pub fn uniform(scale: f64) -> Self {
        Self { x: scale, y: scale }
    }
}

impl Default for RenderScale {
    fn default() -> Self {
        Self::uniform(1.0)
    }
}

/// Rectangle in canonical (resolution independent) coordinates.
///
/// `x2`/`y2` are exclusive; a rectangle with no area is "null" and acts as
/// the identity for [`RectD::union`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct RectD {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl RectD {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    pub fn is_null(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    pub fn union(&self, other: &RectD) -> RectD {
        if other.is_null() {
            return *self;
        }
        if self.is_null() {
            return *other;
        }
        RectD {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
        }
    }

    pub fn intersect(&self, other: &RectD) -> Option<RectD> {
        let rect = RectD {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        };
        (!rect.is_null()).then_some(rect)
    }

    /// Smallest pixel rectangle covering this one at `scale`, with x
    /// divided by the pixel aspect ratio `par`.
    pub fn to_pixel_enclosing(&self, scale: RenderScale, par: f64) -> RectI {
        let par = if par > 0.0 { par } else { 1.0 };
        RectI {
            x1: (self.x1 * scale.x / par).floor() as i32,
            y1: (self.y1 * scale.y).floor() as i32,
            x2: (self.x2 * scale.x / par).ceil() as i32,
            y2: (self.y2 * scale.y).ceil() as i32,
        }
    }
}

/// Rectangle in device pixels, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct RectI {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl RectI {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        (self.x2 - self.x1).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y2 - self.y1).max(0)
    }

    pub fn is_null(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    pub fn area(&self) -> usize {
        self.width() as usize * self.height() as usize
    }
}

/// Named channel set a node produces or consumes (e.g. `RGBA`, `Forward.Motion`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Layer(String);

impl Layer {
    pub fn new(name: impl Into<String>) -> Self {
        Layer(name.into())
    }

    pub fn rgba() -> Self {
        Layer::new("RGBA")
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of the layer query on a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerSet {
    /// Layers needed from each input slot.
    pub needed: BTreeMap<usize, Vec<Layer>>,
    /// Layers this node writes.
    pub produced: Vec<Layer>,
}

impl LayerSet {
    pub fn producing(layers: impl IntoIterator<Item = Layer>) -> Self {
        Self {
            needed: BTreeMap::new(),
            produced: layers.into_iter().collect(),
        }
    }
}

/// Image data produced for one layer.
///
/// The sample layout is owned by the effect that produced it; the engine
/// only moves planes around.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePlane {
    pub layer: Layer,
    pub bounds: RectI,
    pub scale: RenderScale,
    pub samples: Vec<f32>,
}

impl ImagePlane {
    /// A plane covering `bounds` with one sample per pixel set to `value`.
    pub fn filled(layer: Layer, bounds: RectI, scale: RenderScale, value: f32) -> Self {
        Self {
            layer,
            bounds,
            scale,
            samples: vec![value; bounds.area()],
        }
    }
}

/// Images produced by a launch, keyed by layer.
pub type OutputPlanes = BTreeMap<Layer, ImagePlane>;

/// What a node is asked to compute.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneRequest {
    pub roi: RectI,
    pub layers: Vec<Layer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_enclosing_rounds_outwards() {
        let rect = RectD::new(0.5, -0.5, 10.2, 20.7);
        let pixels = rect.to_pixel_enclosing(RenderScale::default(), 1.0);
        assert_eq!(pixels, RectI::new(0, -1, 11, 21));
    }

    #[test]
    fn pixel_enclosing_applies_scale_and_aspect() {
        let rect = RectD::new(0.0, 0.0, 1920.0, 1080.0);
        let pixels = rect.to_pixel_enclosing(RenderScale::uniform(0.5), 2.0);
        assert_eq!(pixels, RectI::new(0, 0, 480, 540));
    }

    #[test]
    fn union_ignores_null_rects() {
        let a = RectD::new(0.0, 0.0, 10.0, 10.0);
        let null = RectD::default();
        assert_eq!(a.union(&null), a);
        assert_eq!(null.union(&a), a);
        let b = RectD::new(5.0, -5.0, 20.0, 8.0);
        assert_eq!(a.union(&b), RectD::new(0.0, -5.0, 20.0, 10.0));
    }

    #[test]
    fn intersect_reports_disjoint_rects() {
        let a = RectD::new(0.0, 0.0, 10.0, 10.0);
        let b = RectD::new(20.0, 20.0, 30.0, 30.0);
        assert!(a.intersect(&b).is_none());
        assert_eq!(
            a.intersect(&RectD::new(5.0, 5.0, 15.0, 15.0)),
            Some(RectD::new(5.0, 5.0, 10.0, 10.0))
        );
    }
}
