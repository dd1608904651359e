//! Interfaces the engine consumes from the node graph.
//!
//! The editor owns nodes and their live parameters; the engine only reads
//! the graph shape, snapshots parameters, and calls into the node's
//! [`Effect`] for the actions of a render.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::invocation::NodeScope;
use crate::types::{LayerSet, OutputPlanes, PlaneRequest, RectD};

/// Stable identity of a node inside its project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type NodeRef = Arc<dyn Node>;

/// A vertex of the compositing graph.
pub trait Node: Send + Sync {
    fn id(&self) -> NodeId;

    /// Fully qualified name, used in diagnostics.
    fn name(&self) -> String;

    fn plugin_id(&self) -> String;

    /// False once the node has been removed from the graph.
    fn is_activated(&self) -> bool;

    /// False while the editor is still constructing the node.
    fn is_node_created(&self) -> bool;

    /// Container nodes must be flattened away before a render is built.
    fn is_group(&self) -> bool {
        false
    }

    fn max_input_count(&self) -> usize;

    fn input(&self, slot: usize) -> Option<NodeRef>;

    /// The computation capability of the node, if any.
    fn effect(&self) -> Option<Arc<dyn Effect>>;

    /// Every node referenced by expressions on this node's parameters,
    /// followed transitively through other expressions.
    fn expression_dependencies(&self) -> Vec<NodeRef>;

    /// Copy of the parameter values as they are right now.
    fn snapshot_parameters(&self) -> ParamSnapshot;
}

/// Broad classification of an effect, used by stall detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum EffectKind {
    #[default]
    Filter,
    Generator,
    /// Reads frames from files.
    Reader,
    /// Writes frames to files.
    Writer,
}

impl EffectKind {
    pub fn is_file_io(self) -> bool {
        matches!(self, EffectKind::Reader | EffectKind::Writer)
    }
}

/// Actions a render performs on a node. Errors are reported by the engine
/// as query or compute failures of the whole launch.
pub trait Effect: Send + Sync {
    fn kind(&self) -> EffectKind {
        EffectKind::Filter
    }

    fn region_of_definition(&self, scope: &NodeScope<'_>) -> Result<RectD>;

    fn layers(&self, scope: &NodeScope<'_>) -> Result<LayerSet>;

    /// Area each connected input must provide so that `roi` can be computed.
    /// By default every connected input is asked for `roi` unchanged.
    fn regions_of_interest(&self, scope: &NodeScope<'_>, roi: &RectD) -> Result<Vec<(usize, RectD)>> {
        Ok(scope
            .connected_inputs()
            .into_iter()
            .map(|slot| (slot, *roi))
            .collect())
    }

    fn aspect_ratio(&self, _scope: &NodeScope<'_>) -> f64 {
        1.0
    }

    fn render(&self, scope: &NodeScope<'_>, request: &PlaneRequest) -> Result<OutputPlanes>;
}

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
    Color([f64; 4]),
}

/// Frozen copy of a node's parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParamSnapshot(BTreeMap<String, ParamValue>);

impl ParamSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn double(&self, name: &str) -> Option<f64> {
        match self.0.get(name)? {
            ParamValue::Double(value) => Some(*value),
            ParamValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.0.get(name)? {
            ParamValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.0.get(name)? {
            ParamValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.0.get(name)? {
            ParamValue::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }
}
