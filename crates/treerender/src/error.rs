use std::fmt;

use crate::node::NodeId;

/// The render tree could not be built; no partial tree is kept.
#[derive(Debug, thiserror::Error)]
pub enum TreeBuildError {
    #[error("node '{name}' ({id}) is not fully created")]
    NodeNotCreated { id: NodeId, name: String },
    #[error("node '{name}' ({id}) has no computation capability")]
    NoEffect { id: NodeId, name: String },
    #[error("root node '{name}' ({id}) is not activated")]
    RootNotActivated { id: NodeId, name: String },
    #[error("group node '{name}' ({id}) reached the render tree without being flattened")]
    UnflattenedGroup { id: NodeId, name: String },
    #[error("node '{name}' ({id}) is its own upstream input")]
    InputCycle { id: NodeId, name: String },
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Invalid wiring of render-node contexts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("input slot {slot} of '{node}' is out of range (max {max})")]
    SlotOutOfRange { node: String, slot: usize, max: usize },
    #[error("input slot {slot} of '{node}' is already connected to another context")]
    SlotAlreadyConnected { node: String, slot: usize },
    #[error("context for '{child}' belongs to another render invocation than '{node}'")]
    ForeignInvocation { node: String, child: String },
    #[error("wiring '{child}' into '{node}' would close an input cycle")]
    Cycle { node: String, child: String },
    #[error("no render context exists for node {0}")]
    Missing(NodeId),
}

/// The engine-side query that failed during a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    RegionOfDefinition,
    Layers,
    RegionsOfInterest,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKind::RegionOfDefinition => f.write_str("region of definition"),
            QueryKind::Layers => f.write_str("layers"),
            QueryKind::RegionsOfInterest => f.write_str("regions of interest"),
        }
    }
}

/// Why a launch produced no images.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to build render tree: {0}")]
    TreeBuild(#[from] TreeBuildError),
    #[error("{query} query failed on '{node}'")]
    Query {
        query: QueryKind,
        node: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("compute failed on '{node}'")]
    Compute {
        node: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("input {slot} of '{node}' is not connected")]
    InputNotConnected { node: String, slot: usize },
    #[error("render was aborted")]
    Aborted,
}

impl RenderError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, RenderError::Aborted)
    }
}
