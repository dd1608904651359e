use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::node::NodeId;

/// Receives timing information while a render runs. Called from worker
/// threads.
pub trait RenderStats: Send + Sync {
    fn record_node(&self, node: NodeId, name: &str, elapsed: Duration, succeeded: bool);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeTiming {
    pub node: NodeId,
    pub name: String,
    #[serde(with = "millis")]
    pub elapsed: Duration,
    pub succeeded: bool,
}

/// Keeps every record in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordedStats {
    timings: Mutex<Vec<NodeTiming>>,
}

impl RecordedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timings(&self) -> Vec<NodeTiming> {
        self.timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total(&self) -> Duration {
        self.timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|timing| timing.elapsed)
            .sum()
    }
}

impl RenderStats for RecordedStats {
    fn record_node(&self, node: NodeId, name: &str, elapsed: Duration, succeeded: bool) {
        self.timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(NodeTiming {
                node,
                name: name.to_string(),
                elapsed,
                succeeded,
            });
    }
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64() * 1000.0)
    }
}
