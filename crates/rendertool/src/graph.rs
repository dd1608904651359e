//! Demo node graphs described in TOML.
//!
//! ```toml
//! root = "Write1"
//!
//! [[node]]
//! name = "Constant1"
//! kind = "constant"
//! params = { value = 0.25, width = 64, height = 32 }
//!
//! [[node]]
//! name = "Write1"
//! kind = "writer"
//! inputs = ["Constant1"]
//! ```
//!
//! Inputs and expression links are kept as weak references; the [`Graph`]
//! owns every node.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use treerender::{Effect, Node, NodeId, NodeRef, ParamSnapshot, ParamValue};

use crate::effects::{DemoEffect, DemoKind};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GraphFile {
    root: Option<String>,
    #[serde(default, rename = "node")]
    nodes: Vec<NodeSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeSpec {
    name: String,
    kind: DemoKind,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    expressions: Vec<String>,
    #[serde(default)]
    params: BTreeMap<String, toml::Value>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub struct DemoNode {
    id: NodeId,
    name: String,
    kind: DemoKind,
    enabled: bool,
    inputs: OnceLock<Vec<Option<Weak<DemoNode>>>>,
    expressions: OnceLock<Vec<Weak<DemoNode>>>,
    params: Mutex<ParamSnapshot>,
    effect: Arc<DemoEffect>,
}

impl Node for DemoNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn plugin_id(&self) -> String {
        format!("demo.{}", self.kind.as_str())
    }

    fn is_activated(&self) -> bool {
        self.enabled
    }

    fn is_node_created(&self) -> bool {
        self.inputs.get().is_some()
    }

    fn max_input_count(&self) -> usize {
        self.kind.max_inputs()
    }

    fn input(&self, slot: usize) -> Option<NodeRef> {
        let input = self.inputs.get()?.get(slot)?.as_ref()?.upgrade()?;
        Some(input)
    }

    fn effect(&self) -> Option<Arc<dyn Effect>> {
        Some(Arc::clone(&self.effect) as Arc<dyn Effect>)
    }

    fn expression_dependencies(&self) -> Vec<NodeRef> {
        self.expressions
            .get()
            .map(|targets| {
                targets
                    .iter()
                    .filter_map(Weak::upgrade)
                    .map(|node| node as NodeRef)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn snapshot_parameters(&self) -> ParamSnapshot {
        self.params
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct Graph {
    nodes: Vec<Arc<DemoNode>>,
    by_name: HashMap<String, usize>,
    root: Option<String>,
}

impl Graph {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read graph file at {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("failed to load graph file at {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: GraphFile = toml::from_str(contents).context("invalid graph TOML")?;
        if file.nodes.is_empty() {
            bail!("graph has no nodes");
        }

        let mut by_name = HashMap::new();
        let mut nodes = Vec::with_capacity(file.nodes.len());
        for (index, spec) in file.nodes.iter().enumerate() {
            if by_name.insert(spec.name.clone(), index).is_some() {
                bail!("duplicate node name '{}'", spec.name);
            }
            let params = convert_params(&spec.params)
                .with_context(|| format!("invalid parameters on node '{}'", spec.name))?;
            nodes.push(Arc::new(DemoNode {
                id: NodeId(index as u64 + 1),
                name: spec.name.clone(),
                kind: spec.kind,
                enabled: spec.enabled,
                inputs: OnceLock::new(),
                expressions: OnceLock::new(),
                params: Mutex::new(params),
                effect: Arc::new(DemoEffect::new(spec.kind)),
            }));
        }

        let lookup = |owner: &str, name: &str| -> Result<Weak<DemoNode>> {
            by_name
                .get(name)
                .map(|&index| Arc::downgrade(&nodes[index]))
                .ok_or_else(|| anyhow!("node '{owner}' references unknown node '{name}'"))
        };

        for (spec, node) in file.nodes.iter().zip(&nodes) {
            let max = spec.kind.max_inputs();
            if spec.inputs.len() > max {
                bail!(
                    "node '{}' ({}) accepts at most {max} input(s), got {}",
                    spec.name,
                    spec.kind.as_str(),
                    spec.inputs.len()
                );
            }
            let mut inputs = vec![None; max];
            for (slot, name) in spec.inputs.iter().enumerate() {
                // An empty name leaves the slot unconnected.
                if !name.is_empty() {
                    inputs[slot] = Some(lookup(&spec.name, name)?);
                }
            }
            let expressions = spec
                .expressions
                .iter()
                .map(|name| lookup(&spec.name, name))
                .collect::<Result<Vec<_>>>()?;
            let _ = node.inputs.set(inputs);
            let _ = node.expressions.set(expressions);
        }

        tracing::debug!(nodes = nodes.len(), root = ?file.root, "graph loaded");
        Ok(Self {
            nodes,
            by_name,
            root: file.root,
        })
    }

    /// The node to render: `name` if given, else the file's `root`, else the
    /// last node declared.
    pub fn root(&self, name: Option<&str>) -> Result<NodeRef> {
        let node = match name.or(self.root.as_deref()) {
            Some(name) => self.node(name)?,
            None => self
                .nodes
                .last()
                .ok_or_else(|| anyhow!("graph has no nodes"))?,
        };
        Ok(Arc::clone(node) as NodeRef)
    }

    pub fn node(&self, name: &str) -> Result<&Arc<DemoNode>> {
        self.by_name
            .get(name)
            .map(|&index| &self.nodes[index])
            .ok_or_else(|| anyhow!("no node named '{name}' in graph"))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

fn convert_params(raw: &BTreeMap<String, toml::Value>) -> Result<ParamSnapshot> {
    let mut params = ParamSnapshot::new();
    for (name, value) in raw {
        params.insert(name.as_str(), convert_value(name, value)?);
    }
    Ok(params)
}

fn convert_value(name: &str, value: &toml::Value) -> Result<ParamValue> {
    Ok(match value {
        toml::Value::Boolean(value) => ParamValue::Bool(*value),
        toml::Value::Integer(value) => ParamValue::Int(*value),
        toml::Value::Float(value) => ParamValue::Double(*value),
        toml::Value::String(value) => ParamValue::Text(value.clone()),
        toml::Value::Array(items) if items.len() == 4 => {
            let mut color = [0.0; 4];
            for (channel, item) in color.iter_mut().zip(items) {
                *channel = match item {
                    toml::Value::Float(value) => *value,
                    toml::Value::Integer(value) => *value as f64,
                    _ => bail!("parameter '{name}' must hold four numbers"),
                };
            }
            ParamValue::Color(color)
        }
        _ => bail!("parameter '{name}' has an unsupported type"),
    })
}
