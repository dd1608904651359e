use std::collections::HashSet;
use std::sync::Arc;

use crate::context::{ContextMap, RenderNodeContext};
use crate::error::{ContextError, TreeBuildError};
use crate::node::{NodeId, NodeRef};

/// Flattens the graph upstream of a node into render contexts.
///
/// Each call to [`TreeBuilder::build`] is one depth-first traversal with its
/// own visited set; contexts are looked up in (or added to) the shared
/// [`ContextMap`], so a node reached through several paths, or through
/// several builds of the same invocation, always resolves to one context.
pub struct TreeBuilder<'a> {
    contexts: &'a mut ContextMap,
    visited: HashSet<NodeId>,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(contexts: &'a mut ContextMap) -> Self {
        Self {
            contexts,
            visited: HashSet::new(),
        }
    }

    pub fn build(&mut self, root: &NodeRef) -> Result<Arc<RenderNodeContext>, TreeBuildError> {
        self.visited.clear();
        let context = self.visit(root)?;
        tracing::debug!(
            root = %root.name(),
            contexts = self.contexts.len(),
            "render tree built"
        );
        Ok(context)
    }

    fn visit(&mut self, node: &NodeRef) -> Result<Arc<RenderNodeContext>, TreeBuildError> {
        let id = node.id();
        if !node.is_node_created() {
            return Err(TreeBuildError::NodeNotCreated {
                id,
                name: node.name(),
            });
        }
        if node.effect().is_none() {
            return Err(TreeBuildError::NoEffect {
                id,
                name: node.name(),
            });
        }
        if node.is_group() {
            return Err(TreeBuildError::UnflattenedGroup {
                id,
                name: node.name(),
            });
        }

        if self.visited.contains(&id) {
            return self
                .contexts
                .get(id)
                .cloned()
                .ok_or(TreeBuildError::Context(ContextError::Missing(id)));
        }
        self.visited.insert(id);

        let context = self
            .contexts
            .get_or_create(node)
            .ok_or_else(|| TreeBuildError::NodeNotCreated {
                id,
                name: node.name(),
            })?;

        // Cycles are caught on the wired contexts: an edge is refused when
        // the input already reads from this node.
        for slot in 0..node.max_input_count() {
            let Some(input) = node.input(slot) else {
                continue;
            };
            if !input.is_activated() {
                continue;
            }
            let input_context = self.visit(&input)?;
            match context.set_input_context(slot, input_context) {
                Ok(()) => {}
                Err(ContextError::Cycle { .. }) => {
                    return Err(TreeBuildError::InputCycle {
                        id,
                        name: node.name(),
                    })
                }
                Err(err) => return Err(err.into()),
            }
        }

        // Expression targets get a frozen context but no edge.
        for dependency in node.expression_dependencies() {
            if dependency.is_activated() {
                self.visit(&dependency)?;
            }
        }

        Ok(context)
    }
}
