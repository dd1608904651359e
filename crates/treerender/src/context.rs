//! Per-(invocation, node) render state.
//!
//! A [`RenderNodeContext`] freezes everything about a node that may change
//! while a render is in flight: its parameters and its connections. It is
//! created the first time the tree builder reaches the node and then shared
//! by every consumer within the same invocation.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use crate::error::ContextError;
use crate::invocation::{InvocationId, RenderInvocation};
use crate::node::{Effect, NodeId, NodeRef, ParamSnapshot};
use crate::types::RectD;

pub struct RenderNodeContext {
    invocation_id: InvocationId,
    invocation: Weak<RenderInvocation>,
    node: NodeRef,
    effect: Arc<dyn Effect>,
    parameters: ParamSnapshot,
    inputs: Box<[OnceLock<Arc<RenderNodeContext>>]>,
    requested_roi: Mutex<Option<RectD>>,
    roi_visits: AtomicUsize,
}

impl std::fmt::Debug for RenderNodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderNodeContext")
            .field("invocation", &self.invocation_id)
            .field("node", &self.node.id())
            .field("parameters", &self.parameters.len())
            .finish_non_exhaustive()
    }
}

impl RenderNodeContext {
    /// Returns `None` when the node cannot take part in a render yet.
    fn create(
        invocation_id: InvocationId,
        invocation: Weak<RenderInvocation>,
        node: &NodeRef,
    ) -> Option<Arc<Self>> {
        if !node.is_node_created() {
            return None;
        }
        let effect = node.effect()?;
        let inputs = (0..node.max_input_count()).map(|_| OnceLock::new()).collect();
        Some(Arc::new(Self {
            invocation_id,
            invocation,
            node: Arc::clone(node),
            effect,
            parameters: node.snapshot_parameters(),
            inputs,
            requested_roi: Mutex::new(None),
            roi_visits: AtomicUsize::new(0),
        }))
    }

    pub fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }

    /// The owning invocation, if it is still alive.
    pub fn invocation(&self) -> Option<Arc<RenderInvocation>> {
        self.invocation.upgrade()
    }

    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id()
    }

    pub fn effect(&self) -> &Arc<dyn Effect> {
        &self.effect
    }

    pub fn parameters(&self) -> &ParamSnapshot {
        &self.parameters
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, slot: usize) -> Option<&Arc<RenderNodeContext>> {
        self.inputs.get(slot).and_then(OnceLock::get)
    }

    pub fn connected_inputs(&self) -> Vec<usize> {
        self.inputs
            .iter()
            .enumerate()
            .filter_map(|(slot, input)| input.get().map(|_| slot))
            .collect()
    }

    /// Wires `child` as the context feeding `slot`. Wiring the same child
    /// twice is accepted; anything else that would change an edge is not,
    /// and neither is an edge from a context that already reads from `self`.
    pub fn set_input_context(
        &self,
        slot: usize,
        child: Arc<RenderNodeContext>,
    ) -> Result<(), ContextError> {
        let Some(cell) = self.inputs.get(slot) else {
            return Err(ContextError::SlotOutOfRange {
                node: self.node.name(),
                slot,
                max: self.inputs.len(),
            });
        };
        if child.invocation_id != self.invocation_id {
            return Err(ContextError::ForeignInvocation {
                node: self.node.name(),
                child: child.node.name(),
            });
        }
        if child.reaches(self) {
            return Err(ContextError::Cycle {
                node: self.node.name(),
                child: child.node.name(),
            });
        }
        let wired = cell.get_or_init(|| Arc::clone(&child));
        if Arc::ptr_eq(wired, &child) {
            Ok(())
        } else {
            Err(ContextError::SlotAlreadyConnected {
                node: self.node.name(),
                slot,
            })
        }
    }

    /// Whether `target` is this context or upstream of it through wired inputs.
    fn reaches(&self, target: &RenderNodeContext) -> bool {
        let mut seen = HashSet::new();
        let mut pending: Vec<&RenderNodeContext> = vec![self];
        while let Some(context) = pending.pop() {
            if std::ptr::eq(context, target) {
                return true;
            }
            if !seen.insert(context as *const RenderNodeContext) {
                continue;
            }
            pending.extend(context.inputs.iter().filter_map(OnceLock::get).map(|input| &**input));
        }
        false
    }

    /// Converged region of interest for the current launch.
    pub fn requested_roi(&self) -> Option<RectD> {
        *self.requested_roi.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// How many times the region-of-interest pass processed this node.
    pub fn roi_visits(&self) -> usize {
        self.roi_visits.load(Ordering::Relaxed)
    }

    pub(crate) fn request_roi(&self, roi: &RectD) {
        let mut requested = self.requested_roi.lock().unwrap_or_else(PoisonError::into_inner);
        *requested = Some(match *requested {
            Some(existing) => existing.union(roi),
            None => *roi,
        });
    }

    pub(crate) fn reset_roi(&self) {
        *self.requested_roi.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.roi_visits.store(0, Ordering::Relaxed);
    }

    pub(crate) fn mark_roi_visit(&self) {
        self.roi_visits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Every context created for one invocation, keyed by node.
#[derive(Debug)]
pub struct ContextMap {
    invocation_id: InvocationId,
    invocation: Weak<RenderInvocation>,
    contexts: HashMap<NodeId, Arc<RenderNodeContext>>,
}

impl ContextMap {
    pub(crate) fn new(invocation_id: InvocationId, invocation: Weak<RenderInvocation>) -> Self {
        Self {
            invocation_id,
            invocation,
            contexts: HashMap::new(),
        }
    }

    /// Returns the existing context for `node`, creating it on first use.
    pub fn get_or_create(&mut self, node: &NodeRef) -> Option<Arc<RenderNodeContext>> {
        if let Some(existing) = self.contexts.get(&node.id()) {
            return Some(Arc::clone(existing));
        }
        let created =
            RenderNodeContext::create(self.invocation_id, self.invocation.clone(), node)?;
        tracing::trace!(node = %node.name(), invocation = ?self.invocation_id, "created render context");
        self.contexts.insert(node.id(), Arc::clone(&created));
        Some(created)
    }

    pub fn get(&self, node: NodeId) -> Option<&Arc<RenderNodeContext>> {
        self.contexts.get(&node)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RenderNodeContext>> {
        self.contexts.values()
    }
}

thread_local! {
    static ACTIVE: RefCell<HashMap<NodeId, Vec<Weak<RenderNodeContext>>>> =
        RefCell::new(HashMap::new());
}

/// Context the calling thread is currently computing `node` under.
pub fn current_context(node: NodeId) -> Option<Arc<RenderNodeContext>> {
    ACTIVE.with(|active| {
        active
            .borrow()
            .get(&node)
            .and_then(|stack| stack.last())
            .and_then(Weak::upgrade)
    })
}

/// Makes `context` the current one for its node on this thread until dropped.
pub(crate) fn bind(context: &Arc<RenderNodeContext>) -> ContextBinding {
    let node = context.node_id();
    ACTIVE.with(|active| {
        active
            .borrow_mut()
            .entry(node)
            .or_default()
            .push(Arc::downgrade(context));
    });
    ContextBinding {
        node,
        _not_send: PhantomData,
    }
}

pub(crate) struct ContextBinding {
    node: NodeId,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextBinding {
    fn drop(&mut self) {
        ACTIVE.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(stack) = active.get_mut(&self.node) {
                stack.pop();
                if stack.is_empty() {
                    active.remove(&self.node);
                }
            }
        });
    }
}
