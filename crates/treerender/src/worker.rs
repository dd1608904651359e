use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::abort::{AbortableWorker, ActionInfo, WorkerId};
use crate::invocation::RenderInvocation;

type KillHook = Box<dyn Fn() + Send + Sync>;

/// Stock [`AbortableWorker`] for threads owned by an execution substrate.
///
/// Killing only raises a flag and runs the optional hook; a thread pool that
/// can really tear down a thread installs that teardown as the hook.
pub struct WorkerThread {
    id: WorkerId,
    name: String,
    action: Mutex<Option<ActionInfo>>,
    killed: AtomicBool,
    on_kill: Option<KillHook>,
    render: Mutex<Weak<RenderInvocation>>,
}

impl fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("killed", &self.is_killed())
            .finish_non_exhaustive()
    }
}

impl WorkerThread {
    pub fn new(id: WorkerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            action: Mutex::new(None),
            killed: AtomicBool::new(false),
            on_kill: None,
            render: Mutex::new(Weak::new()),
        }
    }

    pub fn with_kill_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_kill = Some(Box::new(hook));
        self
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// The invocation this worker was last told it serves, if still alive.
    pub fn current_render(&self) -> Option<Arc<RenderInvocation>> {
        self.render
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    /// Requests an abort of whatever this worker is rendering.
    pub fn abort_current_render(&self) -> bool {
        match self.current_render() {
            Some(render) => render.request_abort(),
            None => false,
        }
    }
}

impl AbortableWorker for WorkerThread {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn thread_name(&self) -> String {
        self.name.clone()
    }

    fn current_action(&self) -> Option<ActionInfo> {
        self.action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current_action(&self, action: Option<ActionInfo>) {
        *self.action.lock().unwrap_or_else(PoisonError::into_inner) = action;
    }

    fn kill(&self) {
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(hook) = &self.on_kill {
            hook();
        }
    }

    fn set_current_render(&self, render: Weak<RenderInvocation>) {
        *self.render.lock().unwrap_or_else(PoisonError::into_inner) = render;
    }
}
