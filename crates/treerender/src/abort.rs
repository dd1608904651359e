//! Cooperative cancellation and stall supervision for one invocation.
//!
//! Aborting only raises a flag; computations are expected to poll
//! [`AbortSupervisor::is_aborted`] and unwind. The first abort request also
//! arms a one-shot watchdog on the invocation's owner thread. If workers are
//! still registered when it fires and at least one of them is inside a node
//! action, a [`StallReport`] goes to the configured [`StallReporter`]:
//!
//! ```text
//!   request_abort() ──(first call only)──▶ arm watchdog on owner thread
//!                                                │ timeout
//!                                                ▼
//!            no workers / no node action / file I/O ──▶ silent
//!            otherwise ──▶ StallReport ──▶ reporter ──(interactive: Kill)──▶ kill()
//! ```
//!
//! The worker set and the watchdog state have separate locks that are never
//! held together.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use scheduler::{LoopHandle, TimerId};
use serde::Serialize;

use crate::invocation::RenderInvocation;
use crate::node::NodeRef;

/// Name used in user-facing stall reports.
pub const APPLICATION_NAME: &str = "treerender";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(pub u64);

/// What a worker is doing right now.
#[derive(Clone)]
pub struct ActionInfo {
    pub action: String,
    pub node: NodeRef,
}

impl fmt::Debug for ActionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionInfo")
            .field("action", &self.action)
            .field("node", &self.node.name())
            .finish()
    }
}

/// A thread that can execute work for an invocation.
pub trait AbortableWorker: Send + Sync {
    fn id(&self) -> WorkerId;

    fn thread_name(&self) -> String;

    /// `None` while the thread is idle or doing engine bookkeeping.
    fn current_action(&self) -> Option<ActionInfo>;

    fn set_current_action(&self, action: Option<ActionInfo>);

    /// Last-resort termination. May leave the process in a bad state.
    fn kill(&self);

    /// Tells the worker which invocation it is serving.
    fn set_current_render(&self, _render: Weak<RenderInvocation>) {}
}

/// One stalled thread in a [`StallReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StalledThread {
    pub thread_name: String,
    pub node_name: String,
    pub plugin_id: String,
    pub action: String,
}

/// Diagnostic produced when workers ignore an abort for too long.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StallReport {
    pub render: String,
    pub timeout_ms: u64,
    pub interactive: bool,
    pub threads: Vec<StalledThread>,
}

impl fmt::Display for StallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let timeout = humantime::format_duration(Duration::from_millis(self.timeout_ms));
        writeln!(
            f,
            "One or more renders stopped responding after {APPLICATION_NAME} tried to abort them for the last {timeout}."
        )?;
        writeln!(f, "This is likely due to a render taking too long in a plug-in.")?;
        writeln!(f)?;
        writeln!(f, "Stalled render(s) of '{}':", self.render)?;
        writeln!(f)?;
        for thread in &self.threads {
            writeln!(f, " - {} stalled in:", thread.thread_name)?;
            if !thread.node_name.is_empty() {
                writeln!(f, "    Node: {}", thread.node_name)?;
            }
            if !thread.plugin_id.is_empty() {
                writeln!(f, "    Plugin: {}", thread.plugin_id)?;
            }
            if !thread.action.is_empty() {
                writeln!(f, "    Action: {}", thread.action)?;
            }
            writeln!(f)?;
        }
        if self.interactive {
            writeln!(f, "Would you like to kill these renders?")?;
            writeln!(f)?;
            write!(
                f,
                "WARNING: Killing them may not work or may leave {APPLICATION_NAME} in a bad state. \
                 The application may crash or freeze as a consequence. Restarting is advised instead."
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallResponse {
    Ignore,
    Kill,
}

/// Receives stall reports. The response only matters in interactive mode.
pub trait StallReporter: Send + Sync {
    fn on_stall(&self, report: &StallReport) -> StallResponse;
}

/// Logs reports and never asks for a kill.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStallReporter;

impl StallReporter for LogStallReporter {
    fn on_stall(&self, report: &StallReport) -> StallResponse {
        tracing::warn!(
            render = %report.render,
            stalled = report.threads.len(),
            "{report}"
        );
        StallResponse::Ignore
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub timeout: Duration,
    pub interactive: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            timeout: renderconfig::DEFAULT_ABORT_TIMEOUT,
            interactive: false,
        }
    }
}

#[derive(Debug, Default)]
struct WatchdogState {
    started: bool,
    timer: Option<TimerId>,
}

pub struct AbortSupervisor {
    label: String,
    // Saturating count of abort requests; any value above zero means aborted.
    aborted: AtomicU32,
    watchdog_arms: AtomicUsize,
    threads: Mutex<BTreeMap<WorkerId, Arc<dyn AbortableWorker>>>,
    watchdog: Mutex<WatchdogState>,
    owner: LoopHandle,
    settings: SupervisorSettings,
    reporter: Arc<dyn StallReporter>,
}

impl fmt::Debug for AbortSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSupervisor")
            .field("label", &self.label)
            .field("aborted", &self.is_aborted())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl AbortSupervisor {
    pub fn new(
        label: impl Into<String>,
        owner: LoopHandle,
        settings: SupervisorSettings,
        reporter: Arc<dyn StallReporter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            aborted: AtomicU32::new(0),
            watchdog_arms: AtomicUsize::new(0),
            threads: Mutex::new(BTreeMap::new()),
            watchdog: Mutex::new(WatchdogState::default()),
            owner,
            settings,
            reporter,
        })
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire) > 0
    }

    /// Number of abort requests received so far.
    pub fn abort_requests(&self) -> u32 {
        self.aborted.load(Ordering::Acquire)
    }

    /// How many times the watchdog timer was actually started.
    pub fn watchdog_arms(&self) -> usize {
        self.watchdog_arms.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.threads().len()
    }

    /// Raises the abort flag. Returns true for the single call that moved
    /// the invocation out of the active state.
    pub fn request_abort(self: &Arc<Self>) -> bool {
        let previous = self
            .aborted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_add(1))
            })
            .unwrap_or_else(|count| count);
        if previous > 0 {
            return false;
        }

        let on_owner = {
            let mut watchdog = self.watchdog();
            watchdog.started = true;
            self.owner.is_owner_thread()
        };
        tracing::debug!(render = %self.label, on_owner, "abort requested");

        if on_owner {
            self.arm_watchdog();
        } else {
            let this = Arc::clone(self);
            if let Err(err) = self.owner.post(move || this.arm_watchdog()) {
                tracing::warn!(render = %self.label, %err, "abort watchdog could not be armed");
            }
        }
        true
    }

    pub fn register_thread(&self, worker: Arc<dyn AbortableWorker>) {
        let id = worker.id();
        self.threads().insert(id, worker);
        tracing::trace!(render = %self.label, ?id, "worker registered");
    }

    /// Returns whether `id` was registered. Removing the last worker stands
    /// the watchdog down.
    pub fn unregister_thread(&self, id: WorkerId) -> bool {
        let (removed, now_empty) = {
            let mut threads = self.threads();
            let removed = threads.remove(&id).is_some();
            (removed, threads.is_empty())
        };
        if now_empty {
            self.watchdog().started = false;
        }
        tracing::trace!(render = %self.label, ?id, removed, "worker unregistered");
        removed
    }

    /// Registers `worker` and makes it the calling thread's current worker
    /// until the returned guard is dropped.
    pub fn enter(self: &Arc<Self>, worker: Arc<dyn AbortableWorker>) -> WorkerRegistration {
        self.register_thread(Arc::clone(&worker));
        let previous = CURRENT_WORKER.with(|current| current.replace(Some(Arc::clone(&worker))));
        WorkerRegistration {
            supervisor: Arc::clone(self),
            id: worker.id(),
            previous,
            _not_send: PhantomData,
        }
    }

    fn arm_watchdog(self: &Arc<Self>) {
        self.watchdog_arms.fetch_add(1, Ordering::AcqRel);
        let this = Arc::clone(self);
        match self
            .owner
            .start_timer(self.settings.timeout, move || {
                this.on_watchdog_timeout();
            }) {
            Ok(timer) => self.watchdog().timer = Some(timer),
            Err(err) => {
                tracing::warn!(render = %self.label, %err, "abort watchdog could not be armed")
            }
        }
    }

    /// Inspects the workers still registered after the abort window.
    /// Returns the report handed to the reporter, if any.
    pub fn on_watchdog_timeout(&self) -> Option<StallReport> {
        {
            let mut watchdog = self.watchdog();
            watchdog.timer = None;
            if !watchdog.started {
                return None;
            }
        }

        let workers: Vec<Arc<dyn AbortableWorker>> = {
            let threads = self.threads();
            if threads.is_empty() {
                return None;
            }
            threads.values().cloned().collect()
        };

        let mut stalled = Vec::new();
        for worker in &workers {
            let Some(action) = worker.current_action() else {
                continue;
            };
            let file_io = action
                .node
                .effect()
                .is_some_and(|effect| effect.kind().is_file_io());
            if file_io {
                // Reading and writing files legitimately outlasts the window.
                tracing::debug!(
                    render = %self.label,
                    node = %action.node.name(),
                    "stalled worker is doing file I/O; not reporting"
                );
                return None;
            }
            stalled.push(StalledThread {
                thread_name: worker.thread_name(),
                node_name: action.node.name(),
                plugin_id: action.node.plugin_id(),
                action: action.action,
            });
        }
        if stalled.is_empty() {
            return None;
        }

        let report = StallReport {
            render: self.label.clone(),
            timeout_ms: self.settings.timeout.as_millis() as u64,
            interactive: self.settings.interactive,
            threads: stalled,
        };
        let response = self.reporter.on_stall(&report);
        if self.settings.interactive && response == StallResponse::Kill {
            // Kill hooks may unregister their worker; the lock is not held.
            for worker in &workers {
                tracing::warn!(render = %self.label, thread = %worker.thread_name(), "killing stalled worker");
                worker.kill();
            }
        }
        Some(report)
    }

    fn threads(&self) -> MutexGuard<'_, BTreeMap<WorkerId, Arc<dyn AbortableWorker>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watchdog(&self) -> MutexGuard<'_, WatchdogState> {
        self.watchdog.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<dyn AbortableWorker>>> = const { RefCell::new(None) };
}

/// Worker the calling thread registered through [`AbortSupervisor::enter`].
pub fn current_worker() -> Option<Arc<dyn AbortableWorker>> {
    CURRENT_WORKER.with(|current| current.borrow().clone())
}

/// Keeps a worker registered; unregisters exactly once when dropped,
/// including on early return or unwinding.
#[must_use = "the worker is unregistered when the registration is dropped"]
pub struct WorkerRegistration {
    supervisor: Arc<AbortSupervisor>,
    id: WorkerId,
    previous: Option<Arc<dyn AbortableWorker>>,
    _not_send: PhantomData<*const ()>,
}

impl WorkerRegistration {
    pub fn id(&self) -> WorkerId {
        self.id
    }
}

impl Drop for WorkerRegistration {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_WORKER.with(|current| {
            *current.borrow_mut() = previous;
        });
        self.supervisor.unregister_thread(self.id);
    }
}

/// Marks the current worker (if any) as running `action` on `node` until
/// dropped, restoring whatever it was doing before.
pub(crate) struct ActionScope {
    worker: Option<Arc<dyn AbortableWorker>>,
    previous: Option<ActionInfo>,
}

impl ActionScope {
    pub(crate) fn enter(node: &NodeRef, action: &str) -> Self {
        let worker = current_worker();
        let previous = worker.as_ref().and_then(|worker| {
            let previous = worker.current_action();
            worker.set_current_action(Some(ActionInfo {
                action: action.to_string(),
                node: Arc::clone(node),
            }));
            previous
        });
        Self { worker, previous }
    }
}

impl Drop for ActionScope {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.set_current_action(self.previous.take());
        }
    }
}
