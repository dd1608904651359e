//! Owner-thread event loop used to host thread-affine timers.
//!
//! A render invocation arms its abort watchdog on the thread that created it.
//! Any other thread that needs a timer started asks the owner to do it by
//! posting a job through a [`LoopHandle`]; the owner drains posted jobs and
//! fires expired timers every time it pumps the loop:
//!
//! ```text
//!   worker thread ── LoopHandle::post(job) ──▶ channel ──┐
//!                                                       ▼
//!   owner thread ── EventLoop::run_pending() ──▶ jobs, then due timers
//! ```
//!
//! Time comes from a [`Clock`] so tests can drive timers deterministically
//! with a [`ManualClock`].

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

/// Upper bound on how long [`EventLoop::run_until`] sleeps between checks.
const IDLE_POLL: Duration = Duration::from_millis(20);

/// Unit of work executed on the owner thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("timers can only be started or cancelled on the loop's owner thread")]
    WrongThread,
    #[error("event loop is no longer running")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Source of the current instant for timer deadlines.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Clock backed by `Instant::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct TimerQueue {
    next_id: u64,
    entries: BTreeMap<(Instant, u64), Job>,
    deadlines: HashMap<u64, Instant>,
}

impl TimerQueue {
    fn insert(&mut self, deadline: Instant, job: Job) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert((deadline, id), job);
        self.deadlines.insert(id, deadline);
        TimerId(id)
    }

    fn remove(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id.0) {
            Some(deadline) => self.entries.remove(&(deadline, id.0)).is_some(),
            None => false,
        }
    }

    fn take_due(&mut self, now: Instant) -> Vec<Job> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > now {
                break;
            }
            due.push(entry.remove());
            self.deadlines.remove(&id);
        }
        due
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }
}

struct Shared {
    owner: ThreadId,
    clock: Arc<dyn Clock>,
    timers: Mutex<TimerQueue>,
}

impl Shared {
    fn timers(&self) -> MutexGuard<'_, TimerQueue> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Event loop bound to the thread that created it.
pub struct EventLoop {
    shared: Arc<Shared>,
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    // Timers fire on the creating thread only.
    _not_send: PhantomData<*const ()>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            shared: Arc::new(Shared {
                owner: thread::current().id(),
                clock,
                timers: Mutex::new(TimerQueue::default()),
            }),
            sender,
            receiver,
            _not_send: PhantomData,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
            sender: self.sender.clone(),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.shared.timers().next_deadline()
    }

    /// Runs the jobs queued so far, then every timer whose deadline has
    /// passed. Work enqueued by those callbacks waits for the next call.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        let queued = self.receiver.len();
        for _ in 0..queued {
            match self.receiver.try_recv() {
                Ok(job) => {
                    job();
                    ran += 1;
                }
                Err(_) => break,
            }
        }

        let now = self.shared.clock.now();
        let due = self.shared.timers().take_due(now);
        for job in due {
            job();
            ran += 1;
        }
        if ran > 0 {
            tracing::trace!(ran, "event loop iteration");
        }
        ran
    }

    /// Pumps the loop until `stop` returns true, sleeping on the job channel
    /// in between.
    pub fn run_until<F>(&self, mut stop: F)
    where
        F: FnMut() -> bool,
    {
        loop {
            self.run_pending();
            if stop() {
                return;
            }
            let wait = match self.next_deadline() {
                Some(deadline) => deadline
                    .saturating_duration_since(self.shared.clock.now())
                    .min(IDLE_POLL),
                None => IDLE_POLL,
            };
            match self.receiver.recv_timeout(wait) {
                Ok(job) => job(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe access to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
    sender: Sender<Job>,
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("owner", &self.shared.owner)
            .finish_non_exhaustive()
    }
}

impl LoopHandle {
    pub fn owner_thread(&self) -> ThreadId {
        self.shared.owner
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    pub fn now(&self) -> Instant {
        self.shared.clock.now()
    }

    /// Queues `job` to run on the owner thread. Never blocks.
    pub fn post<F>(&self, job: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Box::new(job))
            .map_err(|_| SchedulerError::Disconnected)
    }

    /// Schedules a one-shot `callback` after `delay`. Owner thread only.
    pub fn start_timer<F>(&self, delay: Duration, callback: F) -> Result<TimerId, SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_owner_thread() {
            return Err(SchedulerError::WrongThread);
        }
        let deadline = self.shared.clock.now() + delay;
        let id = self.shared.timers().insert(deadline, Box::new(callback));
        tracing::trace!(?id, ?delay, "timer started");
        Ok(id)
    }

    /// Returns false when the timer already fired or never existed.
    pub fn cancel_timer(&self, id: TimerId) -> Result<bool, SchedulerError> {
        if !self.is_owner_thread() {
            return Err(SchedulerError::WrongThread);
        }
        Ok(self.shared.timers().remove(id))
    }
}
