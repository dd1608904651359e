//! Rendering-device contexts leased for the lifetime of an invocation.
//!
//! A render normally takes a transient context from the pool. Interactive
//! painting is different: consecutive strokes draw over the same texture, so
//! the painting tool keeps the contexts of its first render and hands them
//! back on the next one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContextKind {
    /// Hardware-accelerated device context.
    Gpu,
    /// Software rasteriser used when no GPU can serve the render.
    CpuFallback,
}

/// Opaque handle to a device context owned by a pool.
#[derive(Debug)]
pub struct DeviceContext {
    id: u64,
    kind: ContextKind,
}

impl DeviceContext {
    pub fn new(kind: ContextKind) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("no {0:?} context available")]
    Unavailable(ContextKind),
    #[error("context creation failed: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Shared source of device contexts.
pub trait GpuContextPool: Send + Sync {
    /// With `retrieve_last`, hands back the most recently created context of
    /// `kind` instead of a fresh one.
    fn acquire_or_reuse(
        &self,
        kind: ContextKind,
        retrieve_last: bool,
    ) -> Result<Arc<DeviceContext>, GpuError>;
}

/// Pair of contexts a render may use.
#[derive(Debug, Clone, Default)]
pub struct ContextPair {
    pub gpu: Option<Arc<DeviceContext>>,
    pub cpu: Option<Arc<DeviceContext>>,
}

impl ContextPair {
    pub fn is_empty(&self) -> bool {
        self.gpu.is_none() && self.cpu.is_none()
    }
}

/// Implemented by interactive tools that pin their contexts across renders.
pub trait PaintContextAffinity: Send + Sync {
    fn bound_contexts(&self) -> ContextPair;
    fn bind_contexts(&self, contexts: ContextPair);
}

/// Contexts owned by one invocation.
#[derive(Debug, Clone, Default)]
pub struct ContextLease {
    contexts: ContextPair,
    pinned: bool,
}

impl ContextLease {
    /// Never fails: an empty lease means the render runs CPU-only.
    pub fn acquire(
        pool: Option<&dyn GpuContextPool>,
        painting: Option<&dyn PaintContextAffinity>,
    ) -> Self {
        let Some(pool) = pool else {
            tracing::debug!("no context pool configured; rendering CPU-only");
            return Self::default();
        };

        match painting {
            Some(tool) => {
                let mut contexts = tool.bound_contexts();
                if contexts.is_empty() {
                    contexts = ContextPair {
                        gpu: fetch(pool, ContextKind::Gpu, true),
                        cpu: fetch(pool, ContextKind::CpuFallback, true),
                    };
                    if !contexts.is_empty() {
                        tool.bind_contexts(contexts.clone());
                    }
                }
                Self {
                    contexts,
                    pinned: true,
                }
            }
            None => Self {
                contexts: ContextPair {
                    gpu: fetch(pool, ContextKind::Gpu, false),
                    cpu: fetch(pool, ContextKind::CpuFallback, false),
                },
                pinned: false,
            },
        }
    }

    pub fn gpu(&self) -> Option<&Arc<DeviceContext>> {
        self.contexts.gpu.as_ref()
    }

    pub fn cpu(&self) -> Option<&Arc<DeviceContext>> {
        self.contexts.cpu.as_ref()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn is_cpu_only(&self) -> bool {
        self.contexts.gpu.is_none()
    }
}

fn fetch(pool: &dyn GpuContextPool, kind: ContextKind, retrieve_last: bool) -> Option<Arc<DeviceContext>> {
    match pool.acquire_or_reuse(kind, retrieve_last) {
        Ok(context) => Some(context),
        Err(err) => {
            tracing::debug!(?kind, %err, "context unavailable; continuing without it");
            None
        }
    }
}

#[derive(Debug, Default)]
struct KindSlots {
    contexts: Vec<Arc<DeviceContext>>,
    next: usize,
}

/// In-process pool handing out a bounded number of contexts per kind in
/// round-robin order.
#[derive(Debug)]
pub struct SharedContextPool {
    max_per_kind: usize,
    gpu_available: bool,
    gpu: Mutex<KindSlots>,
    cpu: Mutex<KindSlots>,
}

impl SharedContextPool {
    pub fn new(max_per_kind: usize) -> Self {
        Self {
            max_per_kind: max_per_kind.max(1),
            gpu_available: true,
            gpu: Mutex::new(KindSlots::default()),
            cpu: Mutex::new(KindSlots::default()),
        }
    }

    /// A pool on a machine without a usable GPU.
    pub fn cpu_only(max_per_kind: usize) -> Self {
        Self {
            gpu_available: false,
            ..Self::new(max_per_kind)
        }
    }

    pub fn created(&self, kind: ContextKind) -> usize {
        self.slots(kind)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contexts
            .len()
    }

    fn slots(&self, kind: ContextKind) -> &Mutex<KindSlots> {
        match kind {
            ContextKind::Gpu => &self.gpu,
            ContextKind::CpuFallback => &self.cpu,
        }
    }
}

impl GpuContextPool for SharedContextPool {
    fn acquire_or_reuse(
        &self,
        kind: ContextKind,
        retrieve_last: bool,
    ) -> Result<Arc<DeviceContext>, GpuError> {
        if kind == ContextKind::Gpu && !self.gpu_available {
            return Err(GpuError::Unavailable(kind));
        }
        let mut slots = self.slots(kind).lock().unwrap_or_else(PoisonError::into_inner);
        if retrieve_last {
            if let Some(last) = slots.contexts.last() {
                return Ok(Arc::clone(last));
            }
        }
        if slots.contexts.len() < self.max_per_kind {
            let context = Arc::new(DeviceContext::new(kind));
            tracing::debug!(id = context.id(), ?kind, "created device context");
            slots.contexts.push(Arc::clone(&context));
            return Ok(context);
        }
        let index = slots.next % slots.contexts.len();
        slots.next = slots.next.wrapping_add(1);
        Ok(Arc::clone(&slots.contexts[index]))
    }
}
