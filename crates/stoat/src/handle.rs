use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use stoat_core::{Backend, Tensor};

use crate::engine::EngineError;

// TensorHandle — Opaque identity across the boundary
//
// Callers on the far side of the boundary never see a Tensor; they
// hold a handle and pass it back into the engine for every operation.
// The table entry pins the tensor (and thereby its storage) until the
// caller releases the handle, so destruction is deterministic and
// independent of any foreign garbage collector.

/// Opaque identifier for a tensor owned by a [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorHandle(pub(crate) u64);

impl TensorHandle {
    /// The raw id, for embedding into a foreign word-sized slot.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Maps handles to tensors. Ids come from an atomic counter and are
/// never reused, so a stale handle can always be detected.
pub(crate) struct HandleTable<B: Backend> {
    entries: Mutex<HashMap<u64, Tensor<B>>>,
    next_id: AtomicU64,
}

impl<B: Backend> HandleTable<B> {
    pub(crate) fn new() -> Self {
        HandleTable {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Tensor<B>>> {
        // A poisoned lock only means another thread panicked while
        // holding it; the map itself is still consistent (every
        // critical section is a single insert/remove/lookup).
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a tensor and hand out its handle.
    pub(crate) fn insert(&self, tensor: Tensor<B>) -> TensorHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, tensor);
        TensorHandle(id)
    }

    /// Look up a handle. The returned tensor shares storage with the
    /// table entry (cloning a tensor is a refcount bump).
    pub(crate) fn get(&self, handle: TensorHandle) -> Result<Tensor<B>, EngineError> {
        self.lock()
            .get(&handle.0)
            .cloned()
            .ok_or(EngineError::InvalidHandle(handle.0))
    }

    /// Drop a table entry. Storage is freed once the last view of it
    /// is gone. Releasing a stale handle is a caller programming
    /// error and reported as such, never silently ignored.
    pub(crate) fn remove(&self, handle: TensorHandle) -> Result<(), EngineError> {
        self.lock()
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(EngineError::InvalidHandle(handle.0))
    }

    /// Number of live entries (used by leak checks).
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
