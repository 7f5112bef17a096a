//! Registry that tracks per-run abort signals.
//!
//! Cancellation is cooperative: `Engine::abort_work` flips the flag for the
//! running instance, and executors check it between (or inside) long
//! operations. The map is process-scoped and cleared when a run reaches a
//! terminal state; a run that never registered simply observes its
//! `Aborting` status on the next tick instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct AbortRegistry {
    signals: Arc<tokio::sync::Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance and return its abort signal.
    pub async fn register(&self, instance_id: &str) -> Arc<AtomicBool> {
        let mut signals = self.signals.lock().await;
        signals
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Request abort for an instance. Returns false if nothing is running
    /// under that id in this process.
    pub async fn request_abort(&self, instance_id: &str) -> bool {
        if let Some(signal) = self.signals.lock().await.get(instance_id) {
            signal.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Unregister an instance (called on terminal state).
    pub async fn unregister(&self, instance_id: &str) {
        self.signals.lock().await.remove(instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_abort_signal_visible_to_registered_run() {
        let registry = AbortRegistry::new();
        let signal = registry.register("i1").await;
        assert!(!signal.load(Ordering::SeqCst));

        assert!(registry.request_abort("i1").await);
        assert!(signal.load(Ordering::SeqCst));

        registry.unregister("i1").await;
        assert!(!registry.request_abort("i1").await);
    }

    #[tokio::test]
    async fn test_register_is_idempotent_per_instance() {
        let registry = AbortRegistry::new();
        let a = registry.register("i1").await;
        let b = registry.register("i1").await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
