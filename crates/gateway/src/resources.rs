//! Resource lifecycle tracking.
//!
//! Long-lived resources (store handles, listeners, caches, background
//! tasks) register a shutdown hook here; shutdown runs the hooks in LIFO
//! order so dependents release before their dependencies.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info};

type ShutdownHook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// LIFO stack of shutdown hooks.
pub struct ResourceStack {
    hooks: Mutex<Vec<(String, ShutdownHook)>>,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self {
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Register a resource. Hooks run in reverse registration order.
    pub fn register<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(resource = %name, "Registered resource");
        self.hooks
            .lock()
            .push((name, Box::new(move || Box::pin(hook()))));
    }

    /// Release everything, LIFO.
    pub async fn shutdown(&self) {
        let hooks: Vec<(String, ShutdownHook)> = {
            let mut guard = self.hooks.lock();
            guard.drain(..).collect()
        };
        for (name, hook) in hooks.into_iter().rev() {
            info!(resource = %name, "Releasing resource");
            hook().await;
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.lock().is_empty()
    }
}

impl Default for ResourceStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn hooks_run_lifo() {
        let stack = ResourceStack::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        for name in ["store", "listener", "cache"] {
            let order = Arc::clone(&order);
            let counter = Arc::clone(&counter);
            stack.register(name, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                order.lock().push(name.to_string());
            });
        }

        assert_eq!(stack.len(), 3);
        stack.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(*order.lock(), vec!["cache", "listener", "store"]);
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn shutdown_twice_is_harmless() {
        let stack = ResourceStack::new();
        stack.register("once", || async {});
        stack.shutdown().await;
        stack.shutdown().await;
    }
}
