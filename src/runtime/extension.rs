//! Host extensions attached to an instance

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

/// Host-provided service attached to a workflow instance
pub trait WorkflowExtension: Send + Sync {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    /// The instance was aborted; release whatever the extension holds for it
    fn cancel(&self);
}

/// Extensions registered on one instance
#[derive(Default, Clone)]
pub struct ExtensionManager {
    extensions: Arc<RwLock<Vec<Arc<dyn WorkflowExtension>>>>,
}

impl ExtensionManager {
    /// Empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension
    pub fn add(&self, extension: Arc<dyn WorkflowExtension>) {
        self.extensions.write().push(extension);
    }

    /// Number of registered extensions
    pub fn len(&self) -> usize {
        self.extensions.read().len()
    }

    /// Whether no extension is registered
    pub fn is_empty(&self) -> bool {
        self.extensions.read().is_empty()
    }

    /// Cancel every extension, in registration order
    pub fn cancel_all(&self) {
        for extension in self.extensions.read().iter() {
            debug!("cancelling extension '{}'", extension.name());
            extension.cancel();
        }
    }
}

impl std::fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .extensions
            .read()
            .iter()
            .map(|extension| extension.name().to_string())
            .collect();
        f.debug_struct("ExtensionManager").field("extensions", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counting(AtomicUsize);

    impl WorkflowExtension for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn cancel(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_cancel_all() {
        let manager = ExtensionManager::new();
        let first = Arc::new(Counting(AtomicUsize::new(0)));
        let second = Arc::new(Counting(AtomicUsize::new(0)));
        manager.add(first.clone());
        manager.add(second.clone());

        manager.cancel_all();
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
        assert_eq!(manager.len(), 2);
    }
}
