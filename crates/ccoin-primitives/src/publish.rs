//! Snapshot publication cell.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

/// Single-writer publication point for an immutable snapshot.
///
/// The writer swaps in a whole new value; readers clone the `Arc` under a
/// momentary read lock and never observe a partially built snapshot. Every
/// publish bumps a watch counter so the distribution layer can react to
/// changes without polling.
#[derive(Debug)]
pub struct Publication<T> {
    current: RwLock<Arc<T>>,
    version: watch::Sender<u64>,
}

impl<T: Default> Default for Publication<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Publication<T> {
    /// Creates a publication cell holding `initial` at version 0.
    pub fn new(initial: T) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            current: RwLock::new(Arc::new(initial)),
            version,
        }
    }

    /// Returns the currently published value.
    pub fn load(&self) -> Arc<T> {
        self.current.read().clone()
    }

    /// Publishes `next`, replacing the current value wholesale.
    pub fn publish(&self, next: T) {
        *self.current.write() = Arc::new(next);
        self.version.send_modify(|version| *version += 1);
    }

    /// Subscribes to publish notifications. The watch value is a counter
    /// incremented on every publish.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Version of the currently published value.
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }
}
