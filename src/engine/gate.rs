use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Accepts the first of several racing signals and drops the rest.
///
/// Resolution cancels `suppress` before the value is handed over, so the
/// recognizer and the timer stop as soon as a winner exists.
pub struct ResolutionGate<T> {
    resolved: AtomicBool,
    slot: Mutex<Option<oneshot::Sender<T>>>,
    suppress: CancellationToken,
}

impl<T> ResolutionGate<T> {
    pub fn new(suppress: CancellationToken) -> (Arc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let gate = Arc::new(Self {
            resolved: AtomicBool::new(false),
            slot: Mutex::new(Some(tx)),
            suppress,
        });
        (gate, rx)
    }

    /// Returns true if `value` won the race
    pub fn resolve(&self, value: T) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.suppress.cancel();

        let sender = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = sender {
            let _ = tx.send(value);
        }
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }
}
