/// debounce.rs – Run only the last of a burst of scheduled tasks.
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Each `schedule` call supersedes the previous one; a task runs only if no
/// newer call arrived during its quiet period. Dropping the debouncer cancels
/// whatever is still waiting.
#[derive(Debug, Default)]
pub struct Debouncer {
    generation: Arc<AtomicU64>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let my_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = Arc::clone(&self.generation);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if generation.load(Ordering::SeqCst) == my_gen {
                task.await;
            }
        });
        if let Some(prev) = self.lock_pending().replace(handle) {
            prev.abort();
        }
    }

    /// Drop the waiting task, if any. A task already running is not interrupted.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(prev) = self.lock_pending().take() {
            prev.abort();
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        // A poisoned slot still holds a valid handle
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
