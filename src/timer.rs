use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One-shot timer service, the seam to the host's event engine.
///
/// `cancel` is idempotent and may race with the timer firing; exactly one of
/// "callback runs" and "cancel wins" happens.
pub trait Timers: Send + Sync {
    fn run_after(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerHandle;
    fn cancel(&self, handle: TimerHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// Tokio-backed [`Timers`]: one spawned task per timer, cancellation through
/// an id-keyed map. Must be used from within a tokio runtime.
pub struct TokioTimers {
    inner: Arc<TimersInner>,
}

struct TimersInner {
    next_id: AtomicU64,
    // id -> abort handle; None until the task is spawned. An absent entry
    // means the timer already fired or was cancelled.
    pending: Mutex<HashMap<u64, Option<tokio::task::AbortHandle>>>,
}

impl TokioTimers {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimersInner {
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Default for TokioTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl Timers for TokioTimers {
    fn run_after(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        // Insert before spawning so a timer that fires immediately still finds
        // its own entry.
        self.inner.pending.lock().unwrap().insert(id, None);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Whoever removes the entry first wins the race with cancel.
            let fire = inner.pending.lock().unwrap().remove(&id).is_some();
            if fire {
                callback();
            }
        });
        if let Some(slot) = self.inner.pending.lock().unwrap().get_mut(&id) {
            *slot = Some(task.abort_handle());
        }
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(slot) = self.inner.pending.lock().unwrap().remove(&handle.0) {
            if let Some(abort) = slot {
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_after_fires() {
        let timers = TokioTimers::new();
        let (tx, rx) = mpsc::channel();
        timers.run_after(
            Duration::from_millis(10),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );
        let got = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(got.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_prevents_firing() {
        let timers = TokioTimers::new();
        let (tx, rx) = mpsc::channel();
        let handle = timers.run_after(
            Duration::from_millis(200),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );
        timers.cancel(handle);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_idempotent() {
        let timers = TokioTimers::new();
        let handle = timers.run_after(Duration::from_millis(50), Box::new(|| {}));
        timers.cancel(handle);
        timers.cancel(handle);
        timers.cancel(TimerHandle(9999));
    }
}
