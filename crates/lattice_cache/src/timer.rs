//! Timer service collaborator: `schedule(end_time, callback)` / `cancel(id)`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type TimerId = u64;

/// Tokio-backed one-shot timer registry. Every registration gets a fresh id;
/// callers cancel ids they no longer need (cancel after fire is a no-op).
pub struct TimerService {
    next_id: AtomicU64,
    tasks: DashMap<TimerId, JoinHandle<()>>,
}

impl TimerService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            tasks: DashMap::new(),
        })
    }

    /// Run `callback` at `end_time`. Must be called from within a tokio
    /// runtime.
    pub fn schedule<F>(self: &Arc<Self>, end_time: Instant, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(end_time).await;
            service.tasks.remove(&id);
            callback();
        });
        self.tasks.insert(id, handle);
        id
    }

    /// Cancel a pending timer. Idempotent.
    pub fn cancel(&self, id: TimerId) {
        if let Some((_, handle)) = self.tasks.remove(&id) {
            handle.abort();
        }
    }

    /// Number of timers that have not fired yet.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn fires_at_end_time() {
        let timer = TimerService::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        timer.schedule(Instant::now() + Duration::from_millis(500), move || {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let timer = TimerService::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let id = timer.schedule(Instant::now() + Duration::from_millis(100), move || {
            flag.store(true, Ordering::SeqCst);
        });
        timer.cancel(id);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fired.load(Ordering::SeqCst));
        // Cancelling again is a no-op.
        timer.cancel(id);
    }
}
