use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// ShutdownSignal — cancellation plus worker-drain accounting
// ---------------------------------------------------------------------------

/// Cooperative shutdown for the executor fabric.
///
/// Two concerns live here because they always travel together in this
/// system: the cancellation edge (`trigger` / `wait`), which the watcher,
/// Ralph, and in-flight LLM calls `select!` against, and drain accounting
/// for the worker tasks that must finish unwinding before the daemon may
/// release its lockfile. A worker task holds a [`DrainGuard`] for its
/// lifetime; the daemon's `wait_idle` completes once the last guard drops.
///
/// The same type doubles as a per-worker cancel token: the pool hands each
/// worker its own instance and triggers it on `stop`, so one worker can be
/// torn down without touching the rest.
#[derive(Clone)]
pub struct ShutdownSignal {
    state: Arc<State>,
}

struct State {
    /// `true` once shutdown has been requested. Watch, not broadcast: late
    /// subscribers must still observe an already-fired signal.
    fired: watch::Sender<bool>,
    /// Live drain guards (one per worker task).
    active: AtomicUsize,
    /// Pinged whenever a guard drops, waking `wait_idle`.
    drained: Notify,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (fired, _) = watch::channel(false);
        Self {
            state: Arc::new(State {
                fired,
                active: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Request shutdown. Idempotent; every `wait` future resolves, now and
    /// in the future.
    pub fn trigger(&self) {
        if self.state.fired.send_replace(true) {
            debug!("shutdown already requested");
        } else {
            info!(
                active_workers = self.state.active.load(Ordering::Relaxed),
                "shutdown requested"
            );
        }
    }

    /// Check whether shutdown has been requested (non-blocking).
    pub fn is_shutting_down(&self) -> bool {
        *self.state.fired.borrow()
    }

    /// Resolve once shutdown has been requested. Safe to race with
    /// `trigger` and safe to drop partway through a `select!`.
    pub async fn wait(&self) {
        let mut rx = self.state.fired.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender lives in our own Arc, so this cannot happen while
                // the signal is alive; park rather than spuriously resolve.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Register a worker task. The returned guard must live for the task's
    /// whole body; dropping it is the drain confirmation.
    pub fn guard(&self) -> DrainGuard {
        self.state.active.fetch_add(1, Ordering::SeqCst);
        DrainGuard {
            state: Arc::clone(&self.state),
        }
    }

    /// Number of worker tasks currently holding a guard.
    pub fn active_workers(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Wait until every guard has dropped, or the timeout elapses. Returns
    /// `true` when the fabric drained in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.state.active.load(Ordering::SeqCst) == 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let notified = self.state.drained.notified();
            // Re-check after arming the notification so a guard dropped in
            // between is not missed.
            if self.state.active.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.state.active.load(Ordering::SeqCst) == 0;
            }
        }
    }
}

/// RAII drain confirmation for one worker task.
pub struct DrainGuard {
    state: Arc<State>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
        self.state.drained.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_resolves_wait_even_for_late_subscribers() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());

        signal.trigger();
        assert!(signal.is_shutting_down());

        // A wait started after the trigger still resolves.
        signal.wait().await;
    }

    #[tokio::test]
    async fn double_trigger_is_harmless() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
    }

    #[tokio::test]
    async fn guards_count_and_drain() {
        let signal = ShutdownSignal::new();
        let a = signal.guard();
        let b = signal.guard();
        assert_eq!(signal.active_workers(), 2);

        drop(a);
        assert_eq!(signal.active_workers(), 1);
        assert!(!signal.wait_idle(Duration::from_millis(20)).await);

        drop(b);
        assert!(signal.wait_idle(Duration::from_millis(20)).await);
        assert_eq!(signal.active_workers(), 0);
    }

    #[tokio::test]
    async fn wait_idle_wakes_when_last_guard_drops() {
        let signal = ShutdownSignal::new();
        let guard = signal.guard();

        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait_idle(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);

        assert!(handle.await.expect("join"));
    }

    #[tokio::test]
    async fn wait_races_with_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();
        handle.await.expect("join");
    }
}
