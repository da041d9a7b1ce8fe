//! Resettable idle timer
//!
//! A one-shot timer that can be re-armed by subscriber heartbeats. On expiry
//! it cancels the session's scope exactly once; cancelling the scope from
//! elsewhere disarms the timer.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug)]
pub struct IdleTimer {
    reset_tx: mpsc::UnboundedSender<()>,
}

impl IdleTimer {
    /// Arm a timer that cancels `scope` after `timeout` without resets.
    pub fn spawn(timeout: Duration, scope: CancellationToken, tracker: &TaskTracker) -> Self {
        let (reset_tx, mut reset_rx) = mpsc::unbounded_channel::<()>();

        tracker.spawn(async move {
            let mut deadline = Instant::now() + timeout;
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {
                        scope.cancel();
                        return;
                    }
                    reset = reset_rx.recv() => match reset {
                        Some(()) => deadline = Instant::now() + timeout,
                        // All handles dropped; nothing can re-arm us.
                        None => return,
                    },
                }
            }
        });

        Self { reset_tx }
    }

    /// Push the deadline out by the full timeout.
    pub fn reset(&self) {
        let _ = self.reset_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_timeout() {
        let scope = CancellationToken::new();
        let tracker = TaskTracker::new();
        let _timer = IdleTimer::spawn(Duration::from_secs(5), scope.clone(), &tracker);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(scope.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_postpones_expiry() {
        let scope = CancellationToken::new();
        let tracker = TaskTracker::new();
        let timer = IdleTimer::spawn(Duration::from_secs(5), scope.clone(), &tracker);

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            assert!(!scope.is_cancelled());
            timer.reset();
        }

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(scope.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_scope_disarms_timer() {
        let scope = CancellationToken::new();
        let tracker = TaskTracker::new();
        let _timer = IdleTimer::spawn(Duration::from_secs(5), scope.clone(), &tracker);

        scope.cancel();
        tracker.close();
        // The timer task exits promptly instead of waiting out the timeout.
        tokio::time::timeout(Duration::from_secs(1), tracker.wait())
            .await
            .expect("timer task should exit once the scope is cancelled");
    }
}
