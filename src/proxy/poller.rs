//! Fixed-rate background polling, scoped to a cancellation token.
//!
//! `start` and `stop` are idempotent. The running flag, the token and the
//! task handle change together under one lock, so a stop can never cancel
//! twice and a start can never spawn a second loop.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct PollerState {
    running: bool,
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Background task that runs a callback once per interval.
#[derive(Default)]
pub struct Poller {
    state: Mutex<PollerState>,
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start polling. Returns `false` if a loop is already running.
    ///
    /// The first tick fires one `interval` after start. A tick runs to
    /// completion before the next one is considered; missed ticks are
    /// skipped rather than bunched up. Cancelling `parent` stops the loop.
    pub fn start<F, Fut>(&self, parent: &CancellationToken, interval: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.running && !state.token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return false;
        }

        let token = parent.child_token();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    () = loop_token.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            tracing::debug!("poller stopped");
        });

        state.running = true;
        state.token = Some(token);
        state.handle = Some(handle);
        tracing::debug!(interval_ms = interval.as_millis() as u64, "poller started");
        true
    }

    /// Stop polling and wait for an in-flight tick to finish.
    ///
    /// Returns `false` if the poller was not running.
    pub async fn stop(&self) -> bool {
        let handle = {
            let mut state = self.state.lock();
            if !state.running {
                return false;
            }
            state.running = false;
            if let Some(token) = state.token.take() {
                token.cancel();
            }
            state.handle.take()
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "poller task ended abnormally");
            }
        }
        true
    }

    /// Whether the loop is running (not stopped and not cancelled).
    pub fn is_running(&self) -> bool {
        let state = self.state.lock();
        state.running && state.token.as_ref().is_some_and(|t| !t.is_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting() -> (Arc<AtomicUsize>, impl FnMut() -> futures::future::Ready<()> + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let tick = move || {
            c.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(())
        };
        (count, tick)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_interval() {
        let poller = Poller::new();
        let (count, tick) = counting();
        let root = CancellationToken::new();
        assert!(poller.start(&root, Duration::from_secs(60), tick));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(poller.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let poller = Poller::new();
        let root = CancellationToken::new();
        let (_, first) = counting();
        let (second_count, second) = counting();

        assert!(poller.start(&root, Duration::from_secs(1), first));
        assert!(!poller.start(&root, Duration::from_secs(1), second));
        assert!(poller.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(second_count.load(Ordering::SeqCst), 0);

        assert!(poller.stop().await);
        assert!(!poller.stop().await);
        assert!(!poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_stops_loop() {
        let poller = Poller::new();
        let root = CancellationToken::new();
        let (count, tick) = counting();
        poller.start(&root, Duration::from_secs(1), tick);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let before = count.load(Ordering::SeqCst);
        assert_eq!(before, 2);

        root.cancel();
        assert!(!poller.is_running());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let poller = Poller::new();
        let root = CancellationToken::new();
        let (_, first) = counting();
        poller.start(&root, Duration::from_secs(1), first);
        poller.stop().await;

        let (count, second) = counting();
        assert!(poller.start(&root, Duration::from_secs(1), second));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        poller.stop().await;
    }
}
