//! Stop signal for the engine's background loops.
//!
//! `UploadEngine::start` subscribes the queue scheduler and the expiry
//! sweeper. `UploadEngine::stop` fires the signal once and both loops exit at
//! their next `select!`. Uploads already running are not tied to it and
//! finish on their own.

use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;

/// Fan-out stop signal. Clones share the same channel.
#[derive(Clone, Debug)]
pub struct ShutdownCoordinator {
    stop_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        // One message per stop, and every loop exits on the first
        let (stop_tx, _) = broadcast::channel(1);
        Self { stop_tx }
    }

    /// Receiver for one background loop. Subscribe before spawning it, or a
    /// stop issued in between is missed.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.stop_tx.subscribe()
    }

    /// Signal every subscribed loop. Returns how many were listening.
    pub fn shutdown(&self) -> usize {
        self.stop_tx.send(()).unwrap_or(0)
    }

    /// Loops that have subscribed and not exited yet
    pub fn running_loops(&self) -> usize {
        self.stop_tx.receiver_count()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `tick` every `period` until `stop` fires. The first tick happens one
/// full period after the call, not immediately.
pub async fn every_until_stopped<F, Fut>(
    period: Duration,
    mut stop: broadcast::Receiver<()>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // interval completes its first tick immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => tick().await,
            _ = stop.recv() => break,
        }
    }
}
