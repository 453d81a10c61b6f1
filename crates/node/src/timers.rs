//! Timer management for the runner.
//!
//! Provides a tokio-based timer implementation for the deterministic
//! state machines. Timers are spawned as tokio tasks and can be
//! cancelled or replaced.

use hotpocket_core::{Event, TimerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Convert a TimerId to the corresponding Event.
fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::Stage => Event::StageTimer,
        TimerId::Cleanup => Event::CleanupTimer,
    }
}

/// Manages timers for the runner.
///
/// Each timer is a tokio task that sleeps for the specified duration
/// and then sends the appropriate timer event to the event channel.
pub struct TimerManager {
    /// Active timers (id -> task handle).
    timers: HashMap<TimerId, JoinHandle<()>>,
    /// Event sender for timer fires.
    event_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    /// Create a new timer manager.
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Set a timer that will fire after the given duration.
    ///
    /// If a timer with the same ID already exists, it is cancelled first.
    pub fn set_timer(&mut self, id: TimerId, duration: Duration) {
        self.cancel_timer(id);

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(?id, "Timer fired");
            let _ = event_tx.send(timer_event(id)).await;
        });

        self.timers.insert(id, handle);
        debug!(?id, ?duration, "Timer set");
    }

    /// Cancel a timer.
    ///
    /// If the timer doesn't exist or has already fired, this is a no-op.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
            trace!(?id, "Timer cancelled");
        }
    }

    /// Cancel all timers. Called during shutdown.
    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            trace!(?id, "Timer cancelled (shutdown)");
        }
    }

    /// Number of active timers.
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timer_fires() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Stage, Duration::from_millis(10));

        let event = tokio::time::timeout(Duration::from_millis(100), event_rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(event, Event::StageTimer));
    }

    #[tokio::test]
    async fn timer_cancel() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Stage, Duration::from_millis(50));
        manager.cancel_timer(TimerId::Stage);

        let result = tokio::time::timeout(Duration::from_millis(100), event_rx.recv()).await;
        assert!(result.is_err(), "timer should have been cancelled");
    }

    #[tokio::test]
    async fn timer_replace_takes_latest_duration() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Stage, Duration::from_millis(100));
        manager.set_timer(TimerId::Stage, Duration::from_millis(10));
        assert_eq!(manager.active_count(), 1);

        let event = tokio::time::timeout(Duration::from_millis(50), event_rx.recv())
            .await
            .expect("timeout - timer didn't fire quickly")
            .expect("channel closed");
        assert!(matches!(event, Event::StageTimer));
    }

    #[tokio::test]
    async fn cancel_all_stops_everything() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Stage, Duration::from_millis(50));
        manager.set_timer(TimerId::Cleanup, Duration::from_millis(50));
        assert_eq!(manager.active_count(), 2);

        manager.cancel_all();
        assert_eq!(manager.active_count(), 0);

        let result = tokio::time::timeout(Duration::from_millis(100), event_rx.recv()).await;
        assert!(result.is_err(), "no timers should have fired");
    }
}
