//! Progress reporting for sync operations.
//!
//! Counters are absolute: every event carries the new value, so a consumer
//! can attach at any time. The total grows as discovery proceeds, and the
//! synced count can transiently decrease when delayed diagram references
//! push already-counted pages back into the fix queue.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Progress event types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// The known total number of pages to sync changed
    TotalPageCountChanged { total: usize },
    /// The number of fully synced pages changed
    SyncedPageCountChanged { count: usize },
}

/// Receiving side of the progress channel
pub struct EventChannel {
    receiver: mpsc::UnboundedReceiver<SyncEvent>,
}

impl EventChannel {
    /// Create a connected reporter/channel pair
    pub fn new() -> (SyncReporter, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (SyncReporter::new(sender), Self { receiver })
    }

    /// Receive the next progress event
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.receiver.recv().await
    }

    /// Try to receive a progress event without blocking
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        self.receiver.try_recv().ok()
    }

    /// Close the channel
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

#[derive(Debug, Default)]
struct Counters {
    total: usize,
    synced: usize,
}

/// Sending side, cloned into every page task.
///
/// Sending never fails the sync: once the receiver is gone the events are
/// silently dropped.
#[derive(Clone)]
pub struct SyncReporter {
    sender: mpsc::UnboundedSender<SyncEvent>,
    counters: Arc<Mutex<Counters>>,
}

impl SyncReporter {
    fn new(sender: mpsc::UnboundedSender<SyncEvent>) -> Self {
        Self {
            sender,
            counters: Arc::new(Mutex::new(Counters::default())),
        }
    }

    /// Raise the known total by `n` pages
    pub fn add_total(&self, n: usize) {
        if n == 0 {
            return;
        }
        let total = {
            let mut counters = self.counters.lock();
            counters.total += n;
            counters.total
        };
        let _ = self.sender.send(SyncEvent::TotalPageCountChanged { total });
    }

    /// Adjust the synced count; negative deltas saturate at zero
    pub fn add_synced(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let count = {
            let mut counters = self.counters.lock();
            counters.synced = counters.synced.saturating_add_signed(delta as isize);
            counters.synced
        };
        let _ = self.sender.send(SyncEvent::SyncedPageCountChanged { count });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_carry_absolute_counts() {
        let (reporter, mut channel) = EventChannel::new();

        reporter.add_total(3);
        reporter.add_total(2);
        reporter.add_synced(1);

        match channel.recv().await.unwrap() {
            SyncEvent::TotalPageCountChanged { total } => assert_eq!(total, 3),
            other => panic!("unexpected event: {other:?}"),
        }
        match channel.recv().await.unwrap() {
            SyncEvent::TotalPageCountChanged { total } => assert_eq!(total, 5),
            other => panic!("unexpected event: {other:?}"),
        }
        match channel.recv().await.unwrap() {
            SyncEvent::SyncedPageCountChanged { count } => assert_eq!(count, 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_synced_count_can_decrease() {
        let (reporter, mut channel) = EventChannel::new();

        reporter.add_synced(4);
        reporter.add_synced(-2);

        let _ = channel.recv().await.unwrap();
        match channel.recv().await.unwrap() {
            SyncEvent::SyncedPageCountChanged { count } => assert_eq!(count, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_dropped_receiver_does_not_fail_sender() {
        let (reporter, channel) = EventChannel::new();
        drop(channel);

        reporter.add_total(1);
        reporter.add_synced(1);
    }
}
