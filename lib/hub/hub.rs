//! The per-task hub and the registry that owns them.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Instant,
};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, RwLock};
use uuid::Uuid;

use crate::store::TaskStatus;

use super::{BootStage, WsEvent};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Maximum number of events kept in the replay ring.
pub const REPLAY_CAPACITY: usize = 1024;

/// Maximum total bytes of output `data` kept in the replay ring.
pub const REPLAY_MAX_BYTES: usize = 1024 * 1024;

/// Per-subscriber outbound queue bound; a subscriber that falls further behind
/// is disconnected as a slow consumer.
pub const SUBSCRIBER_QUEUE_BOUND: usize = 256;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Per-task fan-out plus replay buffer.
///
/// Publish and snapshot-plus-subscribe run under one lock, so a subscriber's
/// replay concatenated with its live stream is always a gapless, duplicate-free
/// suffix of the full event sequence.
#[derive(Debug)]
pub struct TaskHub {
    /// Replay ring and close flag; the single synchronization point.
    shared: Mutex<HubShared>,

    /// Live fan-out. Capacity doubles as the per-subscriber queue bound.
    events_tx: broadcast::Sender<WsEvent>,

    /// Sender into the relay's writer channel, registered once the relay is up.
    input_tx: Mutex<Option<mpsc::Sender<String>>>,

    /// Last instant the task produced non-heartbeat output or received input.
    last_activity: Mutex<Instant>,
}

#[derive(Debug)]
struct HubShared {
    replay: VecDeque<WsEvent>,
    replay_bytes: usize,
    closed: bool,
}

/// Registry of live hubs, keyed by task id.
///
/// Values are reference-counted so a hub handed to a subscriber outlives its
/// map entry during teardown. An entry is removed once its task terminated and
/// the last subscriber disconnected, whichever happens later.
#[derive(Debug, Default)]
pub struct HubRegistry {
    hubs: RwLock<HashMap<Uuid, Arc<TaskHub>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods: TaskHub
//--------------------------------------------------------------------------------------------------

impl TaskHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(SUBSCRIBER_QUEUE_BOUND);
        Self {
            shared: Mutex::new(HubShared {
                replay: VecDeque::new(),
                replay_bytes: 0,
                closed: false,
            }),
            events_tx,
            input_tx: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Publishes an event to live subscribers, buffering output events for
    /// replay. No-op once the hub is closed.
    pub fn publish(&self, event: WsEvent) {
        let mut shared = self.shared.lock().unwrap();
        if shared.closed {
            return;
        }

        if let WsEvent::Output { ref data, .. } = event {
            shared.replay_bytes += data.len();
            shared.replay.push_back(event.clone());
            while shared.replay.len() > REPLAY_CAPACITY || shared.replay_bytes > REPLAY_MAX_BYTES {
                if let Some(WsEvent::Output { data, .. }) = shared.replay.pop_front() {
                    shared.replay_bytes -= data.len();
                } else {
                    break;
                }
            }
        }

        // Send while holding the lock so subscribe cannot interleave.
        let _ = self.events_tx.send(event);
    }

    /// Publishes one guest output frame, stamping it and refreshing the idle
    /// clock.
    pub fn publish_output(&self, data: String) {
        self.touch();
        self.publish(WsEvent::Output {
            data,
            timestamp_ms: Utc::now().timestamp_millis(),
        });
    }

    /// Publishes a status change.
    pub fn publish_status(&self, status: TaskStatus, exit_code: Option<i32>) {
        self.publish(WsEvent::Status { status, exit_code });
    }

    /// Publishes a boot-progress marker.
    pub fn publish_progress(&self, stage: BootStage) {
        self.publish(WsEvent::Progress {
            stage,
            message: stage.message().to_string(),
        });
    }

    /// Publishes a terminal error.
    pub fn publish_error(&self, message: impl Into<String>) {
        self.publish(WsEvent::Error {
            message: message.into(),
        });
    }

    /// Atomically snapshots the replay buffer and subscribes to live events.
    ///
    /// The receiver is positioned at the first event after the snapshot: no
    /// duplicates, no gaps.
    pub fn subscribe(&self) -> (Vec<WsEvent>, broadcast::Receiver<WsEvent>) {
        let shared = self.shared.lock().unwrap();
        let replay = shared.replay.iter().cloned().collect();
        let receiver = self.events_tx.subscribe();
        (replay, receiver)
    }

    /// Snapshot of the replay buffer without subscribing.
    pub fn replay(&self) -> Vec<WsEvent> {
        self.shared.lock().unwrap().replay.iter().cloned().collect()
    }

    /// Registers the sender into the relay's writer channel.
    pub fn register_input(&self, sender: mpsc::Sender<String>) {
        *self.input_tx.lock().unwrap() = Some(sender);
    }

    /// Forwards subscriber input to the relay writer, refreshing the idle
    /// clock. Returns false when no relay is registered or the writer is gone.
    pub async fn send_input(&self, data: String) -> bool {
        let sender = self.input_tx.lock().unwrap().clone();
        match sender {
            Some(sender) => {
                self.touch();
                sender.send(data).await.is_ok()
            }
            None => false,
        }
    }

    /// Marks the hub closed: future publishes are dropped and the input sender
    /// is released so the relay writer can wind down.
    pub fn close(&self) {
        self.shared.lock().unwrap().closed = true;
        self.input_tx.lock().unwrap().take();
    }

    /// Whether [`TaskHub::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().unwrap().closed
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.events_tx.receiver_count()
    }

    /// Seconds since the last non-heartbeat output or subscriber input.
    pub fn idle_seconds(&self) -> f64 {
        self.last_activity.lock().unwrap().elapsed().as_secs_f64()
    }

    /// Resets the idle clock.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}

//--------------------------------------------------------------------------------------------------
// Methods: HubRegistry
//--------------------------------------------------------------------------------------------------

impl HubRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the hub for a task, creating it on first use.
    pub async fn get_or_create(&self, task_id: Uuid) -> Arc<TaskHub> {
        let mut hubs = self.hubs.write().await;
        hubs.entry(task_id)
            .or_insert_with(|| Arc::new(TaskHub::new()))
            .clone()
    }

    /// Returns the hub for a task, if one exists.
    pub async fn get(&self, task_id: Uuid) -> Option<Arc<TaskHub>> {
        self.hubs.read().await.get(&task_id).cloned()
    }

    /// Removes the hub once it is closed and the last subscriber is gone.
    /// Called after a subscriber disconnects and after the task terminates.
    pub async fn release(&self, task_id: Uuid) {
        let mut hubs = self.hubs.write().await;
        if let Some(hub) = hubs.get(&task_id) {
            if hub.is_closed() && hub.subscriber_count() == 0 {
                hubs.remove(&task_id);
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn output(data: &str) -> WsEvent {
        WsEvent::Output {
            data: data.to_string(),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_replay_then_live_has_no_gap_or_duplicate() {
        let hub = TaskHub::new();

        hub.publish(output("a"));
        hub.publish(output("b"));

        let (replay, mut rx) = hub.subscribe();
        assert_eq!(replay, vec![output("a"), output("b")]);

        hub.publish(output("c"));

        // The live receiver starts exactly after the snapshot.
        assert_eq!(rx.try_recv().unwrap(), output("c"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_replay_ring_evicts_oldest() {
        let hub = TaskHub::new();

        for i in 0..(REPLAY_CAPACITY + 10) {
            hub.publish(output(&format!("line-{}", i)));
        }

        let replay = hub.replay();
        assert_eq!(replay.len(), REPLAY_CAPACITY);
        assert_eq!(replay[0], output("line-10"));
    }

    #[test]
    fn test_replay_ring_respects_byte_budget() {
        let hub = TaskHub::new();
        let chunk = "x".repeat(REPLAY_MAX_BYTES / 4 + 1);

        for _ in 0..8 {
            hub.publish(output(&chunk));
        }

        // At most 3 chunks of just over a quarter each fit in the budget.
        assert!(hub.replay().len() <= 3);
    }

    #[test]
    fn test_only_output_is_replayed() {
        let hub = TaskHub::new();

        hub.publish_progress(BootStage::CreatingVm);
        hub.publish(output("a"));
        hub.publish_status(TaskStatus::Running, None);

        let replay = hub.replay();
        assert_eq!(replay, vec![output("a")]);
    }

    #[test]
    fn test_slow_subscriber_lags_without_delaying_others() {
        let hub = TaskHub::new();

        let (_, mut slow) = hub.subscribe();
        let (_, mut fast) = hub.subscribe();

        // Overrun the per-subscriber bound while nobody reads `slow`.
        for i in 0..(SUBSCRIBER_QUEUE_BOUND + 50) {
            hub.publish(output(&format!("line-{}", i)));
        }

        // The slow subscriber observes a lag error rather than blocking the
        // hub; publishes never stalled on it.
        assert!(matches!(
            slow.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
        assert!(matches!(
            fast.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
        assert_eq!(hub.replay().len(), SUBSCRIBER_QUEUE_BOUND + 50);
    }

    #[test]
    fn test_closed_hub_drops_publishes() {
        let hub = TaskHub::new();
        hub.publish(output("before"));
        hub.close();
        hub.publish(output("after"));

        assert_eq!(hub.replay(), vec![output("before")]);
    }

    #[test_log::test(tokio::test)]
    async fn test_input_forwarding_requires_registration() {
        let hub = TaskHub::new();
        assert!(!hub.send_input("ls".to_string()).await);

        let (tx, mut rx) = mpsc::channel(4);
        hub.register_input(tx);

        assert!(hub.send_input("ls".to_string()).await);
        assert_eq!(rx.recv().await, Some("ls".to_string()));

        // Closing releases the sender; the writer channel ends.
        hub.close();
        assert!(!hub.send_input("pwd".to_string()).await);
        assert_eq!(rx.recv().await, None);
    }

    #[test_log::test(tokio::test)]
    async fn test_registry_release_requires_closed_and_unsubscribed() {
        let registry = HubRegistry::new();
        let task_id = Uuid::new_v4();

        let hub = registry.get_or_create(task_id).await;
        let (_, rx) = hub.subscribe();

        // Neither closed nor unsubscribed.
        registry.release(task_id).await;
        assert!(registry.get(task_id).await.is_some());

        // Closed, but a subscriber remains.
        hub.close();
        registry.release(task_id).await;
        assert!(registry.get(task_id).await.is_some());

        // Last subscriber gone.
        drop(rx);
        registry.release(task_id).await;
        assert!(registry.get(task_id).await.is_none());
    }
}
