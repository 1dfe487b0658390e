//! Realtime push channel.
//!
//! A process-wide broadcast bus carrying `(topic, event)` envelopes. Topics
//! group subscribers per task (`task:<id>`), per batch (`batch:<id>`), and by
//! concern (`space`, `system`). Connection handlers subscribe to the bus and
//! filter by their joined topics; delivery is at-least-once to connected
//! subscribers with FIFO ordering per connection, and nothing is replayed
//! after a reconnect.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use vidforge_api::models::{DiskUsage, TaskStatus};

/// Topic reaching every connected subscriber
pub const SYSTEM_TOPIC: &str = "system";
/// Topic for disk-space monitoring subscribers
pub const SPACE_TOPIC: &str = "space";

/// Per-task group topic
pub fn task_topic(task_id: &str) -> String {
    format!("task:{task_id}")
}

/// Per-batch group topic
pub fn batch_topic(batch_id: &str) -> String {
    format!("batch:{batch_id}")
}

/// Severity for system notifications
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Events pushed from the server to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum Event {
    ProgressUpdate {
        task_id: String,
        progress: u8,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        remaining_seconds: Option<u64>,
    },
    StatusUpdate {
        task_id: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    TaskCompleted {
        task_id: String,
        task_name: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    SystemNotification {
        message: String,
        level: NotificationLevel,
    },
    DiskSpaceUpdate {
        #[serde(flatten)]
        snapshot: DiskUsage,
    },
    SpaceReleased {
        released_bytes: u64,
        reason: String,
    },
    SpaceWarning {
        message: String,
        usage_percent: f64,
        available_gb: f64,
    },
    BatchTaskPaused {
        batch_id: String,
        reason: String,
        required_gb: f64,
        available_gb: f64,
    },
    BatchTaskResumed {
        batch_id: String,
        reason: String,
        required_gb: f64,
        available_gb: f64,
    },
}

/// A topic-addressed event on the bus
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    pub event: Event,
}

/// Push bus shared across the server
#[derive(Clone)]
pub struct PushBus {
    sender: Arc<broadcast::Sender<Envelope>>,
}

impl PushBus {
    /// Create a new push bus.
    ///
    /// `capacity` bounds the broadcast channel; slow subscribers past it see
    /// a lag error and must re-query state, which matches the channel's
    /// no-replay delivery contract.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Subscribe to the raw envelope stream
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Publish an event to a topic.
    ///
    /// Returns the number of receivers the envelope reached.
    pub fn publish(&self, topic: impl Into<String>, event: Event) -> usize {
        let envelope = Envelope {
            topic: topic.into(),
            event,
        };
        match self.sender.send(envelope) {
            Ok(count) => {
                tracing::trace!(target: "push", subscribers = count, "Event published");
                count
            }
            Err(_) => {
                // No live subscribers; events are not persisted by design
                0
            }
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Helper: progress update on the task's group
    pub fn progress_update(
        &self,
        task_id: &str,
        progress: u8,
        message: impl Into<String>,
        speed: Option<f64>,
        remaining_seconds: Option<u64>,
    ) {
        self.publish(
            task_topic(task_id),
            Event::ProgressUpdate {
                task_id: task_id.to_string(),
                progress,
                message: message.into(),
                speed,
                remaining_seconds,
            },
        );
    }

    /// Helper: status change on the task's group
    pub fn status_update(&self, task_id: &str, status: TaskStatus, error_message: Option<String>) {
        self.publish(
            task_topic(task_id),
            Event::StatusUpdate {
                task_id: task_id.to_string(),
                status,
                error_message,
            },
        );
    }

    /// Helper: terminal completion notice on the task's group
    pub fn task_completed(
        &self,
        task_id: &str,
        task_name: &str,
        success: bool,
        error_message: Option<String>,
    ) {
        self.publish(
            task_topic(task_id),
            Event::TaskCompleted {
                task_id: task_id.to_string(),
                task_name: task_name.to_string(),
                success,
                error_message,
            },
        );
    }

    /// Helper: broadcast a system notification to every subscriber
    pub fn system_notification(&self, message: impl Into<String>, level: NotificationLevel) {
        self.publish(
            SYSTEM_TOPIC,
            Event::SystemNotification {
                message: message.into(),
                level,
            },
        );
    }

    /// Helper: disk usage snapshot for space-monitoring subscribers
    pub fn disk_space_update(&self, snapshot: DiskUsage) {
        self.publish(SPACE_TOPIC, Event::DiskSpaceUpdate { snapshot });
    }

    /// Helper: storage reclaimed notice
    pub fn space_released(&self, released_bytes: u64, reason: impl Into<String>) {
        self.publish(
            SPACE_TOPIC,
            Event::SpaceReleased {
                released_bytes,
                reason: reason.into(),
            },
        );
    }

    /// Helper: usage threshold warning
    pub fn space_warning(&self, message: impl Into<String>, usage_percent: f64, available_gb: f64) {
        self.publish(
            SPACE_TOPIC,
            Event::SpaceWarning {
                message: message.into(),
                usage_percent,
                available_gb,
            },
        );
    }
}

impl Default for PushBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers_with_topic() {
        let bus = PushBus::new(16);
        let mut receiver = bus.subscribe();

        bus.progress_update("t-1", 37, "converting", Some(1.5), Some(120));

        let envelope = receiver.recv().await.unwrap();
        assert_eq!(envelope.topic, "task:t-1");
        match envelope.event {
            Event::ProgressUpdate {
                task_id, progress, ..
            } => {
                assert_eq!(task_id, "t-1");
                assert_eq!(progress, 37);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_are_fifo_per_subscriber() {
        let bus = PushBus::new(16);
        let mut receiver = bus.subscribe();

        for pct in [10u8, 20, 30] {
            bus.progress_update("t-1", pct, "converting", None, None);
        }

        for expected in [10u8, 20, 30] {
            match receiver.recv().await.unwrap().event {
                Event::ProgressUpdate { progress, .. } => assert_eq!(progress, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = PushBus::new(16);
        assert_eq!(bus.publish(SYSTEM_TOPIC, Event::SystemNotification {
            message: "hello".to_string(),
            level: NotificationLevel::Info,
        }), 0);
    }

    #[test]
    fn events_serialize_as_tagged_variants() {
        let event = Event::SpaceWarning {
            message: "disk almost full".to_string(),
            usage_percent: 91.5,
            available_gb: 4.2,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "spaceWarning");
        assert_eq!(value["data"]["usagePercent"], 91.5);
    }

    #[test]
    fn topic_grammar() {
        assert_eq!(task_topic("abc"), "task:abc");
        assert_eq!(batch_topic("b1"), "batch:b1");
    }
}
