//! Task lifecycle events for log and report consumers.

use super::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TaskEvent {
    #[serde(rename_all = "camelCase")]
    Start {
        task_id: Uuid,
        parent_id: Option<Uuid>,
        name: String,
        data: Value,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    Info {
        task_id: Uuid,
        message: String,
        data: Value,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    Warning {
        task_id: Uuid,
        message: String,
        data: Value,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    End {
        task_id: Uuid,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
        timestamp: DateTime<Utc>,
        duration_ms: i64,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            TaskEvent::Start { task_id, .. }
            | TaskEvent::Info { task_id, .. }
            | TaskEvent::Warning { task_id, .. }
            | TaskEvent::End { task_id, .. } => *task_id,
        }
    }
}

/// Fan-out sink for task events.
///
/// Cheap to clone; every clone publishes to the same subscribers.
#[derive(Debug, Clone)]
pub struct TaskLog {
    tx: broadcast::Sender<TaskEvent>,
}

impl TaskLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: TaskEvent) {
        // No subscriber is fine, events are also mirrored to tracing
        let _ = self.tx.send(event);
    }
}

impl Default for TaskLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let id = Uuid::new_v4();
        let event = TaskEvent::End {
            task_id: id,
            status: TaskStatus::Warning,
            result: Some(serde_json::json!({ "size": 10 })),
            error: None,
            timestamp: Utc::now(),
            duration_ms: 12,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "end");
        assert_eq!(json["status"], "warning");
        assert_eq!(json["durationMs"], 12);
        assert_eq!(json["taskId"], id.to_string());
        assert_eq!(event.task_id(), id);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let log = TaskLog::new();
        let mut rx = log.subscribe();
        let id = Uuid::new_v4();
        log.emit(TaskEvent::Info {
            task_id: id,
            message: "hello".into(),
            data: Value::Null,
            timestamp: Utc::now(),
        });
        assert_eq!(rx.recv().await.unwrap().task_id(), id);
    }
}
