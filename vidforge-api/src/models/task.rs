use serde::{Deserialize, Serialize};

/// Task lifecycle states.
///
/// Transitions are strictly monotonic except that Converting may end in
/// Cancelled or Failed; Completed, Failed and Cancelled are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Converting,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Converting => "converting",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "converting" => Some(TaskStatus::Converting),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states are sticky; no transition leaves them
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Check whether moving to `next` is a legal lifecycle transition
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Converting) => true,
            (TaskStatus::Pending, TaskStatus::Cancelled) => true,
            (TaskStatus::Pending, TaskStatus::Failed) => true,
            (TaskStatus::Converting, TaskStatus::Completed) => true,
            (TaskStatus::Converting, TaskStatus::Failed) => true,
            (TaskStatus::Converting, TaskStatus::Cancelled) => true,
            _ => false,
        }
    }
}

/// Full task view returned by `GET /api/conversion/status/{taskId}`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: String,
    pub task_name: String,
    pub original_file_name: String,
    pub original_file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file_size: Option<u64>,
    pub output_format: String,
    pub status: TaskStatus,
    /// Integer percent, 0..=100
    pub progress: u8,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Encoding speed as a realtime multiple (e.g. 1.5 for 1.5x)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    /// Media duration in seconds, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Current encode position in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_time_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Paged response for `GET /api/task/list`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskListPage {
    pub tasks: Vec<TaskSnapshot>,
    pub page: i64,
    pub page_size: i64,
    pub total_items: i64,
}
