use chrono::Utc;
use serde::{Deserialize, Serialize};
use vidforge_api::models::{ConversionParams, TaskSnapshot, TaskStatus};

/// A persisted conversion task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub task_name: String,
    pub original_file_name: String,
    pub original_file_size: i64,
    pub original_format: Option<String>,
    /// Merged upload artifact the encoder reads from
    pub artifact_path: String,
    pub output_file_name: Option<String>,
    pub output_file_size: Option<i64>,
    pub output_format: String,
    pub output_path: Option<String>,
    pub params: ConversionParams,
    /// Client-chosen upload id, kept for progress identifier reconciliation
    pub client_token: Option<String>,
    /// Original sender-side path, when the client reported one
    pub source_path: Option<String>,
    pub status: TaskStatus,
    pub progress: i32,
    pub speed: Option<f64>,
    pub eta_seconds: Option<i64>,
    pub duration_seconds: Option<f64>,
    pub current_time_seconds: Option<f64>,
    pub error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

impl TaskRecord {
    /// Wire snapshot for the REST surface and the push channel
    pub fn to_snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.clone(),
            task_name: self.task_name.clone(),
            original_file_name: self.original_file_name.clone(),
            original_file_size: self.original_file_size.max(0) as u64,
            original_format: self.original_format.clone(),
            output_file_name: self.output_file_name.clone(),
            output_file_size: self.output_file_size.map(|s| s.max(0) as u64),
            output_format: self.output_format.clone(),
            status: self.status,
            progress: self.progress.clamp(0, 100) as u8,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            speed: self.speed,
            eta_seconds: self.eta_seconds.map(|e| e.max(0) as u64),
            duration_seconds: self.duration_seconds,
            current_time_seconds: self.current_time_seconds,
            error_message: self.error.clone(),
        }
    }
}

/// Entry for inserting a new task
#[derive(Debug, Clone)]
pub struct NewTaskRecord {
    pub id: String,
    pub task_name: String,
    pub original_file_name: String,
    pub original_file_size: i64,
    pub original_format: Option<String>,
    pub artifact_path: String,
    pub output_format: String,
    pub params: ConversionParams,
    pub client_token: Option<String>,
    pub source_path: Option<String>,
    pub created_at: i64,
}

impl NewTaskRecord {
    pub fn new(
        id: impl Into<String>,
        task_name: impl Into<String>,
        original_file_name: impl Into<String>,
        original_file_size: i64,
        artifact_path: impl Into<String>,
        params: ConversionParams,
    ) -> Self {
        let original_file_name = original_file_name.into();
        let original_format = original_file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase());
        Self {
            id: id.into(),
            task_name: task_name.into(),
            original_file_name,
            original_file_size,
            original_format,
            artifact_path: artifact_path.into(),
            output_format: params.output_format.clone(),
            params,
            client_token: None,
            source_path: None,
            created_at: Utc::now().timestamp(),
        }
    }

    pub fn with_client_token(mut self, token: impl Into<String>) -> Self {
        self.client_token = Some(token.into());
        self
    }

    pub fn with_source_path(mut self, path: impl Into<String>) -> Self {
        self.source_path = Some(path.into());
        self
    }
}

/// Partial update applied to a task row.
///
/// `Option<Option<T>>` fields distinguish "leave unchanged" (`None`) from
/// "set to NULL" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<i32>,
    pub speed: Option<Option<f64>>,
    pub eta_seconds: Option<Option<i64>>,
    pub duration_seconds: Option<Option<f64>>,
    pub current_time_seconds: Option<Option<f64>>,
    pub output_file_name: Option<Option<String>>,
    pub output_file_size: Option<Option<i64>>,
    pub output_path: Option<Option<String>>,
    pub error: Option<Option<String>>,
    pub started_at: Option<Option<i64>>,
    pub completed_at: Option<Option<i64>>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.progress.is_none()
            && self.speed.is_none()
            && self.eta_seconds.is_none()
            && self.duration_seconds.is_none()
            && self.current_time_seconds.is_none()
            && self.output_file_name.is_none()
            && self.output_file_size.is_none()
            && self.output_path.is_none()
            && self.error.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
    }
}

/// Filter for the paged task listing
#[derive(Debug, Clone, Default)]
pub struct TaskListFilter {
    pub status: Option<TaskStatus>,
    /// Case-insensitive substring match against task and file names
    pub search: Option<String>,
    pub page: i64,
    pub page_size: i64,
}

/// One record per completed download, driving retention cleanup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionRecord {
    pub id: String,
    pub task_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub downloaded_at: i64,
    pub cleanup_after: i64,
    pub cleaned_up: bool,
    pub cleaned_at: Option<i64>,
    pub client_id: Option<String>,
}

impl RetentionRecord {
    pub fn new(
        task_id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: i64,
        retention_hours: i64,
        client_id: Option<String>,
    ) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            file_name: file_name.into(),
            file_size,
            downloaded_at: now,
            cleanup_after: now + retention_hours * 3600,
            cleaned_up: false,
            cleaned_at: None,
            client_id,
        }
    }
}
