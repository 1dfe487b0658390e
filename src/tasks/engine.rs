use crate::db::{Database, NewTaskRecord, TaskListFilter, TaskRecord, TaskUpdate};
use crate::push::PushBus;
use crate::space::{DiskBudget, UsageCategory};
use crate::tasks::encoder::{EncodeOutcome, EncodeRequest, Encoder, EncoderUpdate};
use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vidforge_api::models::{ConversionParams, TaskListPage, TaskSnapshot, TaskStatus};

/// Engine error types surfaced to the API layer
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Task not found: {0}")]
    NotFound(String),

    /// The requested transition is not legal from the task's current state
    #[error("{0}")]
    IllegalState(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum simultaneous encoder invocations
    pub max_concurrent: usize,
    /// Directory converted outputs are written into
    pub outputs_dir: PathBuf,
    /// Minimum interval between published progress events per task
    pub progress_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            outputs_dir: PathBuf::from("outputs"),
            progress_interval: Duration::from_millis(500),
        }
    }
}

/// Owns task entities end to end: creation, scheduling, encoder runs,
/// cancellation, and the progress stream.
///
/// State transitions are serialized per task (the scheduler is the single
/// writer for Pending -> Converting, the per-task run future for everything
/// after), terminal states are sticky, and at most one encoder runs per task
/// id at any time.
pub struct ConversionEngine {
    db: Arc<Database>,
    push: PushBus,
    budget: Arc<DiskBudget>,
    encoder: Encoder,
    config: EngineConfig,
    semaphore: Arc<Semaphore>,
    /// Run guard: task id -> cancellation token of the live encoder run
    running: DashMap<String, CancellationToken>,
    wake: Notify,
}

impl ConversionEngine {
    pub fn new(
        db: Arc<Database>,
        push: PushBus,
        budget: Arc<DiskBudget>,
        encoder: Encoder,
        config: EngineConfig,
    ) -> Arc<Self> {
        let max_concurrent = config.max_concurrent.max(1);
        Arc::new(Self {
            db,
            push,
            budget,
            encoder,
            config,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            running: DashMap::new(),
            wake: Notify::new(),
        })
    }

    /// Reset tasks left in Converting by an unclean shutdown back to Pending.
    /// Run once at startup before the scheduler starts.
    pub fn recover_interrupted(&self) -> Result<()> {
        let reset = self.db.reset_converting_tasks()?;
        if reset > 0 {
            info!(
                target: "tasks::engine",
                count = reset,
                "Re-queued conversions interrupted by restart"
            );
        }
        Ok(())
    }

    /// Start the background scheduler loop
    pub fn spawn_scheduler(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                target: "tasks::engine",
                concurrency = engine.config.max_concurrent,
                "Conversion scheduler started"
            );
            loop {
                match engine.db.next_pending_task() {
                    Ok(Some(task)) => {
                        let permit = match engine.semaphore.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            // Closed semaphore means shutdown
                            Err(_) => break,
                        };
                        engine.launch_task(task, permit).await;
                    }
                    Ok(None) => {
                        // Wait for a create() wakeup, with a fallback poll
                        tokio::select! {
                            _ = engine.wake.notified() => {}
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                    Err(err) => {
                        error!(
                            target: "tasks::engine",
                            error = %err,
                            "Failed to poll pending tasks"
                        );
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    /// Create a task for a merged artifact. Idempotent per artifact: an
    /// existing live task for the same artifact is returned unchanged.
    pub fn create_task(
        &self,
        artifact: &Path,
        original_file_name: &str,
        original_file_size: u64,
        params: ConversionParams,
        client_token: Option<String>,
        source_path: Option<String>,
    ) -> Result<TaskRecord> {
        let artifact_str = artifact.display().to_string();
        if let Some(existing) = self.db.find_live_task_by_artifact(&artifact_str)? {
            debug!(
                target: "tasks::engine",
                task_id = %existing.id,
                "Live task already exists for artifact"
            );
            return Ok(existing);
        }

        let task_id = Uuid::new_v4().to_string();
        let stem = original_file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(original_file_name);
        let task_name = format!("{stem}.{}", params.output_format);

        let mut record = NewTaskRecord::new(
            task_id.clone(),
            task_name,
            original_file_name,
            original_file_size as i64,
            artifact_str,
            params,
        );
        if let Some(token) = client_token {
            record = record.with_client_token(token);
        }
        if let Some(path) = source_path {
            record = record.with_source_path(path);
        }

        let task = self.db.insert_task(&record)?;
        info!(
            target: "tasks::engine",
            task_id = %task.id,
            file = %task.original_file_name,
            format = %task.output_format,
            "Conversion task created"
        );

        self.wake.notify_waiters();
        Ok(task)
    }

    async fn launch_task(
        self: &Arc<Self>,
        task: TaskRecord,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        // Re-check state: the task may have been cancelled while queued
        match self.db.get_task(&task.id) {
            Ok(Some(current)) if current.status == TaskStatus::Pending => {}
            Ok(_) => {
                debug!(
                    target: "tasks::engine",
                    task_id = %task.id,
                    "Task no longer pending, skipping"
                );
                return;
            }
            Err(err) => {
                warn!(
                    target: "tasks::engine",
                    task_id = %task.id,
                    error = %err,
                    "Failed to re-check task before launch"
                );
                return;
            }
        }

        let token = CancellationToken::new();
        self.running.insert(task.id.clone(), token.clone());

        if let Err(err) = self.db.update_task(
            &task.id,
            TaskUpdate {
                status: Some(TaskStatus::Converting),
                started_at: Some(Some(Utc::now().timestamp())),
                ..Default::default()
            },
        ) {
            error!(
                target: "tasks::engine",
                task_id = %task.id,
                error = %err,
                "Failed to mark task converting"
            );
            self.running.remove(&task.id);
            return;
        }

        self.push
            .status_update(&task.id, TaskStatus::Converting, None);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_task(task, token).await;
            drop(permit);
        });
    }

    async fn run_task(self: Arc<Self>, task: TaskRecord, token: CancellationToken) {
        let output_path = self
            .config
            .outputs_dir
            .join(format!("{}.{}", task.id, task.output_format));
        let request = EncodeRequest {
            input: PathBuf::from(&task.artifact_path),
            output: output_path.clone(),
            params: task.params.clone(),
        };

        info!(
            target: "tasks::engine",
            task_id = %task.id,
            input = %task.artifact_path,
            output = %output_path.display(),
            "Starting conversion"
        );

        let mut reporter = ProgressReporter::new(
            self.db.clone(),
            self.push.clone(),
            task.id.clone(),
            self.config.progress_interval,
        );

        let outcome = self
            .encoder
            .run(&request, &token, |update| match update {
                EncoderUpdate::Progress(snapshot) => reporter.on_progress(snapshot),
                EncoderUpdate::Duration(duration) => reporter.on_duration(duration),
            })
            .await;

        self.running.remove(&task.id);

        match outcome {
            Ok(EncodeOutcome::Completed) => self.finish_completed(&task, &output_path).await,
            Ok(EncodeOutcome::Cancelled) => self.finish_cancelled(&task, &output_path).await,
            Ok(EncodeOutcome::Failed { reason }) => {
                self.finish_failed(&task, &output_path, reason).await
            }
            Err(err) => {
                self.finish_failed(&task, &output_path, format!("Encoder error: {err:#}"))
                    .await
            }
        }
    }

    async fn finish_completed(&self, task: &TaskRecord, output_path: &Path) {
        let output_size = tokio::fs::metadata(output_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let output_file_name = format!(
            "{}.{}",
            task.original_file_name
                .rsplit_once('.')
                .map(|(stem, _)| stem)
                .unwrap_or(&task.original_file_name),
            task.output_format
        );

        if let Err(err) = self.db.update_task(
            &task.id,
            TaskUpdate {
                status: Some(TaskStatus::Completed),
                progress: Some(100),
                output_file_name: Some(Some(output_file_name)),
                output_file_size: Some(Some(output_size as i64)),
                output_path: Some(Some(output_path.display().to_string())),
                completed_at: Some(Some(Utc::now().timestamp())),
                eta_seconds: Some(None),
                ..Default::default()
            },
        ) {
            error!(
                target: "tasks::engine",
                task_id = %task.id,
                error = %err,
                "Failed to persist completion"
            );
        }

        self.budget
            .update_usage(output_size as i64, UsageCategory::Converted)
            .await;

        info!(
            target: "tasks::engine",
            task_id = %task.id,
            output_bytes = output_size,
            "Conversion completed"
        );

        self.push
            .progress_update(&task.id, 100, "Conversion completed", None, Some(0));
        self.push
            .status_update(&task.id, TaskStatus::Completed, None);
        self.push
            .task_completed(&task.id, &task.task_name, true, None);
    }

    async fn finish_cancelled(&self, task: &TaskRecord, output_path: &Path) {
        // A cancelled run must not leave a half-written output behind
        let _ = tokio::fs::remove_file(output_path).await;

        if let Err(err) = self.db.update_task(
            &task.id,
            TaskUpdate {
                status: Some(TaskStatus::Cancelled),
                completed_at: Some(Some(Utc::now().timestamp())),
                eta_seconds: Some(None),
                ..Default::default()
            },
        ) {
            error!(
                target: "tasks::engine",
                task_id = %task.id,
                error = %err,
                "Failed to persist cancellation"
            );
        }

        info!(target: "tasks::engine", task_id = %task.id, "Conversion cancelled");
        self.push
            .status_update(&task.id, TaskStatus::Cancelled, None);
    }

    async fn finish_failed(&self, task: &TaskRecord, output_path: &Path, reason: String) {
        let _ = tokio::fs::remove_file(output_path).await;

        if let Err(err) = self.db.update_task(
            &task.id,
            TaskUpdate {
                status: Some(TaskStatus::Failed),
                error: Some(Some(reason.clone())),
                completed_at: Some(Some(Utc::now().timestamp())),
                eta_seconds: Some(None),
                ..Default::default()
            },
        ) {
            error!(
                target: "tasks::engine",
                task_id = %task.id,
                error = %err,
                "Failed to persist failure"
            );
        }

        warn!(
            target: "tasks::engine",
            task_id = %task.id,
            reason = %reason,
            "Conversion failed"
        );
        self.push
            .status_update(&task.id, TaskStatus::Failed, Some(reason.clone()));
        self.push
            .task_completed(&task.id, &task.task_name, false, Some(reason));
    }

    /// Cancel a pending or converting task
    pub async fn cancel(&self, task_id: &str) -> Result<(), EngineError> {
        let task = self
            .db
            .get_task(task_id)
            .map_err(EngineError::Other)?
            .ok_or_else(|| EngineError::NotFound(task_id.to_string()))?;

        match task.status {
            TaskStatus::Converting => {
                if let Some(entry) = self.running.get(task_id) {
                    info!(
                        target: "tasks::engine",
                        task_id = %task_id,
                        "Signalling encoder cancellation"
                    );
                    entry.value().cancel();
                    Ok(())
                } else {
                    // Converting row without a live run: unclean state, fix directly
                    self.db
                        .update_task(
                            task_id,
                            TaskUpdate {
                                status: Some(TaskStatus::Cancelled),
                                completed_at: Some(Some(Utc::now().timestamp())),
                                ..Default::default()
                            },
                        )
                        .map_err(EngineError::Other)?;
                    self.push
                        .status_update(task_id, TaskStatus::Cancelled, None);
                    Ok(())
                }
            }
            TaskStatus::Pending => {
                self.db
                    .update_task(
                        task_id,
                        TaskUpdate {
                            status: Some(TaskStatus::Cancelled),
                            completed_at: Some(Some(Utc::now().timestamp())),
                            ..Default::default()
                        },
                    )
                    .map_err(EngineError::Other)?;
                info!(target: "tasks::engine", task_id = %task_id, "Cancelled pending task");
                self.push
                    .status_update(task_id, TaskStatus::Cancelled, None);
                Ok(())
            }
            status => Err(EngineError::IllegalState(format!(
                "Task {task_id} is {} and cannot be cancelled",
                status.as_str()
            ))),
        }
    }

    /// Task snapshot by ID
    pub fn get_status(&self, task_id: &str) -> Result<Option<TaskSnapshot>, EngineError> {
        Ok(self
            .db
            .get_task(task_id)
            .map_err(EngineError::Other)?
            .map(|record| record.to_snapshot()))
    }

    /// Full task record by ID
    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, EngineError> {
        self.db.get_task(task_id).map_err(EngineError::Other)
    }

    /// Paged task listing
    pub fn list(&self, filter: &TaskListFilter) -> Result<TaskListPage, EngineError> {
        let (records, total) = self.db.list_tasks(filter).map_err(EngineError::Other)?;
        Ok(TaskListPage {
            tasks: records.iter().map(TaskRecord::to_snapshot).collect(),
            page: filter.page.max(1),
            page_size: filter.page_size,
            total_items: total,
        })
    }

    /// Snapshots of every task currently converting
    pub fn active_tasks(&self) -> Result<Vec<TaskSnapshot>, EngineError> {
        Ok(self
            .db
            .list_tasks_by_status(TaskStatus::Converting)
            .map_err(EngineError::Other)?
            .iter()
            .map(TaskRecord::to_snapshot)
            .collect())
    }

    /// Delete a task with its artifact and output. Forbidden while converting.
    pub async fn delete(&self, task_id: &str) -> Result<(), EngineError> {
        let task = self
            .db
            .get_task(task_id)
            .map_err(EngineError::Other)?
            .ok_or_else(|| EngineError::NotFound(task_id.to_string()))?;

        if task.status == TaskStatus::Converting {
            return Err(EngineError::IllegalState(format!(
                "Task {task_id} is converting and cannot be deleted"
            )));
        }

        let mut freed = 0u64;
        let artifact = PathBuf::from(&task.artifact_path);
        if let Ok(metadata) = tokio::fs::metadata(&artifact).await {
            freed += metadata.len();
            let _ = tokio::fs::remove_file(&artifact).await;
            self.budget
                .update_usage(-(metadata.len() as i64), UsageCategory::Uploaded)
                .await;
        }
        let mut sidecar = artifact.into_os_string();
        sidecar.push(".fp");
        let _ = tokio::fs::remove_file(PathBuf::from(sidecar)).await;

        if let Some(output_path) = &task.output_path {
            if let Ok(metadata) = tokio::fs::metadata(output_path).await {
                freed += metadata.len();
                let _ = tokio::fs::remove_file(output_path).await;
                self.budget
                    .update_usage(-(metadata.len() as i64), UsageCategory::Converted)
                    .await;
            }
        }

        self.db.delete_task(task_id).map_err(EngineError::Other)?;
        self.db
            .delete_retention_for_task(task_id)
            .map_err(EngineError::Other)?;

        info!(
            target: "tasks::engine",
            task_id = %task_id,
            freed_bytes = freed,
            "Task deleted"
        );
        if freed > 0 {
            self.push.space_released(freed, "task deleted");
        }
        Ok(())
    }

    /// Resolve a task reference a subscriber may hold.
    ///
    /// Lookup order: server task id, client-local upload token, original
    /// file name, original sender path. The fallbacks cover the window when
    /// the server id has not yet propagated to the sender.
    pub fn resolve_task_ref(&self, reference: &str) -> Result<Option<TaskRecord>, EngineError> {
        if let Some(task) = self.db.get_task(reference).map_err(EngineError::Other)? {
            return Ok(Some(task));
        }
        if let Some(task) = self
            .db
            .find_task_by_client_token(reference)
            .map_err(EngineError::Other)?
        {
            return Ok(Some(task));
        }
        if let Some(task) = self
            .db
            .find_task_by_file_name(reference)
            .map_err(EngineError::Other)?
        {
            return Ok(Some(task));
        }
        self.db
            .find_task_by_source_path(reference)
            .map_err(EngineError::Other)
    }

    /// Stop accepting work and cancel running conversions
    pub async fn shutdown(&self) {
        info!(target: "tasks::engine", "Shutting down conversion engine");
        self.semaphore.close();
        for entry in self.running.iter() {
            entry.value().cancel();
        }
        // Give encoder runs a moment to observe cancellation
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.running.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Per-run progress state: throttling, monotonic clamping, and fan-out to
/// the database and the push channel.
struct ProgressReporter {
    db: Arc<Database>,
    push: PushBus,
    task_id: String,
    interval: Duration,
    duration_seconds: Option<f64>,
    last_percent: u8,
    last_emit: Option<Instant>,
}

impl ProgressReporter {
    fn new(db: Arc<Database>, push: PushBus, task_id: String, interval: Duration) -> Self {
        Self {
            db,
            push,
            task_id,
            interval,
            duration_seconds: None,
            last_percent: 0,
            last_emit: None,
        }
    }

    fn on_duration(&mut self, duration: f64) {
        self.duration_seconds = Some(duration);
        let _ = self.db.update_task(
            &self.task_id,
            TaskUpdate {
                duration_seconds: Some(Some(duration)),
                ..Default::default()
            },
        );
    }

    fn on_progress(&mut self, snapshot: crate::tasks::encoder::ProgressSnapshot) {
        // Throttle to one event per interval; boundary events (the final
        // block) always go out
        let now = Instant::now();
        if !snapshot.finished {
            if let Some(last) = self.last_emit {
                if now.duration_since(last) < self.interval {
                    return;
                }
            }
        }
        self.last_emit = Some(now);

        let percent = match (snapshot.out_time_seconds, self.duration_seconds) {
            (Some(position), Some(duration)) if duration > 0.0 => {
                ((position / duration) * 100.0).clamp(0.0, 99.0) as u8
            }
            _ => self.last_percent,
        };
        // Progress never moves backwards while converting
        let percent = percent.max(self.last_percent);
        self.last_percent = percent;

        let eta_seconds = match (snapshot.out_time_seconds, self.duration_seconds, snapshot.speed)
        {
            (Some(position), Some(duration), Some(speed)) if speed > 0.0 && duration > position => {
                Some(((duration - position) / speed) as u64)
            }
            _ => None,
        };

        let _ = self.db.update_task(
            &self.task_id,
            TaskUpdate {
                progress: Some(percent as i32),
                speed: Some(snapshot.speed),
                eta_seconds: Some(eta_seconds.map(|e| e as i64)),
                current_time_seconds: Some(snapshot.out_time_seconds),
                ..Default::default()
            },
        );

        self.push.progress_update(
            &self.task_id,
            percent,
            "Converting",
            snapshot.speed,
            eta_seconds,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::{Event, PushBus};
    use crate::tasks::encoder::{EncoderConfig, ProgressSnapshot};
    use tempfile::tempdir;
    use vidforge_api::models::DiskSpaceConfig;

    async fn engine_fixture() -> (Arc<ConversionEngine>, PushBus, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        let push = PushBus::new(64);
        let budget = Arc::new(
            DiskBudget::new(
                db.clone(),
                push.clone(),
                dir.path().join("uploads"),
                dir.path().join("outputs"),
                dir.path().join("temp"),
                DiskSpaceConfig::default(),
            )
            .unwrap(),
        );
        let engine = ConversionEngine::new(
            db,
            push.clone(),
            budget,
            Encoder::new(EncoderConfig::default()),
            EngineConfig {
                outputs_dir: dir.path().join("outputs"),
                ..Default::default()
            },
        );
        (engine, push, dir)
    }

    #[tokio::test]
    async fn create_is_idempotent_per_artifact() {
        let (engine, _push, dir) = engine_fixture().await;
        let artifact = dir.path().join("u1_movie.mkv");

        let first = engine
            .create_task(
                &artifact,
                "movie.mkv",
                1024,
                ConversionParams::new("mp4"),
                Some("u1".to_string()),
                None,
            )
            .unwrap();
        let second = engine
            .create_task(
                &artifact,
                "movie.mkv",
                1024,
                ConversionParams::new("mp4"),
                Some("u1".to_string()),
                None,
            )
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.task_name, "movie.mp4");
        assert_eq!(first.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_pending_is_terminal_and_sticky() {
        let (engine, push, dir) = engine_fixture().await;
        let mut receiver = push.subscribe();

        let task = engine
            .create_task(
                &dir.path().join("u1_a.mkv"),
                "a.mkv",
                10,
                ConversionParams::new("mp4"),
                None,
                None,
            )
            .unwrap();

        engine.cancel(&task.id).await.unwrap();
        let snapshot = engine.get_status(&task.id).unwrap().unwrap();
        assert_eq!(snapshot.status, TaskStatus::Cancelled);

        // Second cancel is an illegal transition
        assert!(matches!(
            engine.cancel(&task.id).await,
            Err(EngineError::IllegalState(_))
        ));

        let envelope = receiver.recv().await.unwrap();
        assert!(matches!(
            envelope.event,
            Event::StatusUpdate {
                status: TaskStatus::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancel_unknown_task_is_not_found() {
        let (engine, _push, _dir) = engine_fixture().await;
        assert!(matches!(
            engine.cancel("ghost").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn resolve_falls_back_through_identifiers() {
        let (engine, _push, dir) = engine_fixture().await;
        let task = engine
            .create_task(
                &dir.path().join("u9_video.avi"),
                "video.avi",
                10,
                ConversionParams::new("mkv"),
                Some("upload-9".to_string()),
                Some("/home/sender/video.avi".to_string()),
            )
            .unwrap();

        for reference in [
            task.id.as_str(),
            "upload-9",
            "video.avi",
            "/home/sender/video.avi",
        ] {
            let resolved = engine.resolve_task_ref(reference).unwrap().unwrap();
            assert_eq!(resolved.id, task.id);
        }
        assert!(engine.resolve_task_ref("unrelated").unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_refuses_converting_tasks() {
        let (engine, _push, dir) = engine_fixture().await;
        let task = engine
            .create_task(
                &dir.path().join("u1_a.mkv"),
                "a.mkv",
                10,
                ConversionParams::new("mp4"),
                None,
                None,
            )
            .unwrap();

        engine
            .db
            .update_task(
                &task.id,
                TaskUpdate {
                    status: Some(TaskStatus::Converting),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(matches!(
            engine.delete(&task.id).await,
            Err(EngineError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn progress_reporter_is_monotonic() {
        let (engine, push, _dir) = engine_fixture().await;
        let mut receiver = push.subscribe();

        let mut reporter = ProgressReporter::new(
            engine.db.clone(),
            push.clone(),
            "t-x".to_string(),
            Duration::from_millis(0),
        );
        reporter.on_duration(100.0);

        reporter.on_progress(ProgressSnapshot {
            out_time_seconds: Some(50.0),
            speed: Some(2.0),
            frame: None,
            finished: false,
        });
        // A backward sample must not lower the published percent
        reporter.on_progress(ProgressSnapshot {
            out_time_seconds: Some(40.0),
            speed: Some(2.0),
            frame: None,
            finished: false,
        });

        let mut seen = Vec::new();
        while let Ok(envelope) = receiver.try_recv() {
            if let Event::ProgressUpdate { progress, .. } = envelope.event {
                seen.push(progress);
            }
        }
        assert_eq!(seen, vec![50, 50]);
    }
}
