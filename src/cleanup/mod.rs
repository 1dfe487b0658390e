//! Retention and storage reclamation.
//!
//! Downloads schedule their output for removal after the retention window;
//! periodic sweeps collect due outputs, stale temp areas, orphan blobs, and
//! old logs; usage thresholds escalate to aggressive and, past the emergency
//! line, retention-ignoring sweeps. Files belonging to a converting task are
//! never touched.

use crate::db::{Database, RetentionRecord, TaskRecord};
use crate::ingest::SessionManager;
use crate::push::{NotificationLevel, PushBus};
use crate::space::{DiskBudget, UsageCategory};
use crate::store::ChunkStore;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};
use vidforge_api::models::{CleanupResult, TaskStatus};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// What a sweep may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupScope {
    /// Outputs whose retention window has elapsed
    Downloads,
    /// Stale session temp directories and merge leftovers
    Temp,
    /// Artifacts and outputs no task refers to
    Orphans,
    /// Rotated log files past their age limit
    Logs,
    /// Everything above
    All,
}

impl CleanupScope {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "downloads" => Some(Self::Downloads),
            "temp" => Some(Self::Temp),
            "orphans" => Some(Self::Orphans),
            "logs" => Some(Self::Logs),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn includes(&self, other: CleanupScope) -> bool {
        *self == CleanupScope::All || *self == other
    }
}

/// Cleanup configuration
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Hours between a download and its scheduled removal
    pub retention_hours: i64,
    /// Temp areas older than this many hours are swept
    pub temp_max_age_hours: i64,
    /// Log files older than this many days are swept
    pub log_max_age_days: i64,
    /// Usage percent that triggers an aggressive sweep
    pub aggressive_percent: f64,
    /// Usage percent past which retention is ignored
    pub emergency_percent: f64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention_hours: 24,
            temp_max_age_hours: 24,
            log_max_age_days: 7,
            aggressive_percent: 85.0,
            emergency_percent: 95.0,
        }
    }
}

/// Scheduled and policy-triggered storage reclamation
pub struct RetentionEngine {
    db: Arc<Database>,
    budget: Arc<DiskBudget>,
    push: PushBus,
    store: ChunkStore,
    sessions: Arc<SessionManager>,
    outputs_dir: PathBuf,
    logs_dir: PathBuf,
    config: CleanupConfig,
}

impl RetentionEngine {
    pub fn new(
        db: Arc<Database>,
        budget: Arc<DiskBudget>,
        push: PushBus,
        store: ChunkStore,
        sessions: Arc<SessionManager>,
        outputs_dir: PathBuf,
        logs_dir: PathBuf,
        config: CleanupConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            budget,
            push,
            store,
            sessions,
            outputs_dir,
            logs_dir,
            config,
        })
    }

    /// Record a completed download, scheduling the output for removal after
    /// the retention window
    pub fn record_download(&self, task: &TaskRecord, client_id: Option<String>) -> Result<()> {
        let record = RetentionRecord::new(
            &task.id,
            task.output_file_name
                .clone()
                .unwrap_or_else(|| task.task_name.clone()),
            task.output_file_size.unwrap_or(0),
            self.config.retention_hours,
            client_id,
        );
        self.db
            .insert_retention_record(&record)
            .context("Failed to record download for retention")?;
        debug!(
            target: "cleanup",
            task_id = %task.id,
            cleanup_after = record.cleanup_after,
            "Download recorded, cleanup scheduled"
        );
        Ok(())
    }

    /// Mark a task's retention records cleaned without touching files
    /// (operator override)
    pub fn mark_cleaned_up(&self, task_id: &str) -> Result<usize> {
        self.db.mark_retention_cleaned(task_id)
    }

    /// Push back a task's scheduled cleanup (operator override)
    pub fn extend_retention(&self, task_id: &str, hours: i64) -> Result<usize> {
        self.db.extend_retention(task_id, hours)
    }

    /// Run a sweep over the requested scope.
    ///
    /// `ignore_retention` widens the downloads scope to every uncleaned
    /// record regardless of schedule; the emergency trigger is its only
    /// internal caller.
    pub async fn perform_cleanup(
        &self,
        scope: CleanupScope,
        ignore_retention: bool,
    ) -> Result<CleanupResult> {
        let mut result = CleanupResult::default();

        if scope.includes(CleanupScope::Downloads) {
            result.merge(self.sweep_downloads(ignore_retention).await?);
        }
        if scope.includes(CleanupScope::Temp) {
            result.merge(self.sweep_temp().await?);
        }
        if scope.includes(CleanupScope::Orphans) {
            result.merge(self.sweep_orphans().await?);
        }
        if scope.includes(CleanupScope::Logs) {
            result.merge(self.sweep_logs().await?);
        }

        if result.bytes_freed > 0 {
            info!(
                target: "cleanup",
                scope = ?scope,
                bytes_freed = result.bytes_freed,
                files_removed = result.files_removed,
                "Cleanup sweep finished"
            );
            self.push
                .space_released(result.bytes_freed, format!("cleanup sweep ({scope:?})"));
            self.budget.refresh().await?;
        }

        Ok(result)
    }

    /// Remove downloaded outputs whose retention has elapsed
    async fn sweep_downloads(&self, ignore_retention: bool) -> Result<CleanupResult> {
        let records = if ignore_retention {
            self.db.pending_retention_records()?
        } else {
            self.db.due_retention_records(Utc::now().timestamp())?
        };

        let mut result = CleanupResult::default();
        for record in records {
            let Some(task) = self.db.get_task(&record.task_id)? else {
                // Task already deleted; nothing to remove
                self.db.mark_retention_cleaned(&record.task_id)?;
                continue;
            };

            // A converting task is never subject to cleanup
            if task.status == TaskStatus::Converting {
                continue;
            }

            if let Some(output_path) = &task.output_path {
                let freed = remove_file_measured(Path::new(output_path)).await;
                if freed > 0 {
                    self.budget
                        .update_usage(-(freed as i64), UsageCategory::Converted)
                        .await;
                    result.bytes_freed += freed;
                    result.files_removed += 1;
                    *result
                        .by_category
                        .entry("downloads".to_string())
                        .or_insert(0) += freed;
                }
            }
            self.db.mark_retention_cleaned(&record.task_id)?;
        }
        Ok(result)
    }

    /// Remove stale session temp directories and merge leftovers
    async fn sweep_temp(&self) -> Result<CleanupResult> {
        let mut result = CleanupResult::default();
        let max_age = Duration::from_secs(self.config.temp_max_age_hours.max(0) as u64 * 3600);

        let mut entries = match fs::read_dir(self.store.temp_root()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(result),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(upload_id) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Live sessions are the session manager's to evict, not ours
            if self.sessions.status(upload_id).is_ok() {
                continue;
            }
            if !is_older_than(&entry, max_age).await {
                continue;
            }

            let freed = dir_size_then_remove(&path).await;
            if freed > 0 {
                self.budget
                    .update_usage(-(freed as i64), UsageCategory::Temp)
                    .await;
                result.bytes_freed += freed;
                result.files_removed += 1;
                *result.by_category.entry("temp".to_string()).or_insert(0) += freed;
            }
        }

        // Merge .part leftovers in the uploads directory
        let mut entries = match fs::read_dir(self.store.uploads_dir()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(result),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "part")
                && is_older_than(&entry, max_age).await
            {
                let freed = remove_file_measured(&path).await;
                result.bytes_freed += freed;
                result.files_removed += 1;
                *result.by_category.entry("temp".to_string()).or_insert(0) += freed;
            }
        }

        Ok(result)
    }

    /// Remove artifacts and outputs no task row refers to
    async fn sweep_orphans(&self) -> Result<CleanupResult> {
        let mut result = CleanupResult::default();

        let tasks = self.db.list_all_tasks()?;
        let referenced_artifacts: HashSet<&str> =
            tasks.iter().map(|t| t.artifact_path.as_str()).collect();
        let referenced_outputs: HashSet<&str> = tasks
            .iter()
            .filter_map(|t| t.output_path.as_deref())
            .collect();

        let mut entries = match fs::read_dir(self.store.uploads_dir()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(result),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "fp" || ext == "part") {
                continue;
            }
            let path_str = path.display().to_string();
            if referenced_artifacts.contains(path_str.as_str()) {
                continue;
            }

            let freed = remove_file_measured(&path).await;
            let mut sidecar = path.into_os_string();
            sidecar.push(".fp");
            let _ = fs::remove_file(PathBuf::from(sidecar)).await;

            if freed > 0 {
                self.budget
                    .update_usage(-(freed as i64), UsageCategory::Uploaded)
                    .await;
                result.bytes_freed += freed;
                result.files_removed += 1;
                *result.by_category.entry("orphans".to_string()).or_insert(0) += freed;
            }
        }

        let mut entries = match fs::read_dir(&self.outputs_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(result),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let path_str = path.display().to_string();
            if referenced_outputs.contains(path_str.as_str()) {
                continue;
            }

            let freed = remove_file_measured(&path).await;
            if freed > 0 {
                self.budget
                    .update_usage(-(freed as i64), UsageCategory::Converted)
                    .await;
                result.bytes_freed += freed;
                result.files_removed += 1;
                *result.by_category.entry("orphans".to_string()).or_insert(0) += freed;
            }
        }

        Ok(result)
    }

    /// Remove rotated log files past the age limit
    async fn sweep_logs(&self) -> Result<CleanupResult> {
        let mut result = CleanupResult::default();
        let max_age =
            Duration::from_secs(self.config.log_max_age_days.max(0) as u64 * 24 * 3600);

        let mut entries = match fs::read_dir(&self.logs_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(result),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_older_than(&entry, max_age).await {
                continue;
            }
            let freed = remove_file_measured(&path).await;
            if freed > 0 {
                result.bytes_freed += freed;
                result.files_removed += 1;
                *result.by_category.entry("logs".to_string()).or_insert(0) += freed;
            }
        }
        Ok(result)
    }

    /// Escalate sweeps when usage crosses the configured thresholds
    pub async fn check_thresholds(&self) -> Result<()> {
        let status = self.budget.status().await;

        if status.usage_percent >= self.config.emergency_percent {
            warn!(
                target: "cleanup",
                usage_percent = status.usage_percent,
                "Emergency threshold crossed, sweeping with retention ignored"
            );
            self.push.space_warning(
                "Disk usage critical; reclaiming storage including retained downloads",
                status.usage_percent,
                status.available_space as f64 / GIB,
            );
            self.push.system_notification(
                format!(
                    "Emergency cleanup triggered at {:.1}% usage",
                    status.usage_percent
                ),
                NotificationLevel::Error,
            );
            self.perform_cleanup(CleanupScope::All, true).await?;
        } else if status.usage_percent >= self.config.aggressive_percent {
            info!(
                target: "cleanup",
                usage_percent = status.usage_percent,
                "Aggressive threshold crossed, sweeping due files"
            );
            self.push.space_warning(
                "Disk usage high; reclaiming expired files",
                status.usage_percent,
                status.available_space as f64 / GIB,
            );
            self.perform_cleanup(CleanupScope::All, false).await?;
        }

        Ok(())
    }

    /// Background sweeper: periodic scope-All sweep plus threshold checks
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = engine.perform_cleanup(CleanupScope::All, false).await {
                    warn!(target: "cleanup", error = %err, "Periodic sweep failed");
                }
                if let Err(err) = engine.check_thresholds().await {
                    warn!(target: "cleanup", error = %err, "Threshold check failed");
                }
            }
        });
    }
}

async fn remove_file_measured(path: &Path) -> u64 {
    let size = match fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => metadata.len(),
        _ => return 0,
    };
    match fs::remove_file(path).await {
        Ok(()) => size,
        Err(err) => {
            warn!(
                target: "cleanup",
                path = %path.display(),
                error = %err,
                "Failed to remove file"
            );
            0
        }
    }
}

async fn dir_size_then_remove(path: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = fs::read_dir(&dir).await else { continue };
        while let Ok(Some(entry)) = entries.next_entry().await {
            match entry.metadata().await {
                Ok(metadata) if metadata.is_dir() => stack.push(entry.path()),
                Ok(metadata) => total += metadata.len(),
                Err(_) => {}
            }
        }
    }
    match fs::remove_dir_all(path).await {
        Ok(()) => total,
        Err(err) => {
            warn!(
                target: "cleanup",
                path = %path.display(),
                error = %err,
                "Failed to remove directory"
            );
            0
        }
    }
}

async fn is_older_than(entry: &fs::DirEntry, max_age: Duration) -> bool {
    match entry.metadata().await {
        Ok(metadata) => metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map(|age| age >= max_age)
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewTaskRecord, TaskUpdate};
    use crate::ingest::IngestConfig;
    use crate::push::PushBus;
    use crate::tasks::{ConversionEngine, Encoder, EncoderConfig, EngineConfig};
    use tempfile::tempdir;
    use vidforge_api::models::{ConversionParams, DiskSpaceConfig};

    struct Fixture {
        engine: Arc<RetentionEngine>,
        db: Arc<Database>,
        dir: tempfile::TempDir,
    }

    async fn fixture(config: CleanupConfig) -> Fixture {
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
        let store = ChunkStore::new(dir.path().join("temp"), dir.path().join("uploads"));
        let conversion = ConversionEngine::new(
            db.clone(),
            push.clone(),
            budget.clone(),
            Encoder::new(EncoderConfig::default()),
            EngineConfig {
                outputs_dir: dir.path().join("outputs"),
                ..Default::default()
            },
        );
        let sessions = SessionManager::new(
            store.clone(),
            budget.clone(),
            conversion,
            IngestConfig {
                chunk_size: 8,
                max_file_size: 1024,
                quick_fingerprint_threshold: 512,
                verify_final_fingerprint: false,
                session_ttl: Duration::from_secs(24 * 3600),
            },
        );
        let engine = RetentionEngine::new(
            db.clone(),
            budget,
            push,
            store,
            sessions,
            dir.path().join("outputs"),
            dir.path().join("logs"),
            config,
        );
        Fixture { engine, db, dir }
    }

    async fn completed_task_with_output(fixture: &Fixture, id: &str) -> TaskRecord {
        let output_path = fixture.dir.path().join("outputs").join(format!("{id}.mp4"));
        fs::create_dir_all(output_path.parent().unwrap()).await.unwrap();
        fs::write(&output_path, vec![1u8; 64]).await.unwrap();

        fixture
            .db
            .insert_task(&NewTaskRecord::new(
                id,
                format!("{id}.mp4"),
                "movie.mkv",
                100,
                fixture
                    .dir
                    .path()
                    .join("uploads")
                    .join(format!("{id}_movie.mkv"))
                    .display()
                    .to_string(),
                ConversionParams::new("mp4"),
            ))
            .unwrap();
        fixture
            .db
            .update_task(
                id,
                TaskUpdate {
                    status: Some(TaskStatus::Completed),
                    output_path: Some(Some(output_path.display().to_string())),
                    output_file_size: Some(Some(64)),
                    output_file_name: Some(Some("movie.mp4".to_string())),
                    ..Default::default()
                },
            )
            .unwrap();
        fixture.db.get_task(id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn due_download_is_swept_and_marked() {
        let fixture = fixture(CleanupConfig {
            retention_hours: 0,
            ..Default::default()
        })
        .await;
        let task = completed_task_with_output(&fixture, "t1").await;

        fixture.engine.record_download(&task, None).unwrap();

        let result = fixture
            .engine
            .perform_cleanup(CleanupScope::Downloads, false)
            .await
            .unwrap();
        assert_eq!(result.files_removed, 1);
        assert_eq!(result.bytes_freed, 64);
        assert!(!Path::new(task.output_path.as_ref().unwrap()).exists());

        // Nothing left to sweep
        let again = fixture
            .engine
            .perform_cleanup(CleanupScope::Downloads, false)
            .await
            .unwrap();
        assert_eq!(again.files_removed, 0);
    }

    #[tokio::test]
    async fn unexpired_retention_requires_ignore_flag() {
        let fixture = fixture(CleanupConfig {
            retention_hours: 1000,
            ..Default::default()
        })
        .await;
        let task = completed_task_with_output(&fixture, "t1").await;
        fixture.engine.record_download(&task, None).unwrap();

        let result = fixture
            .engine
            .perform_cleanup(CleanupScope::Downloads, false)
            .await
            .unwrap();
        assert_eq!(result.files_removed, 0);
        assert!(Path::new(task.output_path.as_ref().unwrap()).exists());

        let result = fixture
            .engine
            .perform_cleanup(CleanupScope::Downloads, true)
            .await
            .unwrap();
        assert_eq!(result.files_removed, 1);
    }

    #[tokio::test]
    async fn converting_tasks_are_never_cleaned() {
        let fixture = fixture(CleanupConfig {
            retention_hours: 0,
            temp_max_age_hours: 0,
            ..Default::default()
        })
        .await;
        let task = completed_task_with_output(&fixture, "t1").await;
        fixture.engine.record_download(&task, None).unwrap();
        fixture
            .db
            .update_task(
                "t1",
                TaskUpdate {
                    status: Some(TaskStatus::Converting),
                    ..Default::default()
                },
            )
            .unwrap();

        let result = fixture
            .engine
            .perform_cleanup(CleanupScope::All, true)
            .await
            .unwrap();
        assert!(Path::new(task.output_path.as_ref().unwrap()).exists());
        assert_eq!(*result.by_category.get("downloads").unwrap_or(&0), 0);
    }

    #[tokio::test]
    async fn orphan_artifacts_are_removed_but_referenced_ones_kept() {
        let fixture = fixture(CleanupConfig::default()).await;
        let uploads = fixture.dir.path().join("uploads");
        fs::create_dir_all(&uploads).await.unwrap();

        let task = completed_task_with_output(&fixture, "t1").await;
        fs::write(&task.artifact_path, vec![0u8; 32]).await.unwrap();
        fs::write(uploads.join("ghost_upload.mkv"), vec![0u8; 48])
            .await
            .unwrap();
        fs::write(uploads.join("ghost_upload.mkv.fp"), "full:aabb")
            .await
            .unwrap();

        let result = fixture
            .engine
            .perform_cleanup(CleanupScope::Orphans, false)
            .await
            .unwrap();

        assert!(Path::new(&task.artifact_path).exists());
        assert!(!uploads.join("ghost_upload.mkv").exists());
        assert!(!uploads.join("ghost_upload.mkv.fp").exists());
        assert_eq!(*result.by_category.get("orphans").unwrap(), 48);
    }

    #[tokio::test]
    async fn stale_temp_dirs_are_swept() {
        let fixture = fixture(CleanupConfig {
            temp_max_age_hours: 0,
            ..Default::default()
        })
        .await;
        let temp = fixture.dir.path().join("temp").join("dead-session");
        fs::create_dir_all(&temp).await.unwrap();
        fs::write(temp.join("chunk_000000"), vec![0u8; 16]).await.unwrap();

        let result = fixture
            .engine
            .perform_cleanup(CleanupScope::Temp, false)
            .await
            .unwrap();
        assert_eq!(result.bytes_freed, 16);
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn young_temp_dirs_survive_the_sweep() {
        let fixture = fixture(CleanupConfig {
            temp_max_age_hours: 1000,
            ..Default::default()
        })
        .await;
        let temp = fixture.dir.path().join("temp").join("fresh-session");
        fs::create_dir_all(&temp).await.unwrap();
        fs::write(temp.join("chunk_000000"), vec![0u8; 16]).await.unwrap();

        let result = fixture
            .engine
            .perform_cleanup(CleanupScope::Temp, false)
            .await
            .unwrap();
        assert_eq!(result.bytes_freed, 0);
        assert!(temp.exists());
    }

    #[tokio::test]
    async fn old_logs_are_swept() {
        let fixture = fixture(CleanupConfig {
            log_max_age_days: 0,
            ..Default::default()
        })
        .await;
        let logs = fixture.dir.path().join("logs");
        fs::create_dir_all(&logs).await.unwrap();
        fs::write(logs.join("vidforged.2025-01-01.log"), vec![0u8; 128])
            .await
            .unwrap();

        let result = fixture
            .engine
            .perform_cleanup(CleanupScope::Logs, false)
            .await
            .unwrap();
        assert_eq!(result.bytes_freed, 128);
    }

    #[test]
    fn scope_parsing() {
        assert_eq!(CleanupScope::from_str("downloads"), Some(CleanupScope::Downloads));
        assert_eq!(CleanupScope::from_str("all"), Some(CleanupScope::All));
        assert_eq!(CleanupScope::from_str("everything"), None);
    }
}
