use super::models::{NewTaskRecord, TaskListFilter, TaskRecord, TaskUpdate};
use super::schema::tasks::{self, dsl as tasks_dsl};
use super::Database;
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use diesel::prelude::*;
use vidforge_api::models::TaskStatus;

impl Database {
    /// Insert a new task in Pending state
    pub fn insert_task(&self, record: &NewTaskRecord) -> Result<TaskRecord> {
        let mut conn = self.connection()?;
        let row = NewTaskRow::try_from(record)?;
        diesel::insert_into(tasks::table)
            .values(&row)
            .execute(&mut conn)
            .context("Failed to insert task record")?;
        drop(conn);
        self.get_task(&record.id)?
            .ok_or_else(|| anyhow!("Task {} vanished after insert", record.id))
    }

    /// Get a task by ID
    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let mut conn = self.connection()?;
        let row = tasks_dsl::tasks
            .filter(tasks_dsl::id.eq(task_id))
            .first::<TaskRow>(&mut conn)
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRecord::try_from).transpose()
    }

    /// Find a live (pending or converting) task reading from the given artifact
    pub fn find_live_task_by_artifact(&self, artifact_path: &str) -> Result<Option<TaskRecord>> {
        let mut conn = self.connection()?;
        let row = tasks_dsl::tasks
            .filter(tasks_dsl::artifact_path.eq(artifact_path))
            .filter(tasks_dsl::status.eq_any(live_statuses()))
            .first::<TaskRow>(&mut conn)
            .optional()
            .context("Failed to query task by artifact")?;
        row.map(TaskRecord::try_from).transpose()
    }

    /// Resolve a task by the client-chosen upload token
    pub fn find_task_by_client_token(&self, token: &str) -> Result<Option<TaskRecord>> {
        let mut conn = self.connection()?;
        let row = tasks_dsl::tasks
            .filter(tasks_dsl::client_token.eq(token))
            .order(tasks_dsl::created_at.desc())
            .first::<TaskRow>(&mut conn)
            .optional()
            .context("Failed to query task by client token")?;
        row.map(TaskRecord::try_from).transpose()
    }

    /// Resolve the most recent task for an original file name
    pub fn find_task_by_file_name(&self, file_name: &str) -> Result<Option<TaskRecord>> {
        let mut conn = self.connection()?;
        let row = tasks_dsl::tasks
            .filter(tasks_dsl::original_file_name.eq(file_name))
            .order(tasks_dsl::created_at.desc())
            .first::<TaskRow>(&mut conn)
            .optional()
            .context("Failed to query task by file name")?;
        row.map(TaskRecord::try_from).transpose()
    }

    /// Resolve the most recent task for a sender-side source path
    pub fn find_task_by_source_path(&self, source_path: &str) -> Result<Option<TaskRecord>> {
        let mut conn = self.connection()?;
        let row = tasks_dsl::tasks
            .filter(tasks_dsl::source_path.eq(source_path))
            .order(tasks_dsl::created_at.desc())
            .first::<TaskRow>(&mut conn)
            .optional()
            .context("Failed to query task by source path")?;
        row.map(TaskRecord::try_from).transpose()
    }

    /// Apply a partial update to a task row
    pub fn update_task(&self, task_id: &str, update: TaskUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection()?;
        let changeset = TaskChangeset::from(update);
        diesel::update(tasks_dsl::tasks.filter(tasks_dsl::id.eq(task_id)))
            .set(changeset)
            .execute(&mut conn)
            .context("Failed to update task record")?;
        Ok(())
    }

    /// The oldest Pending task, if any (scheduler pickup order)
    pub fn next_pending_task(&self) -> Result<Option<TaskRecord>> {
        let mut conn = self.connection()?;
        let row = tasks_dsl::tasks
            .filter(tasks_dsl::status.eq(TaskStatus::Pending.as_str()))
            .order(tasks_dsl::created_at.asc())
            .first::<TaskRow>(&mut conn)
            .optional()
            .context("Failed to query next pending task")?;
        row.map(TaskRecord::try_from).transpose()
    }

    /// All tasks in the given status
    pub fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        let mut conn = self.connection()?;
        let rows = tasks_dsl::tasks
            .filter(tasks_dsl::status.eq(status.as_str()))
            .order(tasks_dsl::created_at.asc())
            .load::<TaskRow>(&mut conn)
            .context("Failed to query tasks by status")?;
        rows.into_iter().map(TaskRecord::try_from).collect()
    }

    /// Every task row. Used by the cleanup engine's orphan scan.
    pub fn list_all_tasks(&self) -> Result<Vec<TaskRecord>> {
        let mut conn = self.connection()?;
        let rows = tasks_dsl::tasks
            .order(tasks_dsl::created_at.asc())
            .load::<TaskRow>(&mut conn)
            .context("Failed to query all tasks")?;
        rows.into_iter().map(TaskRecord::try_from).collect()
    }

    /// Paged listing with optional status and name-substring filters.
    /// Returns the page plus the total matching count.
    pub fn list_tasks(&self, filter: &TaskListFilter) -> Result<(Vec<TaskRecord>, i64)> {
        let mut conn = self.connection()?;

        let page = filter.page.max(1);
        let page_size = filter.page_size.clamp(1, 200);

        let build = || {
            let mut query = tasks_dsl::tasks.into_boxed();
            if let Some(status) = filter.status {
                query = query.filter(tasks_dsl::status.eq(status.as_str()));
            }
            if let Some(search) = filter.search.as_ref().filter(|s| !s.is_empty()) {
                let pattern = format!("%{}%", search.to_lowercase());
                query = query.filter(
                    tasks_dsl::task_name
                        .like(pattern.clone())
                        .or(tasks_dsl::original_file_name.like(pattern)),
                );
            }
            query
        };

        let total: i64 = build()
            .count()
            .get_result(&mut conn)
            .context("Failed to count task records")?;

        let rows = build()
            .order(tasks_dsl::created_at.desc())
            .limit(page_size)
            .offset((page - 1) * page_size)
            .load::<TaskRow>(&mut conn)
            .context("Failed to query task page")?;

        let records = rows
            .into_iter()
            .map(TaskRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((records, total))
    }

    /// Delete a task row
    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::delete(tasks_dsl::tasks.filter(tasks_dsl::id.eq(task_id)))
            .execute(&mut conn)
            .context("Failed to delete task record")?;
        Ok(())
    }

    /// Reset tasks stuck in Converting back to Pending.
    /// Run at startup: a Converting row with no live encoder is a leftover
    /// from an unclean shutdown.
    pub fn reset_converting_tasks(&self) -> Result<usize> {
        let mut conn = self.connection()?;
        let reset = diesel::update(
            tasks_dsl::tasks.filter(tasks_dsl::status.eq(TaskStatus::Converting.as_str())),
        )
        .set((
            tasks_dsl::status.eq(TaskStatus::Pending.as_str()),
            tasks_dsl::progress.eq(0),
            tasks_dsl::updated_at.eq(Utc::now().timestamp()),
        ))
        .execute(&mut conn)
        .context("Failed to reset converting tasks")?;
        Ok(reset)
    }
}

fn live_statuses() -> Vec<String> {
    vec![
        TaskStatus::Pending.as_str().to_string(),
        TaskStatus::Converting.as_str().to_string(),
    ]
}

// =========================================================================
// Row Types
// =========================================================================

#[derive(Queryable)]
struct TaskRow {
    id: String,
    task_name: String,
    original_file_name: String,
    original_file_size: i64,
    original_format: Option<String>,
    artifact_path: String,
    output_file_name: Option<String>,
    output_file_size: Option<i64>,
    output_format: String,
    output_path: Option<String>,
    params: String,
    client_token: Option<String>,
    source_path: Option<String>,
    status: String,
    progress: i32,
    speed: Option<f64>,
    eta_seconds: Option<i64>,
    duration_seconds: Option<f64>,
    current_time_seconds: Option<f64>,
    error: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    updated_at: i64,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = anyhow::Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        let status = TaskStatus::from_str(&row.status)
            .ok_or_else(|| anyhow!("Unknown task status value {}", row.status))?;
        let params =
            serde_json::from_str(&row.params).context("Failed to deserialize task params")?;

        Ok(TaskRecord {
            id: row.id,
            task_name: row.task_name,
            original_file_name: row.original_file_name,
            original_file_size: row.original_file_size,
            original_format: row.original_format,
            artifact_path: row.artifact_path,
            output_file_name: row.output_file_name,
            output_file_size: row.output_file_size,
            output_format: row.output_format,
            output_path: row.output_path,
            params,
            client_token: row.client_token,
            source_path: row.source_path,
            status,
            progress: row.progress,
            speed: row.speed,
            eta_seconds: row.eta_seconds,
            duration_seconds: row.duration_seconds,
            current_time_seconds: row.current_time_seconds,
            error: row.error,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = tasks)]
struct NewTaskRow {
    id: String,
    task_name: String,
    original_file_name: String,
    original_file_size: i64,
    original_format: Option<String>,
    artifact_path: String,
    output_format: String,
    params: String,
    client_token: Option<String>,
    source_path: Option<String>,
    status: String,
    progress: i32,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<&NewTaskRecord> for NewTaskRow {
    type Error = anyhow::Error;

    fn try_from(record: &NewTaskRecord) -> Result<Self> {
        Ok(Self {
            id: record.id.clone(),
            task_name: record.task_name.clone(),
            original_file_name: record.original_file_name.clone(),
            original_file_size: record.original_file_size,
            original_format: record.original_format.clone(),
            artifact_path: record.artifact_path.clone(),
            output_format: record.output_format.clone(),
            params: serde_json::to_string(&record.params)
                .context("Failed to serialize task params")?,
            client_token: record.client_token.clone(),
            source_path: record.source_path.clone(),
            status: TaskStatus::Pending.as_str().to_string(),
            progress: 0,
            created_at: record.created_at,
            updated_at: record.created_at,
        })
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = tasks)]
struct TaskChangeset {
    status: Option<String>,
    progress: Option<i32>,
    speed: Option<Option<f64>>,
    eta_seconds: Option<Option<i64>>,
    duration_seconds: Option<Option<f64>>,
    current_time_seconds: Option<Option<f64>>,
    output_file_name: Option<Option<String>>,
    output_file_size: Option<Option<i64>>,
    output_path: Option<Option<String>>,
    error: Option<Option<String>>,
    started_at: Option<Option<i64>>,
    completed_at: Option<Option<i64>>,
    updated_at: i64,
}

impl From<TaskUpdate> for TaskChangeset {
    fn from(update: TaskUpdate) -> Self {
        Self {
            status: update.status.map(|status| status.as_str().to_string()),
            progress: update.progress,
            speed: update.speed,
            eta_seconds: update.eta_seconds,
            duration_seconds: update.duration_seconds,
            current_time_seconds: update.current_time_seconds,
            output_file_name: update.output_file_name,
            output_file_size: update.output_file_size,
            output_path: update.output_path,
            error: update.error,
            started_at: update.started_at,
            completed_at: update.completed_at,
            updated_at: Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidforge_api::models::ConversionParams;

    fn sample_task(id: &str, name: &str) -> NewTaskRecord {
        NewTaskRecord::new(
            id,
            format!("{name} -> mp4"),
            name,
            1024,
            format!("/data/uploads/{id}_{name}"),
            ConversionParams::new("mp4"),
        )
        .with_client_token(format!("upload-{id}"))
    }

    #[test]
    fn insert_and_get_round_trip() {
        let db = Database::in_memory().unwrap();
        let record = db.insert_task(&sample_task("t1", "movie.mkv")).unwrap();

        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.original_format.as_deref(), Some("mkv"));
        assert_eq!(record.output_format, "mp4");

        let fetched = db.get_task("t1").unwrap().unwrap();
        assert_eq!(fetched.task_name, "movie.mkv -> mp4");
        assert!(db.get_task("nope").unwrap().is_none());
    }

    #[test]
    fn update_transitions_and_null_handling() {
        let db = Database::in_memory().unwrap();
        db.insert_task(&sample_task("t1", "movie.mkv")).unwrap();

        db.update_task(
            "t1",
            TaskUpdate {
                status: Some(TaskStatus::Converting),
                progress: Some(42),
                speed: Some(Some(1.5)),
                started_at: Some(Some(1000)),
                ..Default::default()
            },
        )
        .unwrap();

        let record = db.get_task("t1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Converting);
        assert_eq!(record.progress, 42);
        assert_eq!(record.speed, Some(1.5));

        // Explicit NULL clears the field
        db.update_task(
            "t1",
            TaskUpdate {
                speed: Some(None),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(db.get_task("t1").unwrap().unwrap().speed, None);
    }

    #[test]
    fn paged_listing_filters_by_status_and_search() {
        let db = Database::in_memory().unwrap();
        db.insert_task(&sample_task("t1", "holiday.mkv")).unwrap();
        db.insert_task(&sample_task("t2", "work.avi")).unwrap();
        db.update_task(
            "t2",
            TaskUpdate {
                status: Some(TaskStatus::Converting),
                ..Default::default()
            },
        )
        .unwrap();

        let (page, total) = db
            .list_tasks(&TaskListFilter {
                status: Some(TaskStatus::Pending),
                page: 1,
                page_size: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(page[0].id, "t1");

        let (page, total) = db
            .list_tasks(&TaskListFilter {
                search: Some("holiday".to_string()),
                page: 1,
                page_size: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(page[0].id, "t1");
    }

    #[test]
    fn identifier_resolution_lookups() {
        let db = Database::in_memory().unwrap();
        db.insert_task(
            &sample_task("t1", "movie.mkv").with_source_path("/home/user/movie.mkv"),
        )
        .unwrap();

        assert_eq!(
            db.find_task_by_client_token("upload-t1").unwrap().unwrap().id,
            "t1"
        );
        assert_eq!(
            db.find_task_by_file_name("movie.mkv").unwrap().unwrap().id,
            "t1"
        );
        assert_eq!(
            db.find_task_by_source_path("/home/user/movie.mkv")
                .unwrap()
                .unwrap()
                .id,
            "t1"
        );
    }

    #[test]
    fn reset_converting_returns_to_pending() {
        let db = Database::in_memory().unwrap();
        db.insert_task(&sample_task("t1", "a.mkv")).unwrap();
        db.update_task(
            "t1",
            TaskUpdate {
                status: Some(TaskStatus::Converting),
                progress: Some(50),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(db.reset_converting_tasks().unwrap(), 1);
        let record = db.get_task("t1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.progress, 0);
    }
}
