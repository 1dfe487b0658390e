use super::Database;
use super::models::RetentionRecord;
use super::schema::retention_records::{self, dsl as retention_dsl};
use anyhow::{Context, Result};
use chrono::Utc;
use diesel::prelude::*;

impl Database {
    /// Record a completed download, scheduling its output for cleanup
    pub fn insert_retention_record(&self, record: &RetentionRecord) -> Result<()> {
        let mut conn = self.connection()?;
        let row = RetentionRow::from(record);
        diesel::insert_into(retention_records::table)
            .values(&row)
            .execute(&mut conn)
            .context("Failed to insert retention record")?;
        Ok(())
    }

    /// Records whose cleanup time has passed and which are not yet cleaned
    pub fn due_retention_records(&self, now: i64) -> Result<Vec<RetentionRecord>> {
        let mut conn = self.connection()?;
        let rows = retention_dsl::retention_records
            .filter(retention_dsl::cleaned_up.eq(false))
            .filter(retention_dsl::cleanup_after.le(now))
            .order(retention_dsl::cleanup_after.asc())
            .load::<RetentionRow>(&mut conn)
            .context("Failed to query due retention records")?;
        Ok(rows.into_iter().map(RetentionRecord::from).collect())
    }

    /// All uncleaned records, regardless of schedule (emergency sweep scope)
    pub fn pending_retention_records(&self) -> Result<Vec<RetentionRecord>> {
        let mut conn = self.connection()?;
        let rows = retention_dsl::retention_records
            .filter(retention_dsl::cleaned_up.eq(false))
            .order(retention_dsl::cleanup_after.asc())
            .load::<RetentionRow>(&mut conn)
            .context("Failed to query pending retention records")?;
        Ok(rows.into_iter().map(RetentionRecord::from).collect())
    }

    /// Mark every uncleaned record for a task as cleaned
    pub fn mark_retention_cleaned(&self, task_id: &str) -> Result<usize> {
        let mut conn = self.connection()?;
        let updated = diesel::update(
            retention_dsl::retention_records
                .filter(retention_dsl::task_id.eq(task_id))
                .filter(retention_dsl::cleaned_up.eq(false)),
        )
        .set((
            retention_dsl::cleaned_up.eq(true),
            retention_dsl::cleaned_at.eq(Some(Utc::now().timestamp())),
        ))
        .execute(&mut conn)
        .context("Failed to mark retention records cleaned")?;
        Ok(updated)
    }

    /// Push back the scheduled cleanup for a task's uncleaned records
    pub fn extend_retention(&self, task_id: &str, hours: i64) -> Result<usize> {
        let mut conn = self.connection()?;
        let rows: Vec<RetentionRow> = retention_dsl::retention_records
            .filter(retention_dsl::task_id.eq(task_id))
            .filter(retention_dsl::cleaned_up.eq(false))
            .load(&mut conn)
            .context("Failed to load retention records for extension")?;

        let mut updated = 0;
        for row in rows {
            updated += diesel::update(
                retention_dsl::retention_records.filter(retention_dsl::id.eq(&row.id)),
            )
            .set(retention_dsl::cleanup_after.eq(row.cleanup_after + hours * 3600))
            .execute(&mut conn)
            .context("Failed to extend retention record")?;
        }
        Ok(updated)
    }

    /// Remove retention rows for a deleted task
    pub fn delete_retention_for_task(&self, task_id: &str) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::delete(retention_dsl::retention_records.filter(retention_dsl::task_id.eq(task_id)))
            .execute(&mut conn)
            .context("Failed to delete retention records")?;
        Ok(())
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = retention_records)]
struct RetentionRow {
    id: String,
    task_id: String,
    file_name: String,
    file_size: i64,
    downloaded_at: i64,
    cleanup_after: i64,
    cleaned_up: bool,
    cleaned_at: Option<i64>,
    client_id: Option<String>,
}

impl From<&RetentionRecord> for RetentionRow {
    fn from(record: &RetentionRecord) -> Self {
        Self {
            id: record.id.clone(),
            task_id: record.task_id.clone(),
            file_name: record.file_name.clone(),
            file_size: record.file_size,
            downloaded_at: record.downloaded_at,
            cleanup_after: record.cleanup_after,
            cleaned_up: record.cleaned_up,
            cleaned_at: record.cleaned_at,
            client_id: record.client_id.clone(),
        }
    }
}

impl From<RetentionRow> for RetentionRecord {
    fn from(row: RetentionRow) -> Self {
        Self {
            id: row.id,
            task_id: row.task_id,
            file_name: row.file_name,
            file_size: row.file_size,
            downloaded_at: row.downloaded_at,
            cleanup_after: row.cleanup_after,
            cleaned_up: row.cleaned_up,
            cleaned_at: row.cleaned_at,
            client_id: row.client_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_records_respect_schedule_and_flag() {
        let db = Database::in_memory().unwrap();

        let mut due = RetentionRecord::new("t1", "out.mp4", 100, 0, None);
        due.cleanup_after = 500;
        db.insert_retention_record(&due).unwrap();

        let mut later = RetentionRecord::new("t2", "out2.mp4", 100, 0, None);
        later.cleanup_after = 5_000_000_000;
        db.insert_retention_record(&later).unwrap();

        let records = db.due_retention_records(1_000).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task_id, "t1");

        db.mark_retention_cleaned("t1").unwrap();
        assert!(db.due_retention_records(1_000).unwrap().is_empty());

        // Emergency scope still sees the not-yet-due record
        assert_eq!(db.pending_retention_records().unwrap().len(), 1);
    }

    #[test]
    fn extend_pushes_back_cleanup_time() {
        let db = Database::in_memory().unwrap();
        let mut record = RetentionRecord::new("t1", "out.mp4", 100, 0, None);
        record.cleanup_after = 1_000;
        db.insert_retention_record(&record).unwrap();

        assert_eq!(db.extend_retention("t1", 2).unwrap(), 1);
        let records = db.pending_retention_records().unwrap();
        assert_eq!(records[0].cleanup_after, 1_000 + 2 * 3600);
    }
}
