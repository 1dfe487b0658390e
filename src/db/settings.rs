use super::Database;
use super::schema::settings::{self, dsl as settings_dsl};
use anyhow::{Context, Result};
use chrono::Utc;
use diesel::prelude::*;
use serde::Serialize;
use serde::de::DeserializeOwned;

impl Database {
    /// Read a raw setting value
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection()?;
        let value = settings_dsl::settings
            .filter(settings_dsl::key.eq(key))
            .select(settings_dsl::value)
            .first::<String>(&mut conn)
            .optional()
            .context("Failed to query setting")?;
        Ok(value)
    }

    /// Upsert a raw setting value
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let row = SettingRow {
            key: key.to_string(),
            value: value.to_string(),
            updated_at: Utc::now().timestamp(),
        };
        diesel::insert_into(settings::table)
            .values(&row)
            .on_conflict(settings::key)
            .do_update()
            .set((
                settings_dsl::value.eq(&row.value),
                settings_dsl::updated_at.eq(row.updated_at),
            ))
            .execute(&mut conn)
            .context("Failed to upsert setting")?;
        Ok(())
    }

    /// Read a JSON-encoded setting
    pub fn get_setting_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_setting(key)? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to decode setting {key}"))?,
            )),
            None => Ok(None),
        }
    }

    /// Write a JSON-encoded setting
    pub fn set_setting_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw =
            serde_json::to_string(value).with_context(|| format!("Failed to encode setting {key}"))?;
        self.set_setting(key, &raw)
    }
}

#[derive(Insertable)]
#[diesel(table_name = settings)]
struct SettingRow {
    key: String,
    value: String,
    updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_overwrite() {
        let db = Database::in_memory().unwrap();
        assert!(db.get_setting("missing").unwrap().is_none());

        db.set_setting("max_uploads", "4").unwrap();
        assert_eq!(db.get_setting("max_uploads").unwrap().as_deref(), Some("4"));

        db.set_setting("max_uploads", "8").unwrap();
        assert_eq!(db.get_setting("max_uploads").unwrap().as_deref(), Some("8"));
    }

    #[test]
    fn json_round_trip() {
        let db = Database::in_memory().unwrap();
        db.set_setting_json("limits", &vec![1, 2, 3]).unwrap();
        let limits: Vec<i32> = db.get_setting_json("limits").unwrap().unwrap();
        assert_eq!(limits, vec![1, 2, 3]);
    }
}
