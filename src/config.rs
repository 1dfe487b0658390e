use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Server configuration, loaded from JSON with defaults for missing fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    pub bind_addr: String,
    /// Root directory for all persistent data (temp, uploads, outputs, db)
    pub data_dir: PathBuf,
    /// Chunk size handed to clients at session init
    pub chunk_size: u64,
    /// Maximum accepted body for a single chunk request
    pub max_chunk_body: u64,
    /// Per-file size cap
    pub max_file_size: u64,
    /// Files at or above this size use the quick fingerprint
    pub quick_fingerprint_threshold: u64,
    /// Verify the merged artifact's fingerprint after merge (size is always checked)
    pub verify_final_fingerprint: bool,
    /// Idle upload sessions are evicted after this many hours
    pub session_ttl_hours: u64,
    /// How often the session TTL sweeper runs, in minutes
    pub session_sweep_interval_minutes: u64,
    /// Maximum simultaneous encoder invocations
    pub max_concurrent_conversions: usize,
    /// Encoder binary invoked for conversions
    pub encoder_binary: String,
    /// Grace period between polite and forced encoder termination, in seconds
    pub encoder_kill_grace_seconds: u64,
    /// Hours between a completed download and scheduled output removal
    pub retention_hours: u64,
    /// Temp files older than this many hours are swept
    pub temp_max_age_hours: u64,
    /// Log files older than this many days are swept
    pub log_max_age_days: u64,
    /// How often the retention sweeper runs, in minutes
    pub cleanup_interval_minutes: u64,
    /// Usage percent that triggers an aggressive sweep
    pub aggressive_cleanup_percent: f64,
    /// Usage percent that triggers an emergency sweep ignoring retention
    pub emergency_cleanup_percent: f64,
    /// Disk budget defaults, applied when the settings store has no entry
    pub max_total_space_gb: f64,
    pub reserved_space_gb: f64,
    pub disk_budget_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vidforge");

        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            data_dir,
            chunk_size: 50 * MIB,
            max_chunk_body: 100 * MIB,
            max_file_size: 30 * GIB,
            quick_fingerprint_threshold: 500 * MIB,
            verify_final_fingerprint: false,
            session_ttl_hours: 24,
            session_sweep_interval_minutes: 30,
            max_concurrent_conversions: 2,
            encoder_binary: "ffmpeg".to_string(),
            encoder_kill_grace_seconds: 10,
            retention_hours: 24,
            temp_max_age_hours: 24,
            log_max_age_days: 7,
            cleanup_interval_minutes: 60,
            aggressive_cleanup_percent: 85.0,
            emergency_cleanup_percent: 95.0,
            max_total_space_gb: 100.0,
            reserved_space_gb: 5.0,
            disk_budget_enabled: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the given path, using defaults for missing
    /// fields. A missing file yields the defaults.
    pub fn load(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            tracing::info!(target: "config", path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: ServerConfig =
            serde_json::from_str(&content).context("Failed to parse config file")?;

        tracing::info!(target: "config", path = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Default config file location (~/.vidforge/config.json)
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get user home directory")?;
        Ok(home.join(".vidforge").join("config.json"))
    }

    /// Staging area for in-flight chunk uploads
    pub fn temp_dir(&self) -> PathBuf {
        self.data_dir.join("temp").join("chunked_uploads")
    }

    /// Directory holding merged upload artifacts
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    /// Directory holding converted outputs
    pub fn outputs_dir(&self) -> PathBuf {
        self.data_dir.join("outputs")
    }

    /// Directory holding rotated log files
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// SQLite database path
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("vidforge.db")
    }

    /// Create every directory the server writes into
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.temp_dir(),
            self.uploads_dir(),
            self.outputs_dir(),
            self.logs_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_hours * 3600)
    }

    pub fn encoder_kill_grace(&self) -> Duration {
        Duration::from_secs(self.encoder_kill_grace_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.chunk_size, 50 * MIB);
        assert_eq!(config.max_file_size, 30 * GIB);
        assert_eq!(config.quick_fingerprint_threshold, 500 * MIB);
        assert!(!config.verify_final_fingerprint);
    }

    #[test]
    fn test_load_with_missing_fields() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "{{}}").unwrap();

        let config = ServerConfig::load(&temp_file.path().to_path_buf()).unwrap();
        assert_eq!(config.session_ttl_hours, 24);
    }

    #[test]
    fn test_load_with_overrides() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"{{"bind_addr": "127.0.0.1:8080", "max_concurrent_conversions": 4}}"#
        )
        .unwrap();

        let config = ServerConfig::load(&temp_file.path().to_path_buf()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.max_concurrent_conversions, 4);
        assert_eq!(config.chunk_size, 50 * MIB);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let path = PathBuf::from("/nonexistent/path/config.json");
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
    }

    #[test]
    fn test_directory_layout() {
        let config = ServerConfig {
            data_dir: PathBuf::from("/srv/vidforge"),
            ..Default::default()
        };
        assert_eq!(
            config.temp_dir(),
            PathBuf::from("/srv/vidforge/temp/chunked_uploads")
        );
        assert_eq!(config.uploads_dir(), PathBuf::from("/srv/vidforge/uploads"));
    }
}
