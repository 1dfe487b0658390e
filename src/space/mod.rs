//! Disk-budget admission control.
//!
//! The budget is a quota model over the server's data directories: a
//! configured maximum, a reserved headroom, and live usage split into
//! uploaded originals, converted outputs, and temp staging. Ingest is gated
//! on a conservative estimate of what an upload will consume end to end, so
//! a doomed transfer is rejected before any network traffic.

use crate::db::Database;
use crate::push::PushBus;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use vidforge_api::models::{CheckSpaceRequest, CheckSpaceResponse, DiskSpaceConfig, DiskUsage};

const DISK_CONFIG_KEY: &str = "disk_budget_config";
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Which bucket of the usage breakdown a delta applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageCategory {
    Uploaded,
    Converted,
    Temp,
}

#[derive(Debug, Clone, Copy, Default)]
struct UsageBreakdown {
    uploaded: u64,
    converted: u64,
    temp: u64,
}

impl UsageBreakdown {
    fn total(&self) -> u64 {
        self.uploaded + self.converted + self.temp
    }
}

/// Authoritative pre-ingest space check and live usage tracker
pub struct DiskBudget {
    db: Arc<Database>,
    push: PushBus,
    uploads_dir: PathBuf,
    outputs_dir: PathBuf,
    temp_dir: PathBuf,
    config: RwLock<DiskSpaceConfig>,
    usage: RwLock<UsageBreakdown>,
}

impl DiskBudget {
    /// Create the budget, loading persisted quota config or falling back to
    /// the supplied defaults.
    pub fn new(
        db: Arc<Database>,
        push: PushBus,
        uploads_dir: PathBuf,
        outputs_dir: PathBuf,
        temp_dir: PathBuf,
        defaults: DiskSpaceConfig,
    ) -> Result<Self> {
        let config = db
            .get_setting_json::<DiskSpaceConfig>(DISK_CONFIG_KEY)
            .context("Failed to load disk budget config")?
            .unwrap_or(defaults);

        Ok(Self {
            db,
            push,
            uploads_dir,
            outputs_dir,
            temp_dir,
            config: RwLock::new(config),
            usage: RwLock::new(UsageBreakdown::default()),
        })
    }

    /// Current quota configuration
    pub async fn config(&self) -> DiskSpaceConfig {
        self.config.read().await.clone()
    }

    /// Replace the quota configuration, persist it, and broadcast the new
    /// snapshot
    pub async fn set_config(&self, new_config: DiskSpaceConfig) -> Result<DiskSpaceConfig> {
        self.db
            .set_setting_json(DISK_CONFIG_KEY, &new_config)
            .context("Failed to persist disk budget config")?;

        *self.config.write().await = new_config.clone();
        info!(
            target: "space",
            max_gb = new_config.max_total_space_gb,
            reserved_gb = new_config.reserved_space_gb,
            enabled = new_config.is_enabled,
            "Disk budget configuration updated"
        );

        self.broadcast_status().await;
        Ok(new_config)
    }

    /// Recompute usage from the filesystem. Run at startup and whenever
    /// counter drift is suspected (e.g. after an external sweep).
    pub async fn refresh(&self) -> Result<DiskUsage> {
        let uploaded = dir_size(&self.uploads_dir).await?;
        let converted = dir_size(&self.outputs_dir).await?;
        let temp = dir_size(&self.temp_dir).await?;

        {
            let mut usage = self.usage.write().await;
            usage.uploaded = uploaded;
            usage.converted = converted;
            usage.temp = temp;
        }

        debug!(
            target: "space",
            uploaded,
            converted,
            temp,
            "Disk usage refreshed from filesystem"
        );

        let status = self.status().await;
        self.push.disk_space_update(status.clone());
        Ok(status)
    }

    /// Apply a usage delta to one category and broadcast the new snapshot
    pub async fn update_usage(&self, delta: i64, category: UsageCategory) {
        {
            let mut usage = self.usage.write().await;
            let bucket = match category {
                UsageCategory::Uploaded => &mut usage.uploaded,
                UsageCategory::Converted => &mut usage.converted,
                UsageCategory::Temp => &mut usage.temp,
            };
            *bucket = if delta >= 0 {
                bucket.saturating_add(delta as u64)
            } else {
                bucket.saturating_sub(delta.unsigned_abs())
            };
        }
        self.broadcast_status().await;
    }

    /// Live snapshot: totals, breakdown, and availability.
    /// Reported availability is clamped at zero.
    pub async fn status(&self) -> DiskUsage {
        let config = self.config.read().await.clone();
        let usage = *self.usage.read().await;

        let total = (config.max_total_space_gb * GIB) as u64;
        let reserved = (config.reserved_space_gb * GIB) as u64;
        let used = usage.total();
        let available = total.saturating_sub(used).saturating_sub(reserved);
        let usage_percent = if total > 0 {
            (used as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        DiskUsage {
            total_space: total,
            used_space: used,
            available_space: available,
            reserved_space: reserved,
            usage_percent,
            has_sufficient_space: available > 0,
            uploaded_bytes: usage.uploaded,
            converted_bytes: usage.converted,
            temp_bytes: usage.temp,
        }
    }

    async fn broadcast_status(&self) {
        let status = self.status().await;
        self.push.disk_space_update(status);
    }

    /// Estimate the output size for a conversion.
    ///
    /// Codec compression ratio x container overhead x resolution scale,
    /// clamped to [0.2, 1.5] of the original. Intentionally conservative.
    pub fn estimate_output(
        original_size: u64,
        format: Option<&str>,
        codec: Option<&str>,
        resolution: Option<&str>,
    ) -> u64 {
        let codec_ratio = match codec.map(|c| c.to_lowercase()).as_deref() {
            Some("h264") | Some("avc") | Some("libx264") => 0.7,
            Some("h265") | Some("hevc") | Some("libx265") => 0.5,
            Some("av1") | Some("libaom-av1") | Some("libsvtav1") => 0.4,
            Some("vp9") | Some("libvpx-vp9") => 0.6,
            _ => 0.8,
        };

        let container_ratio = match format.map(|f| f.to_lowercase()).as_deref() {
            Some("avi") => 1.1,
            Some("mov") => 1.05,
            _ => 1.0,
        };

        let resolution_ratio = match resolution.map(|r| r.to_lowercase()).as_deref() {
            Some("480p") => 0.5,
            Some("720p") => 0.75,
            Some("1080p") => 1.0,
            Some("1440p") | Some("2k") => 1.25,
            Some("2160p") | Some("4k") => 1.5,
            _ => 1.0,
        };

        let estimate = original_size as f64 * codec_ratio * container_ratio * resolution_ratio;
        let min = original_size as f64 * 0.2;
        let max = original_size as f64 * 1.5;
        estimate.clamp(min, max) as u64
    }

    /// Admission check: does the budget cover an upload of this size plus
    /// its estimated output (plus temp headroom when requested)?
    pub async fn check_space(&self, request: &CheckSpaceRequest) -> CheckSpaceResponse {
        let config = self.config.read().await.clone();

        let estimated_output = request
            .estimated_output_size
            .unwrap_or_else(|| Self::estimate_output(request.original_file_size, None, None, None));

        let temp_overhead = if request.include_temp_space {
            request.original_file_size.max(estimated_output) / 2
        } else {
            0
        };

        let required = request.original_file_size + estimated_output + temp_overhead;

        if !config.is_enabled {
            return CheckSpaceResponse {
                has_enough_space: true,
                required_space: required,
                available_space: u64::MAX,
                details: "Disk budget disabled".to_string(),
            };
        }

        let status = self.status().await;
        let has_enough = required <= status.available_space;

        if !has_enough {
            warn!(
                target: "space",
                required,
                available = status.available_space,
                "Admission check rejected upload"
            );
        }

        CheckSpaceResponse {
            has_enough_space: has_enough,
            required_space: required,
            available_space: status.available_space,
            details: format!(
                "required {} bytes, available {} bytes (reserved {} bytes)",
                required, status.available_space, status.reserved_space
            ),
        }
    }

    /// Admission check for a concrete conversion request
    pub async fn check_ingest(
        &self,
        original_size: u64,
        params: &vidforge_api::models::ConversionParams,
    ) -> CheckSpaceResponse {
        let estimate = Self::estimate_output(
            original_size,
            Some(params.output_format.as_str()),
            params.video_codec.as_deref(),
            params.resolution.as_deref(),
        );
        self.check_space(&CheckSpaceRequest {
            original_file_size: original_size,
            estimated_output_size: Some(estimate),
            include_temp_space: true,
        })
        .await
    }
}

/// Total size of all regular files under a directory
async fn dir_size(root: &PathBuf) -> Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![root.clone()];

    while let Some(dir) = stack.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to scan {}", dir.display()));
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if metadata.is_dir() {
                stack.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn budget_with(config: DiskSpaceConfig) -> (DiskBudget, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        let budget = DiskBudget::new(
            db,
            PushBus::new(16),
            dir.path().join("uploads"),
            dir.path().join("outputs"),
            dir.path().join("temp"),
            config,
        )
        .unwrap();
        (budget, dir)
    }

    #[test]
    fn estimate_applies_codec_table_and_clamp() {
        let original = 1_000_000u64;

        assert_eq!(
            DiskBudget::estimate_output(original, None, Some("hevc"), None),
            500_000
        );
        assert_eq!(
            DiskBudget::estimate_output(original, None, Some("av1"), None),
            400_000
        );
        assert_eq!(
            DiskBudget::estimate_output(original, None, None, None),
            800_000
        );

        // 0.4 * 0.5 = 0.2 of original sits exactly on the lower clamp;
        // anything smaller is clamped up
        assert_eq!(
            DiskBudget::estimate_output(original, None, Some("av1"), Some("480p")),
            200_000
        );

        // 0.8 * 1.1 * 1.5 = 1.32, under the 1.5 cap
        assert_eq!(
            DiskBudget::estimate_output(original, Some("avi"), None, Some("4k")),
            1_320_000
        );
    }

    #[tokio::test]
    async fn admission_rejects_when_budget_exceeded() {
        let (budget, _dir) = budget_with(DiskSpaceConfig {
            max_total_space_gb: 10.0,
            reserved_space_gb: 5.0,
            is_enabled: true,
        })
        .await;

        // 20 GiB original against 5 GiB available: rejected with detail
        let response = budget
            .check_space(&CheckSpaceRequest {
                original_file_size: 20 << 30,
                estimated_output_size: Some(0),
                include_temp_space: false,
            })
            .await;
        assert!(!response.has_enough_space);
        assert!(response.required_space >= 20 << 30);
        assert_eq!(response.available_space, 5 << 30);
    }

    #[tokio::test]
    async fn file_filling_quota_needs_zero_reserve() {
        let (budget, _dir) = budget_with(DiskSpaceConfig {
            max_total_space_gb: 1.0,
            reserved_space_gb: 0.0,
            is_enabled: true,
        })
        .await;

        // Exactly max_total with no usage and no reserve: accepted
        let response = budget
            .check_space(&CheckSpaceRequest {
                original_file_size: 1 << 30,
                estimated_output_size: Some(0),
                include_temp_space: false,
            })
            .await;
        assert!(response.has_enough_space);

        let (budget, _dir) = budget_with(DiskSpaceConfig {
            max_total_space_gb: 1.0,
            reserved_space_gb: 0.1,
            is_enabled: true,
        })
        .await;
        let response = budget
            .check_space(&CheckSpaceRequest {
                original_file_size: 1 << 30,
                estimated_output_size: Some(0),
                include_temp_space: false,
            })
            .await;
        assert!(!response.has_enough_space);
    }

    #[tokio::test]
    async fn disabled_budget_admits_everything() {
        let (budget, _dir) = budget_with(DiskSpaceConfig {
            max_total_space_gb: 0.001,
            reserved_space_gb: 0.0,
            is_enabled: false,
        })
        .await;

        let response = budget
            .check_space(&CheckSpaceRequest {
                original_file_size: 100 << 30,
                estimated_output_size: None,
                include_temp_space: true,
            })
            .await;
        assert!(response.has_enough_space);
    }

    #[tokio::test]
    async fn usage_counters_feed_the_snapshot() {
        let (budget, _dir) = budget_with(DiskSpaceConfig {
            max_total_space_gb: 1.0,
            reserved_space_gb: 0.0,
            is_enabled: true,
        })
        .await;

        budget.update_usage(100, UsageCategory::Uploaded).await;
        budget.update_usage(50, UsageCategory::Converted).await;
        budget.update_usage(25, UsageCategory::Temp).await;

        let status = budget.status().await;
        assert_eq!(status.used_space, 175);
        assert_eq!(status.uploaded_bytes, 100);
        assert_eq!(status.converted_bytes, 50);
        assert_eq!(status.temp_bytes, 25);

        budget.update_usage(-100, UsageCategory::Uploaded).await;
        assert_eq!(budget.status().await.uploaded_bytes, 0);
    }

    #[tokio::test]
    async fn refresh_recomputes_from_filesystem() {
        let (budget, dir) = budget_with(DiskSpaceConfig::default()).await;

        tokio::fs::create_dir_all(dir.path().join("uploads")).await.unwrap();
        tokio::fs::write(dir.path().join("uploads/a.bin"), vec![0u8; 1000])
            .await
            .unwrap();

        let status = budget.refresh().await.unwrap();
        assert_eq!(status.uploaded_bytes, 1000);
        assert_eq!(status.converted_bytes, 0);
    }
}
