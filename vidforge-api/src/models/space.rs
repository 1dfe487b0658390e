use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request body for `POST /api/diskspace/check-space`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckSpaceRequest {
    pub original_file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_output_size: Option<u64>,
    #[serde(default)]
    pub include_temp_space: bool,
}

/// Response body for `POST /api/diskspace/check-space`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheckSpaceResponse {
    pub has_enough_space: bool,
    pub required_space: u64,
    pub available_space: u64,
    pub details: String,
}

/// Disk quota configuration (`GET/POST /api/diskspace/config`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpaceConfig {
    pub max_total_space_gb: f64,
    pub reserved_space_gb: f64,
    pub is_enabled: bool,
}

impl Default for DiskSpaceConfig {
    fn default() -> Self {
        Self {
            max_total_space_gb: 100.0,
            reserved_space_gb: 5.0,
            is_enabled: true,
        }
    }
}

/// Live usage snapshot (`GET /api/diskspace/usage`), also broadcast over the
/// push channel as `DiskSpaceUpdate`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub total_space: u64,
    pub used_space: u64,
    pub available_space: u64,
    pub reserved_space: u64,
    pub usage_percent: f64,
    pub has_sufficient_space: bool,
    /// Breakdown of `used_space`
    pub uploaded_bytes: u64,
    pub converted_bytes: u64,
    pub temp_bytes: u64,
}

/// Result of a cleanup sweep (`POST /api/cleanup/cleanup/{type}`)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResult {
    pub bytes_freed: u64,
    pub files_removed: usize,
    pub by_category: HashMap<String, u64>,
}

impl CleanupResult {
    /// Fold another sweep's result into this one
    pub fn merge(&mut self, other: CleanupResult) {
        self.bytes_freed += other.bytes_freed;
        self.files_removed += other.files_removed;
        for (category, bytes) in other.by_category {
            *self.by_category.entry(category).or_insert(0) += bytes;
        }
    }
}
