//! Bounded-concurrency gate around uploads and downloads.
//!
//! Two pools with sizes drawn from the persisted settings store. Resizing is
//! live: a new semaphore takes over for subsequent acquisitions while
//! operations already holding permits drain against the pool they came from,
//! so nothing queued is ever lost.

use crate::db::Database;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info};

const MAX_UPLOADS_KEY: &str = "governor_max_uploads";
const MAX_DOWNLOADS_KEY: &str = "governor_max_downloads";

/// Which pool an operation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Upload,
    Download,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Upload => "upload",
            TransferKind::Download => "download",
        }
    }
}

/// Pool bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorLimits {
    pub max_uploads: usize,
    pub max_downloads: usize,
}

impl Default for GovernorLimits {
    fn default() -> Self {
        Self {
            max_uploads: 3,
            max_downloads: 3,
        }
    }
}

/// Global caps on simultaneous transfers
pub struct ConcurrencyGovernor {
    settings: Option<Arc<Database>>,
    limits: RwLock<GovernorLimits>,
    uploads: RwLock<Arc<Semaphore>>,
    downloads: RwLock<Arc<Semaphore>>,
}

impl ConcurrencyGovernor {
    /// Create a governor with fixed limits (no persistence)
    pub fn new(limits: GovernorLimits) -> Self {
        let limits = GovernorLimits {
            max_uploads: limits.max_uploads.max(1),
            max_downloads: limits.max_downloads.max(1),
        };
        Self {
            settings: None,
            uploads: RwLock::new(Arc::new(Semaphore::new(limits.max_uploads))),
            downloads: RwLock::new(Arc::new(Semaphore::new(limits.max_downloads))),
            limits: RwLock::new(limits),
        }
    }

    /// Create a governor reading (and persisting) limits through the
    /// settings store
    pub fn from_settings(settings: Arc<Database>, defaults: GovernorLimits) -> Result<Self> {
        let max_uploads = settings
            .get_setting(MAX_UPLOADS_KEY)?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(defaults.max_uploads);
        let max_downloads = settings
            .get_setting(MAX_DOWNLOADS_KEY)?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(defaults.max_downloads);

        let mut governor = Self::new(GovernorLimits {
            max_uploads,
            max_downloads,
        });
        governor.settings = Some(settings);
        Ok(governor)
    }

    pub async fn limits(&self) -> GovernorLimits {
        *self.limits.read().await
    }

    /// Run `op` under a slot of the given pool.
    ///
    /// The permit is released on every exit path: normal return, error, and
    /// future cancellation all drop the owned permit.
    pub async fn execute<T, F, Fut>(
        &self,
        task_id: &str,
        kind: TransferKind,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let pool = match kind {
            TransferKind::Upload => self.uploads.read().await.clone(),
            TransferKind::Download => self.downloads.read().await.clone(),
        };

        debug!(
            target: "governor",
            task_id = %task_id,
            kind = kind.as_str(),
            "Waiting for transfer slot"
        );
        let _permit = pool
            .acquire_owned()
            .await
            .context("Governor pool closed")?;

        debug!(
            target: "governor",
            task_id = %task_id,
            kind = kind.as_str(),
            "Transfer slot acquired"
        );
        op().await
    }

    /// Replace a pool's bound.
    ///
    /// New acquisitions go to a fresh semaphore immediately; in-flight
    /// operations drain against the pool they acquired from, and waiters on
    /// the old pool complete as those permits release.
    pub async fn resize(&self, kind: TransferKind, new_limit: usize) -> Result<()> {
        let new_limit = new_limit.max(1);

        {
            let mut limits = self.limits.write().await;
            let pool = match kind {
                TransferKind::Upload => {
                    limits.max_uploads = new_limit;
                    &self.uploads
                }
                TransferKind::Download => {
                    limits.max_downloads = new_limit;
                    &self.downloads
                }
            };
            *pool.write().await = Arc::new(Semaphore::new(new_limit));
        }

        if let Some(settings) = &self.settings {
            let key = match kind {
                TransferKind::Upload => MAX_UPLOADS_KEY,
                TransferKind::Download => MAX_DOWNLOADS_KEY,
            };
            settings
                .set_setting(key, &new_limit.to_string())
                .context("Failed to persist governor limit")?;
        }

        info!(
            target: "governor",
            kind = kind.as_str(),
            limit = new_limit,
            "Transfer pool resized"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn execute_returns_the_operation_result() {
        let governor = ConcurrencyGovernor::new(GovernorLimits::default());
        let value = governor
            .execute("t1", TransferKind::Upload, || async { Ok(41 + 1) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn pool_bounds_simultaneous_operations() {
        let governor = Arc::new(ConcurrencyGovernor::new(GovernorLimits {
            max_uploads: 2,
            max_downloads: 1,
        }));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for index in 0..6 {
            let governor = governor.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                governor
                    .execute(&format!("t{index}"), TransferKind::Upload, || async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn resize_applies_to_new_acquisitions() {
        let governor = Arc::new(ConcurrencyGovernor::new(GovernorLimits {
            max_uploads: 1,
            max_downloads: 1,
        }));

        governor.resize(TransferKind::Upload, 4).await.unwrap();
        assert_eq!(governor.limits().await.max_uploads, 4);

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for index in 0..4 {
            let governor = governor.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                governor
                    .execute(&format!("t{index}"), TransferKind::Upload, || async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn limits_persist_through_the_settings_store() {
        let settings = Arc::new(Database::in_memory().unwrap());
        let governor =
            ConcurrencyGovernor::from_settings(settings.clone(), GovernorLimits::default())
                .unwrap();

        governor.resize(TransferKind::Download, 7).await.unwrap();
        assert_eq!(
            settings.get_setting("governor_max_downloads").unwrap().as_deref(),
            Some("7")
        );

        // A fresh governor over the same store picks the limit up
        let reloaded =
            ConcurrencyGovernor::from_settings(settings, GovernorLimits::default()).unwrap();
        assert_eq!(reloaded.limits().await.max_downloads, 7);
    }

    #[tokio::test]
    async fn permit_releases_on_error_paths() {
        let governor = ConcurrencyGovernor::new(GovernorLimits {
            max_uploads: 1,
            max_downloads: 1,
        });

        let result: Result<()> = governor
            .execute("t1", TransferKind::Upload, || async {
                anyhow::bail!("boom")
            })
            .await;
        assert!(result.is_err());

        // The slot is free again
        governor
            .execute("t2", TransferKind::Upload, || async { Ok(()) })
            .await
            .unwrap();
    }
}
