//! Retention cleanup for debug sessions
//!
//! Deletes whole sessions whose last modification is older than the
//! retention window.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::{fs, time};

use super::{session_dirs, DebugStorage, REQUESTS_DIR, SESSION_FILE};
use crate::config::StorageConfig;
use crate::error::Result;
use crate::events::DebugNotification;
use crate::task::{shutdown_requested, BackgroundTask};

const SECS_PER_DAY: u64 = 86_400;

/// Cleanup configuration
#[derive(Debug, Clone, Copy)]
pub struct RetentionConfig {
    /// Sessions untouched for longer than this are deleted
    pub retention_days: u32,

    /// How often the cleanup runs
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            interval: Duration::from_secs(3600),
        }
    }
}

impl From<&StorageConfig> for RetentionConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            retention_days: config.retention_days,
            interval: Duration::from_secs(config.cleanup_interval_seconds.max(1)),
        }
    }
}

impl DebugStorage {
    /// Delete sessions not modified within the last `retention_days`
    pub async fn cleanup_expired_data(&self, retention_days: u32) -> Result<usize> {
        let age = Duration::from_secs(u64::from(retention_days) * SECS_PER_DAY);
        let cutoff = SystemTime::now()
            .checked_sub(age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        self.cleanup_sessions_modified_before(cutoff).await
    }

    /// Delete every session whose modification time precedes `cutoff`
    ///
    /// Failures on individual sessions are logged and skipped.
    pub(crate) async fn cleanup_sessions_modified_before(&self, cutoff: SystemTime) -> Result<usize> {
        let mut deleted = 0;

        for (port, port_dir) in self.port_dirs(None).await? {
            for (session_id, session_dir) in session_dirs(&port_dir).await? {
                let modified = match session_modified_time(&session_dir).await {
                    Ok(modified) => modified,
                    Err(e) => {
                        tracing::warn!(
                            port = port,
                            session_id = %session_id,
                            error = %e,
                            "Failed to stat session, skipping"
                        );
                        continue;
                    }
                };

                if modified >= cutoff {
                    continue;
                }

                match self.delete_session(port, &session_id).await {
                    Ok(true) => {
                        deleted += 1;
                        tracing::debug!(port = port, session_id = %session_id, "Expired session deleted");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(
                            port = port,
                            session_id = %session_id,
                            error = %e,
                            "Failed to delete expired session"
                        );
                        crate::metrics::record_storage_error("cleanup");
                        self.bus().publish(DebugNotification::StorageError {
                            operation: "cleanup".to_string(),
                            message: format!("session {}: {}", session_id, e),
                        });
                    }
                }
            }
        }

        self.bus().publish(DebugNotification::CleanupCompleted {
            sessions_deleted: deleted,
        });

        Ok(deleted)
    }
}

/// Latest modification time of the session directory, its metadata file
/// and its `requests/` directory
pub(crate) async fn session_modified_time(session_dir: &Path) -> std::io::Result<SystemTime> {
    let mut latest = fs::metadata(session_dir).await?.modified()?;

    for path in [session_dir.join(SESSION_FILE), session_dir.join(REQUESTS_DIR)] {
        if let Ok(modified) = fs::metadata(&path).await.and_then(|m| m.modified()) {
            latest = latest.max(modified);
        }
    }

    Ok(latest)
}

/// Spawn background cleanup task
///
/// Runs `cleanup_expired_data` every `config.interval` until the returned
/// handle is stopped. The first pass runs one interval after start.
pub fn spawn_cleanup_task(storage: Arc<DebugStorage>, config: RetentionConfig) -> BackgroundTask {
    BackgroundTask::spawn("retention-cleanup", move |mut shutdown| async move {
        let mut interval = time::interval_at(time::Instant::now() + config.interval, config.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    run_cleanup_now(&storage, config.retention_days).await;
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
    })
}

/// Run cleanup immediately, logging the outcome
pub async fn run_cleanup_now(storage: &DebugStorage, retention_days: u32) -> Option<usize> {
    match storage.cleanup_expired_data(retention_days).await {
        Ok(deleted) => {
            tracing::info!(
                sessions_deleted = deleted,
                retention_days = retention_days,
                "Cleanup completed"
            );
            Some(deleted)
        }
        Err(e) => {
            tracing::error!(error = %e, "Cleanup failed");
            crate::metrics::record_storage_error("cleanup");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NotificationBus;
    use crate::record::fixtures::sample_record;
    use crate::record::DebugSession;
    use serde_json::json;
    use tempfile::TempDir;

    async fn create_test_storage(dir: &TempDir) -> Arc<DebugStorage> {
        let config = StorageConfig {
            base_dir: dir.path().to_path_buf(),
            ..StorageConfig::default()
        };
        Arc::new(DebugStorage::new(&config, NotificationBus::default()).await.unwrap())
    }

    #[tokio::test]
    async fn test_cleanup_deletes_only_old_sessions() {
        let dir = TempDir::new().unwrap();
        let storage = create_test_storage(&dir).await;

        storage.save_session(&DebugSession::new("old", 8080, json!({}))).await.unwrap();
        storage.save_record(&sample_record("r1", 8080, "old")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let cutoff = SystemTime::now();
        tokio::time::sleep(Duration::from_millis(50)).await;

        storage.save_session(&DebugSession::new("new", 8080, json!({}))).await.unwrap();
        storage.save_record(&sample_record("r2", 8080, "new")).await.unwrap();

        let mut rx = storage.bus().subscribe();
        let deleted = storage.cleanup_sessions_modified_before(cutoff).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(storage.load_session(8080, "old").await.is_err());
        assert!(storage.load_session(8080, "new").await.is_ok());
        assert!(storage.load_record("r2").await.is_ok());
        assert_eq!(
            rx.recv().await.unwrap(),
            DebugNotification::CleanupCompleted { sessions_deleted: 1 }
        );
    }

    #[tokio::test]
    async fn test_cleanup_with_retention_keeps_recent_sessions() {
        let dir = TempDir::new().unwrap();
        let storage = create_test_storage(&dir).await;
        storage.save_session(&DebugSession::new("s1", 9000, json!({}))).await.unwrap();

        assert_eq!(run_cleanup_now(&storage, 7).await, Some(0));
        assert!(storage.load_session(9000, "s1").await.is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_task_stops() {
        let dir = TempDir::new().unwrap();
        let storage = create_test_storage(&dir).await;

        let task = spawn_cleanup_task(
            storage,
            RetentionConfig {
                retention_days: 1,
                interval: Duration::from_millis(10),
            },
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        task.stop().await;
    }

    #[test]
    fn test_retention_config_from_storage_config() {
        let config = RetentionConfig::from(&StorageConfig::default());
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.interval, Duration::from_secs(3600));
    }
}
