//! Record search and storage statistics
//!
//! Queries walk the directory tree; port and session hints narrow the walk
//! before any file is opened.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;
use tokio::fs;

use super::{record_files, request_id_from_path, session_dirs, DebugStorage};
use crate::error::Result;
use crate::record::RequestRecord;

/// Filter for record queries
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub port: Option<u16>,

    pub session_id: Option<String>,

    pub request_id: Option<String>,

    /// Only failed (`Some(true)`) or only successful (`Some(false)`) records
    pub has_error: Option<bool>,

    pub provider: Option<String>,

    pub model: Option<String>,

    /// Record must contain at least one module record with this name
    pub module_name: Option<String>,

    /// Start time (Unix milliseconds, inclusive)
    pub since: Option<u64>,

    /// End time (Unix milliseconds, inclusive)
    pub until: Option<u64>,

    /// Maximum number of results
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn for_port(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::default()
        }
    }

    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &RequestRecord) -> bool {
        if self.port.is_some_and(|p| p != record.port) {
            return false;
        }
        if self.session_id.as_ref().is_some_and(|s| *s != record.session_id) {
            return false;
        }
        if self.request_id.as_ref().is_some_and(|r| *r != record.request_id) {
            return false;
        }
        if self.has_error.is_some_and(|e| e != record.is_error()) {
            return false;
        }
        if self.provider.as_ref().is_some_and(|p| *p != record.pipeline.provider) {
            return false;
        }
        if self.model.as_ref().is_some_and(|m| *m != record.pipeline.model) {
            return false;
        }
        if let Some(module) = &self.module_name {
            if !record.pipeline.modules.iter().any(|m| m.module_name == *module) {
                return false;
            }
        }
        if self.since.is_some_and(|since| record.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| record.timestamp > until) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortStatistics {
    pub sessions: usize,
    pub records: usize,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatistics {
    pub total_ports: usize,
    pub total_sessions: usize,
    pub total_records: usize,
    pub total_size_bytes: u64,
    /// Modification time of the least recently touched session (Unix ms)
    pub oldest_session: Option<u64>,
    /// Modification time of the most recently touched session (Unix ms)
    pub newest_session: Option<u64>,
    pub ports: BTreeMap<u16, PortStatistics>,
}

impl DebugStorage {
    /// Find records matching `query`, newest first
    pub async fn find_records(&self, query: &RecordQuery) -> Result<Vec<RequestRecord>> {
        let mut results = Vec::new();

        for path in self.candidate_files(query).await? {
            if let (Some(wanted), Some(found)) = (&query.request_id, request_id_from_path(&path)) {
                if *wanted != found {
                    continue;
                }
            }

            let record = match self.read_record_file(&path).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable record"
                    );
                    continue;
                }
            };

            if query.matches(&record) {
                results.push(record);
            }
        }

        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }

        Ok(results)
    }

    async fn candidate_files(&self, query: &RecordQuery) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        for (_, port_dir) in self.port_dirs(query.port).await? {
            for (session_id, session_dir) in session_dirs(&port_dir).await? {
                if query.session_id.as_ref().is_some_and(|s| *s != session_id) {
                    continue;
                }
                files.extend(record_files(&session_dir).await?);
            }
        }

        Ok(files)
    }

    async fn read_record_file(&self, path: &std::path::Path) -> Result<RequestRecord> {
        let bytes = fs::read(path).await?;
        self.serializer().deserialize_record(&bytes)
    }

    /// Aggregate sizes and counts over the whole store
    pub async fn storage_statistics(&self) -> Result<StorageStatistics> {
        let mut stats = StorageStatistics::default();

        for (port, port_dir) in self.port_dirs(None).await? {
            let mut port_stats = PortStatistics::default();

            for (_, session_dir) in session_dirs(&port_dir).await? {
                port_stats.sessions += 1;

                if let Ok(meta) = fs::metadata(session_dir.join(super::SESSION_FILE)).await {
                    port_stats.size_bytes += meta.len();
                }
                for file in record_files(&session_dir).await? {
                    if let Ok(meta) = fs::metadata(&file).await {
                        port_stats.records += 1;
                        port_stats.size_bytes += meta.len();
                    }
                }

                if let Ok(modified) = super::cleanup::session_modified_time(&session_dir).await {
                    let millis = modified
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or_default();
                    stats.oldest_session = Some(stats.oldest_session.map_or(millis, |o| o.min(millis)));
                    stats.newest_session = Some(stats.newest_session.map_or(millis, |n| n.max(millis)));
                }
            }

            stats.total_sessions += port_stats.sessions;
            stats.total_records += port_stats.records;
            stats.total_size_bytes += port_stats.size_bytes;
            stats.ports.insert(port, port_stats);
        }

        stats.total_ports = stats.ports.len();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::events::NotificationBus;
    use crate::record::fixtures::sample_record;
    use crate::record::RecordedError;
    use tempfile::TempDir;

    async fn populated_storage() -> (TempDir, DebugStorage) {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            base_dir: dir.path().to_path_buf(),
            ..StorageConfig::default()
        };
        let storage = DebugStorage::new(&config, NotificationBus::default()).await.unwrap();

        let mut ts = 1_700_000_000_000u64;
        for port in [8080u16, 8081, 8082] {
            for i in 0..8 {
                let mut record = sample_record(&format!("{}-{}", port, i), port, &format!("s{}", port));
                ts += 1000;
                record.timestamp = ts;
                if i % 2 == 0 {
                    record.response = None;
                    record.error = Some(RecordedError::new("boom"));
                }
                storage.save_record(&record).await.unwrap();
            }
        }

        (dir, storage)
    }

    #[tokio::test]
    async fn test_find_records_by_port_and_error() {
        let (_dir, storage) = populated_storage().await;

        let query = RecordQuery {
            port: Some(8080),
            has_error: Some(true),
            limit: Some(5),
            ..RecordQuery::default()
        };
        let records = storage.find_records(&query).await.unwrap();

        assert!(records.len() <= 5);
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.port == 8080 && r.is_error()));
        assert!(records.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_find_records_limit_across_ports() {
        let (_dir, storage) = populated_storage().await;

        let query = RecordQuery {
            limit: Some(3),
            ..RecordQuery::default()
        };
        let records = storage.find_records(&query).await.unwrap();

        assert_eq!(records.len(), 3);
        // Newest records were written last, to port 8082
        assert!(records.iter().all(|r| r.port == 8082));
    }

    #[tokio::test]
    async fn test_find_records_skips_unreadable_files() {
        let (_dir, storage) = populated_storage().await;
        let bad = storage.session_dir(8081, "s8081").join("requests").join("req_garbage.json");
        tokio::fs::write(&bad, b"not json").await.unwrap();

        let records = storage.find_records(&RecordQuery::for_port(8081)).await.unwrap();
        assert_eq!(records.len(), 8);
    }

    #[tokio::test]
    async fn test_find_records_by_module_and_request() {
        let (_dir, storage) = populated_storage().await;

        let query = RecordQuery {
            request_id: Some("8082-3".to_string()),
            module_name: Some("server".to_string()),
            ..RecordQuery::default()
        };
        let records = storage.find_records(&query).await.unwrap();
        assert_eq!(records.len(), 1);

        let query = RecordQuery {
            module_name: Some("protocol".to_string()),
            ..RecordQuery::default()
        };
        assert!(storage.find_records(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_storage_statistics() {
        let (_dir, storage) = populated_storage().await;

        let stats = storage.storage_statistics().await.unwrap();
        assert_eq!(stats.total_ports, 3);
        assert_eq!(stats.total_sessions, 3);
        assert_eq!(stats.total_records, 24);
        assert!(stats.total_size_bytes > 0);
        assert_eq!(stats.ports[&8080].records, 8);
        assert!(stats.oldest_session <= stats.newest_session);
    }

    #[test]
    fn test_query_time_range() {
        let mut record = sample_record("r", 1, "s");
        record.timestamp = 500;

        let query = RecordQuery {
            since: Some(100),
            until: Some(500),
            ..RecordQuery::default()
        };
        assert!(query.matches(&record));

        let query = RecordQuery {
            since: Some(501),
            ..RecordQuery::default()
        };
        assert!(!query.matches(&record));
    }
}
