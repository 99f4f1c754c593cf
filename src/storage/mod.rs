//! Hierarchical file storage for debug sessions and request records
//!
//! ## Layout
//!
//! ```text
//! <base>/port-<N>/<sessionId>/session.json
//! <base>/port-<N>/<sessionId>/requests/req_<requestId>.json   (gzip when compressed)
//! <base>/port-<N>/current -> <sessionId>                      (best-effort pointer)
//! ```
//!
//! Each port owns an independent subtree. All I/O goes through `tokio::fs`;
//! files are written to a temporary name and renamed into place so readers
//! never observe a half-written record.

pub mod cleanup;
pub mod query;

pub use cleanup::{run_cleanup_now, spawn_cleanup_task, RetentionConfig};
pub use query::{PortStatistics, RecordQuery, StorageStatistics};

use std::path::{Path, PathBuf};
use tokio::fs;

use crate::config::StorageConfig;
use crate::error::{DebugError, Result};
use crate::events::NotificationBus;
use crate::record::{DebugSession, RequestRecord};
use crate::serializer::RecordSerializer;

const SESSION_FILE: &str = "session.json";
const REQUESTS_DIR: &str = "requests";
const CURRENT_POINTER: &str = "current";
const PORT_PREFIX: &str = "port-";
const RECORD_PREFIX: &str = "req_";
const RECORD_SUFFIX: &str = ".json";

pub struct DebugStorage {
    base_dir: PathBuf,
    serializer: RecordSerializer,
    max_record_size: usize,
    bus: NotificationBus,
}

impl DebugStorage {
    /// Open (creating if needed) a storage root
    pub async fn new(config: &StorageConfig, bus: NotificationBus) -> Result<Self> {
        fs::create_dir_all(&config.base_dir).await?;

        tracing::info!(
            base_dir = %config.base_dir.display(),
            compression = config.compression,
            validate_on_read = config.validate_on_read,
            "Debug storage opened"
        );

        Ok(Self {
            base_dir: config.base_dir.clone(),
            serializer: RecordSerializer::from_config(config),
            max_record_size: config.max_record_size_bytes,
            bus,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn serializer(&self) -> &RecordSerializer {
        &self.serializer
    }

    pub(crate) fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn port_dir(&self, port: u16) -> PathBuf {
        self.base_dir.join(format!("{}{}", PORT_PREFIX, port))
    }

    pub fn session_dir(&self, port: u16, session_id: &str) -> PathBuf {
        self.port_dir(port).join(session_id)
    }

    fn record_path(&self, port: u16, session_id: &str, request_id: &str) -> PathBuf {
        self.session_dir(port, session_id)
            .join(REQUESTS_DIR)
            .join(record_file_name(request_id))
    }

    // ============================================================
    // Sessions
    // ============================================================

    /// Persist session metadata and point `current` at it while active
    pub async fn save_session(&self, session: &DebugSession) -> Result<()> {
        validate_id("session id", &session.session_id)?;

        let dir = self.session_dir(session.port, &session.session_id);
        fs::create_dir_all(dir.join(REQUESTS_DIR)).await?;

        let bytes = serde_json::to_vec_pretty(session)?;
        write_atomic(&dir.join(SESSION_FILE), &bytes).await?;

        if session.is_active() {
            self.update_current_pointer(session.port, &session.session_id).await;
        }

        Ok(())
    }

    pub async fn load_session(&self, port: u16, session_id: &str) -> Result<DebugSession> {
        validate_id("session id", session_id)?;

        let path = self.session_dir(port, session_id).join(SESSION_FILE);
        let bytes = read_or_not_found(&path, || format!("session '{}' on port {}", session_id, port)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All readable sessions (optionally for one port), newest first
    pub async fn list_sessions(&self, port: Option<u16>) -> Result<Vec<DebugSession>> {
        let mut sessions = Vec::new();

        for (port, port_dir) in self.port_dirs(port).await? {
            for (session_id, _) in session_dirs(&port_dir).await? {
                match self.load_session(port, &session_id).await {
                    Ok(session) => sessions.push(session),
                    Err(e) => tracing::warn!(
                        port = port,
                        session_id = %session_id,
                        error = %e,
                        "Skipping unreadable session"
                    ),
                }
            }
        }

        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(sessions)
    }

    /// Session the `current` pointer refers to, if any
    ///
    /// Discovery only: the pointer is updated best-effort and may be stale.
    pub async fn current_session(&self, port: u16) -> Option<String> {
        let pointer = self.port_dir(port).join(CURRENT_POINTER);

        #[cfg(unix)]
        if let Ok(target) = fs::read_link(&pointer).await {
            return target.file_name().map(|n| n.to_string_lossy().into_owned());
        }

        fs::read_to_string(&pointer)
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    async fn update_current_pointer(&self, port: u16, session_id: &str) {
        let pointer = self.port_dir(port).join(CURRENT_POINTER);
        let _ = fs::remove_file(&pointer).await;

        #[cfg(unix)]
        let result = fs::symlink(session_id, &pointer).await;
        #[cfg(not(unix))]
        let result = fs::write(&pointer, session_id).await;

        if let Err(e) = result {
            tracing::debug!(
                port = port,
                session_id = session_id,
                error = %e,
                "Failed to update current session pointer"
            );
        }
    }

    // ============================================================
    // Records
    // ============================================================

    /// Persist a record; fails before writing anything if it is too large
    pub async fn save_record(&self, record: &RequestRecord) -> Result<PathBuf> {
        validate_id("session id", &record.session_id)?;
        validate_id("request id", &record.request_id)?;

        let bytes = self.serializer.serialize(record)?;
        if bytes.len() > self.max_record_size {
            return Err(DebugError::SizeLimitExceeded {
                size: bytes.len(),
                limit: self.max_record_size,
            });
        }

        let path = self.record_path(record.port, &record.session_id, &record.request_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, &bytes).await?;

        tracing::debug!(
            request_id = %record.request_id,
            session_id = %record.session_id,
            bytes = bytes.len(),
            "Record saved"
        );

        Ok(path)
    }

    /// Load a record when its port and session are known
    pub async fn load_record_in(
        &self,
        port: u16,
        session_id: &str,
        request_id: &str,
    ) -> Result<RequestRecord> {
        validate_id("session id", session_id)?;
        validate_id("request id", request_id)?;

        let path = self.record_path(port, session_id, request_id);
        let bytes = read_or_not_found(&path, || format!("record '{}'", request_id)).await?;
        self.serializer.deserialize_record(&bytes)
    }

    /// Locate and load a record by request id alone
    pub async fn load_record(&self, request_id: &str) -> Result<RequestRecord> {
        validate_id("request id", request_id)?;

        match self.locate_record(request_id).await? {
            Some((port, session_id)) => self.load_record_in(port, &session_id, request_id).await,
            None => Err(DebugError::NotFound(format!("record '{}'", request_id))),
        }
    }

    async fn locate_record(&self, request_id: &str) -> Result<Option<(u16, String)>> {
        let file_name = record_file_name(request_id);

        for (port, port_dir) in self.port_dirs(None).await? {
            for (session_id, session_dir) in session_dirs(&port_dir).await? {
                let candidate = session_dir.join(REQUESTS_DIR).join(&file_name);
                if fs::try_exists(&candidate).await.unwrap_or(false) {
                    return Ok(Some((port, session_id)));
                }
            }
        }

        Ok(None)
    }

    pub async fn delete_record(&self, port: u16, session_id: &str, request_id: &str) -> Result<bool> {
        validate_id("session id", session_id)?;
        validate_id("request id", request_id)?;

        match fs::remove_file(self.record_path(port, session_id, request_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_session(&self, port: u16, session_id: &str) -> Result<bool> {
        validate_id("session id", session_id)?;

        let removed = match fs::remove_dir_all(self.session_dir(port, session_id)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if removed && self.current_session(port).await.as_deref() == Some(session_id) {
            let _ = fs::remove_file(self.port_dir(port).join(CURRENT_POINTER)).await;
        }

        Ok(removed)
    }

    /// Delete every session of a port; returns how many were removed
    pub async fn delete_port(&self, port: u16) -> Result<usize> {
        let port_dir = self.port_dir(port);
        if !fs::try_exists(&port_dir).await.unwrap_or(false) {
            return Ok(0);
        }

        let count = session_dirs(&port_dir).await?.len();
        fs::remove_dir_all(&port_dir).await?;
        Ok(count)
    }

    // ============================================================
    // Directory walking
    // ============================================================

    /// Port directories, restricted to `only` when given
    pub(crate) async fn port_dirs(&self, only: Option<u16>) -> Result<Vec<(u16, PathBuf)>> {
        if let Some(port) = only {
            let dir = self.port_dir(port);
            return Ok(if fs::try_exists(&dir).await.unwrap_or(false) {
                vec![(port, dir)]
            } else {
                Vec::new()
            });
        }

        let mut ports = Vec::new();
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ports),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(port) = name.strip_prefix(PORT_PREFIX).and_then(|p| p.parse::<u16>().ok()) {
                ports.push((port, entry.path()));
            }
        }

        ports.sort_by_key(|(port, _)| *port);
        Ok(ports)
    }
}

/// Session directories under a port directory (the `current` pointer is skipped)
pub(crate) async fn session_dirs(port_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut sessions = Vec::new();
    let mut entries = match fs::read_dir(port_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            sessions.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }

    Ok(sessions)
}

/// Record files inside a session directory
pub(crate) async fn record_files(session_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = match fs::read_dir(session_dir.join(REQUESTS_DIR)).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(RECORD_PREFIX) && name.ends_with(RECORD_SUFFIX) {
            files.push(entry.path());
        }
    }

    Ok(files)
}

pub(crate) fn request_id_from_path(path: &Path) -> Option<String> {
    path.file_name()?
        .to_str()?
        .strip_prefix(RECORD_PREFIX)?
        .strip_suffix(RECORD_SUFFIX)
        .map(str::to_string)
}

fn record_file_name(request_id: &str) -> String {
    format!("{}{}{}", RECORD_PREFIX, request_id, RECORD_SUFFIX)
}

/// Reject ids that could escape their directory
fn validate_id(kind: &str, id: &str) -> Result<()> {
    let is_valid = !id.is_empty()
        && id.len() <= 256
        && id != "."
        && id != ".."
        && id != CURRENT_POINTER
        && !id.contains(['/', '\\', '\0']);

    if is_valid {
        Ok(())
    } else {
        Err(DebugError::Record(format!("invalid {} '{}'", kind, id)))
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn read_or_not_found(path: &Path, what: impl FnOnce() -> String) -> Result<Vec<u8>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(DebugError::NotFound(what())),
        Err(e) => Err(e.into()),
    }
}
