//! Single-slot persisted session record.
//!
//! The [`SessionStore`] owns one JSON file describing the call the client was
//! last in.  Starting a new call overwrites the slot, ending any call clears
//! it, and a record older than the staleness bound is discarded (and the file
//! removed) by [`SessionStore::load`] so a long-dead call is never resurrected
//! after an unrelated crash.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use cadenza_shared::constants::SESSION_STALENESS_SECS;
use cadenza_shared::types::{CallId, ChatId, MediaKind};

use crate::error::{Result, StoreError};

/// The call the client believes it is in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedSession {
    pub call_id: CallId,
    pub chat_id: ChatId,
    pub media_kind: MediaKind,
    pub is_group: bool,
    pub started_at: DateTime<Utc>,
}

impl PersistedSession {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.started_at > Duration::seconds(SESSION_STALENESS_SECS)
    }
}

/// Single-slot store for [`PersistedSession`].
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Open the default store in the platform data directory:
    /// - Linux:   `~/.local/share/cadenza/session.json`
    /// - macOS:   `~/Library/Application Support/com.cadenza.cadenza/session.json`
    /// - Windows: `{FOLDERID_RoamingAppData}\cadenza\cadenza\data\session.json`
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "cadenza", "cadenza").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        Ok(Self::open_at(&data_dir.join("session.json")))
    }

    /// Use an explicit file path. Useful for tests and custom layouts.
    pub fn open_at(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }

    /// Overwrite the slot with `record`.
    pub fn save(&self, record: &PersistedSession) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&self.path, json)?;

        tracing::debug!(
            call = %record.call_id.short(),
            group = record.is_group,
            "persisted session record"
        );
        Ok(())
    }

    /// Read the slot.  Returns `None` when empty; a stale record is cleared
    /// and reported as `None`.
    pub fn load(&self) -> Result<Option<PersistedSession>> {
        self.load_at(Utc::now())
    }

    /// `load` with an injected clock, for staleness tests.
    pub fn load_at(&self, now: DateTime<Utc>) -> Result<Option<PersistedSession>> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: PersistedSession = match serde_json::from_str(&json) {
            Ok(record) => record,
            Err(e) => {
                // A corrupt slot is as useless as a stale one.
                tracing::warn!(error = %e, "discarding unreadable session record");
                self.clear()?;
                return Ok(None);
            }
        };

        if record.is_stale(now) {
            tracing::info!(
                call = %record.call_id.short(),
                started_at = %record.started_at,
                "discarding stale session record"
            );
            self.clear()?;
            return Ok(None);
        }

        Ok(Some(record))
    }

    /// Empty the slot.  Idempotent.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
