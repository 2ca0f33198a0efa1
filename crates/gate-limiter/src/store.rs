//! JSON state file for the adaptive limiter.
//!
//! One document per user: `{version, globalMultiplier, limits, updatedAt}`.
//! There is no process-level lock. `version` only detects that somebody else
//! wrote in between; the last writer wins.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gate_core::GateError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Learned concurrency for one `provider:model`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnedLimit {
    pub concurrency: u32,
    pub original_concurrency: u32,
    pub consecutive_429_count: u32,
    pub total_429_count: u64,
    pub last_429_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub recovery_scheduled: bool,
    #[serde(default)]
    pub total_success_count: u64,
    /// Most recent 429 timestamps, oldest first, bounded.
    #[serde(default)]
    pub recent_429_at: Vec<DateTime<Utc>>,
}

impl LearnedLimit {
    pub fn new(preset: u32) -> Self {
        Self {
            concurrency: preset,
            original_concurrency: preset,
            consecutive_429_count: 0,
            total_429_count: 0,
            last_429_at: None,
            last_success_at: None,
            recovery_scheduled: false,
            total_success_count: 0,
            recent_429_at: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveState {
    pub version: u64,
    pub global_multiplier: f64,
    #[serde(default)]
    pub limits: BTreeMap<String, LearnedLimit>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for AdaptiveState {
    fn default() -> Self {
        Self {
            version: 0,
            global_multiplier: 1.0,
            limits: BTreeMap::new(),
            updated_at: None,
        }
    }
}

/// Outcome of [`StateStore::load`].
#[derive(Debug, Clone)]
pub struct LoadedState {
    pub state: AdaptiveState,
    /// Version found on disk (0 when the file was absent or unreadable).
    pub disk_version: u64,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document. Never fails: a missing file gives default state, a
    /// corrupt one is moved aside to `*.corrupt` and replaced by defaults.
    /// The returned in-memory version is one past the disk version.
    pub fn load(&self) -> LoadedState {
        let mut loaded = match self.read() {
            Ok(Some(state)) => LoadedState {
                disk_version: state.version,
                state,
            },
            Ok(None) => LoadedState {
                state: AdaptiveState::default(),
                disk_version: 0,
            },
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Resetting adaptive limiter state");
                self.quarantine();
                LoadedState {
                    state: AdaptiveState::default(),
                    disk_version: 0,
                }
            }
        };
        loaded.state.version = loaded.disk_version + 1;
        loaded
    }

    fn read(&self) -> std::result::Result<Option<AdaptiveState>, GateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(GateError::PersistenceCorruption {
                    path: self.path.clone(),
                    message: e.to_string(),
                });
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| GateError::PersistenceCorruption {
                path: self.path.clone(),
                message: e.to_string(),
            })
    }

    fn quarantine(&self) {
        if !self.path.exists() {
            return;
        }
        let backup = self.path.with_extension("json.corrupt");
        if let Err(err) = fs::rename(&self.path, &backup) {
            warn!(
                path = %self.path.display(),
                error = %err,
                "Failed to back up corrupt adaptive limiter state"
            );
        }
    }

    /// Version currently on disk, if the file parses.
    pub fn peek_version(&self) -> Option<u64> {
        self.read().ok().flatten().map(|state| state.version)
    }

    /// Write `state` with a bumped version.
    ///
    /// `last_seen` is the disk version this process last loaded or wrote. A
    /// newer disk version means another process wrote in between; that is
    /// logged and then overwritten. Returns the version written.
    pub fn save(&self, state: &mut AdaptiveState, last_seen: u64) -> Result<u64> {
        let disk_version = self.peek_version().unwrap_or(0);
        if disk_version > last_seen {
            warn!(
                path = %self.path.display(),
                disk_version,
                last_seen,
                "Adaptive limiter state modified by another process; last write wins"
            );
        }
        state.version = state.version.max(disk_version) + 1;

        let json =
            serde_json::to_vec_pretty(state).context("Failed to serialize adaptive state")?;
        atomic_write(&self.path, &json)?;
        Ok(state.version)
    }
}

/// Write data to a file atomically using temp-file + rename.
fn atomic_write(target: &Path, data: &[u8]) -> Result<()> {
    let parent = target.parent().context("Target path has no parent")?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    tmp.write_all(data).context("Failed to write temp file")?;
    tmp.flush().context("Failed to flush temp file")?;

    tmp.persist(target)
        .with_context(|| format!("Failed to persist to {}", target.display()))?;
    Ok(())
}
