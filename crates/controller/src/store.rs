//! Persistent controller state with crash detection.
//!
//! One small JSON record, overwritten whole on every mutation.  Saves go
//! through a temp file + rename so a crash mid-write can never leave a
//! half-written record behind.
//!
//! Crash detection protocol: `clean_shutdown` is set false the moment a run
//! starts and true again only on graceful exit.  Finding it false at load
//! time means the previous process died without running its shutdown path.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// The single durable record.  Everything that must survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    /// Operator pause — survives restarts, suppresses decisions only.
    #[serde(default)]
    pub paused: bool,
    /// Whether the valve was last commanded open.
    #[serde(default)]
    pub misting_active: bool,
    /// When the current/most recent misting cycle started.  Never cleared
    /// once set: cooldown bookkeeping must survive restarts.
    #[serde(default)]
    pub last_start_time: Option<DateTime<Utc>>,
    /// When the valve was last commanded closed.
    #[serde(default)]
    pub last_stop_time: Option<DateTime<Utc>>,
    /// True only when the previous run exited through the shutdown path.
    #[serde(default = "default_clean")]
    pub clean_shutdown: bool,
    /// Starts that found `clean_shutdown == false`.
    #[serde(default)]
    pub crash_count: u32,
    /// Every start, clean or not.
    #[serde(default)]
    pub restart_count: u32,
}

/// A record that never existed cannot have crashed.
fn default_clean() -> bool {
    true
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            paused: false,
            misting_active: false,
            last_start_time: None,
            last_stop_time: None,
            clean_shutdown: true,
            crash_count: 0,
            restart_count: 0,
        }
    }
}

/// Load/save endpoint for the one [`PersistedState`] record.
///
/// The store itself is stateless; the record lives with the controller and
/// is passed in for every mutation so persistence stays under the same lock
/// as the runtime transitions that trigger it.
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

    /// Read the record.  A missing or unparseable file is not an error —
    /// it is a first run, logged and replaced with defaults.
    pub fn load(&self) -> PersistedState {
        match fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => {
                    info!(path = %self.path.display(), "loaded persisted state");
                    state
                }
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "state file is corrupt, starting from defaults"
                    );
                    PersistedState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no state file, starting from defaults");
                PersistedState::default()
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to read state file, starting from defaults"
                );
                PersistedState::default()
            }
        }
    }

    /// Atomically overwrite the record: write a sibling temp file, then
    /// rename over the target.  Callers treat failures as warnings — the
    /// in-memory record stays authoritative and the next mutation retries.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating state dir {}", parent.display()))?;
            }
        }

        let json = serde_json::to_vec_pretty(state).context("serializing state")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming into {}", self.path.display()))?;

        debug!(path = %self.path.display(), "state saved");
        Ok(())
    }

    /// Record that a run is starting.  Must be called exactly once, before
    /// the evaluation loop exists: bumps `restart_count`, detects a crash
    /// from the loaded `clean_shutdown`, then arms the marker for this run.
    pub fn mark_running(&self, state: &mut PersistedState) {
        state.restart_count += 1;
        if !state.clean_shutdown {
            state.crash_count += 1;
            warn!(
                crash_count = state.crash_count,
                "previous run did not shut down cleanly"
            );
        }
        state.clean_shutdown = false;

        info!(
            restart_count = state.restart_count,
            crash_count = state.crash_count,
            "run started"
        );

        if let Err(e) = self.save(state) {
            warn!(error = %e, "failed to persist startup state");
        }
    }

    /// Record a graceful exit.
    pub fn mark_clean_shutdown(&self, state: &mut PersistedState) {
        state.clean_shutdown = true;
        if let Err(e) = self.save(state) {
            warn!(error = %e, "failed to persist clean-shutdown marker");
        } else {
            info!("clean shutdown recorded");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
