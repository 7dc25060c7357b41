//! Per-user state directory layout.
//!
//! Everything the subsystem persists lives under one root:
//! `$SKIFF_STATE_DIR`, else `$XDG_STATE_HOME/skiff`, else
//! `$HOME/.local/state/skiff`.

use std::env;
use std::path::{Path, PathBuf};

/// Well-known state directory for the installed product.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Resolve from the environment.
    pub fn resolve() -> Self {
        if let Some(dir) = env::var_os("SKIFF_STATE_DIR") {
            return Self { root: dir.into() };
        }
        if let Some(xdg) = env::var_os("XDG_STATE_HOME") {
            return Self {
                root: PathBuf::from(xdg).join("skiff"),
            };
        }
        if let Some(home) = env::var_os("HOME") {
            return Self {
                root: PathBuf::from(home).join(".local").join("state").join("skiff"),
            };
        }
        // Last resort for stripped-down environments.
        Self {
            root: PathBuf::from(".skiff-state"),
        }
    }

    /// Use an explicit root (tests, embedded installs).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persisted lock policy.
    pub fn lock_config_file(&self) -> PathBuf {
        self.root.join("update-lock.json")
    }

    /// Step-by-step progress of the in-flight update.
    pub fn update_state_file(&self) -> PathBuf {
        self.root.join("update-state.json")
    }

    /// Cross-process exclusion lock.
    pub fn update_lock_file(&self) -> PathBuf {
        self.root.join("update.lock")
    }

    pub fn history_file(&self) -> PathBuf {
        self.root.join("update-history.json")
    }

    pub fn channels_file(&self) -> PathBuf {
        self.root.join("channels.json")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }
}
