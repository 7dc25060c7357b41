//! Crash-safe update progress.
//!
//! Non-negotiable guarantees:
//! 1. Exactly one update may run at a time, across OS processes, enforced by
//!    an exclusive-create lock file (never check-then-create).
//! 2. Step progress is persisted after every transition, so a process crash
//!    leaves a resumable record behind.
//! 3. A critical step failure permanently disables resume for that attempt;
//!    the operator must abort and start fresh.
//!
//! State machine per attempt:
//! NotStarted -> InProgress -> { Completed | Aborted | Failed(critical) }

use crate::error::{Result, UpdateError};
use crate::paths::StateDir;
use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process;
use tracing::{info, warn};

/// One atomic, independently completable unit of work within an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStep {
    pub id: String,
    pub name: String,
    pub description: String,
    pub completed: bool,
    pub skippable: bool,
    pub retryable: bool,
    pub critical_failure: bool,
}

impl UpdateStep {
    pub fn new(id: &str, name: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            completed: false,
            skippable: false,
            retryable: false,
            critical_failure: false,
        }
    }

    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical_failure = true;
        self
    }
}

/// The standard step set the orchestrator drives.
pub fn standard_steps() -> Vec<UpdateStep> {
    vec![
        UpdateStep::new("backup", "Backup", "Verify a pre-update backup exists").skippable(),
        UpdateStep::new("download", "Download", "Confirm the target release is fetchable")
            .retryable(),
        UpdateStep::new("install", "Install", "Run the package manager install").critical(),
        UpdateStep::new("verify", "Verify", "Re-query the installed version").critical(),
    ]
}

/// Persisted progress of one update attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateState {
    pub update_id: String,
    pub started_at: DateTime<Utc>,
    pub from_version: Version,
    pub to_version: Version,
    pub steps: Vec<UpdateStep>,
    pub step_index: usize,
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub failed_step: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub can_resume: bool,
}

impl UpdateState {
    fn remaining_steps(&self) -> Vec<UpdateStep> {
        self.steps.iter().filter(|s| !s.completed).cloned().collect()
    }
}

/// Contents of the cross-process exclusion lock, for operator forensics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFileInfo {
    pub update_id: String,
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockFileInfo {
    fn new(update_id: &str) -> Self {
        let hostname = fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            update_id: update_id.to_string(),
            pid: process::id(),
            hostname,
            acquired_at: Utc::now(),
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "update {} held by pid {} on {} since {}",
            self.update_id,
            self.pid,
            self.hostname,
            self.acquired_at.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateProgress {
    pub completed: usize,
    pub total: usize,
    pub percentage: u8,
}

impl UpdateProgress {
    fn from_state(state: &UpdateState) -> Self {
        let completed = state.completed_steps.len();
        let total = state.steps.len();
        let percentage = if total == 0 {
            0
        } else {
            ((completed as f64 / total as f64) * 100.0).round() as u8
        };
        Self {
            completed,
            total,
            percentage,
        }
    }

    fn zero() -> Self {
        Self {
            completed: 0,
            total: 0,
            percentage: 0,
        }
    }
}

/// Remaining work handed back by [`RecoveryManager::resume_update`].
#[derive(Debug, Clone)]
pub struct ResumePlan {
    pub state: UpdateState,
    pub remaining: Vec<UpdateStep>,
}

/// Persists step-by-step progress and owns the exclusion lock.
pub struct RecoveryManager {
    state_path: PathBuf,
    lock_path: PathBuf,
    /// The attempt this process is driving, if any. Interrupted updates from
    /// a dead process live only on disk until resumed.
    active: Option<UpdateState>,
}

impl RecoveryManager {
    pub fn new(state_dir: &StateDir) -> Self {
        Self {
            state_path: state_dir.update_state_file(),
            lock_path: state_dir.update_lock_file(),
            active: None,
        }
    }

    fn load_disk_state(&self) -> Option<UpdateState> {
        let content = fs::read_to_string(&self.state_path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn persist(&self, state: &UpdateState) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&self.state_path, content)?;
        Ok(())
    }

    /// Exclusive-create the lock file. `create_new` is the atomicity
    /// primitive: two processes racing here cannot both win.
    fn acquire_lock(&self, update_id: &str) -> Result<()> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = self
                    .is_update_locked()
                    .map(|info| info.describe())
                    .unwrap_or_else(|| "unreadable lock file".to_string());
                return Err(UpdateError::ConcurrentUpdateDenied { holder });
            }
            Err(e) => return Err(e.into()),
        };
        let info = LockFileInfo::new(update_id);
        file.write_all(serde_json::to_string_pretty(&info)?.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn release_lock(&self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("failed to remove update lock: {}", e);
            }
        }
    }

    /// Begin a new attempt. Refuses while another update holds the lock,
    /// unless `force` clears it first.
    pub fn start_update(
        &mut self,
        from: &Version,
        to: &Version,
        steps: Vec<UpdateStep>,
        force: bool,
    ) -> Result<UpdateState> {
        if force {
            warn!("forcing removal of existing update lock");
            self.release_lock();
        }

        let update_id = uuid::Uuid::new_v4().to_string();
        self.acquire_lock(&update_id)?;

        let state = UpdateState {
            update_id,
            started_at: Utc::now(),
            from_version: from.clone(),
            to_version: to.clone(),
            steps,
            step_index: 0,
            completed_steps: Vec::new(),
            failed_step: None,
            error: None,
            can_resume: true,
        };

        if let Err(e) = self.persist(&state) {
            // Never leave a lock behind for a state we failed to write.
            self.release_lock();
            return Err(e);
        }

        info!(
            "update {} started: {} -> {}",
            state.update_id, from, to
        );
        self.active = Some(state.clone());
        Ok(state)
    }

    fn active_mut(&mut self) -> Result<&mut UpdateState> {
        self.active.as_mut().ok_or(UpdateError::NoActiveUpdate)
    }

    pub fn complete_step(&mut self, id: &str) -> Result<UpdateState> {
        let state = self.active_mut()?;
        if let Some(step) = state.steps.iter_mut().find(|s| s.id == id) {
            step.completed = true;
        }
        if !state.completed_steps.iter().any(|s| s == id) {
            state.completed_steps.push(id.to_string());
        }
        state.step_index = state
            .steps
            .iter()
            .position(|s| !s.completed)
            .unwrap_or(state.steps.len());
        let snapshot = state.clone();
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    pub fn fail_step(&mut self, id: &str, error: &str, critical: bool) -> Result<UpdateState> {
        let state = self.active_mut()?;
        state.failed_step = Some(id.to_string());
        state.error = Some(error.to_string());
        if critical {
            // Permanent for this attempt; resume must refuse.
            state.can_resume = false;
        }
        let snapshot = state.clone();
        self.persist(&snapshot)?;
        warn!(
            "update {} step '{}' failed{}: {}",
            snapshot.update_id,
            id,
            if critical { " critically" } else { "" },
            error
        );
        Ok(snapshot)
    }

    /// Successful finish: the attempt record and the lock both go away.
    pub fn complete_update(&mut self) -> Result<()> {
        let state = self.active_mut()?;
        for step in &mut state.steps {
            step.completed = true;
        }
        let all_ids: Vec<String> = state.steps.iter().map(|s| s.id.clone()).collect();
        state.completed_steps = all_ids;
        state.step_index = state.steps.len();
        let update_id = state.update_id.clone();

        if let Err(e) = fs::remove_file(&self.state_path) {
            if e.kind() != ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        self.release_lock();
        info!("update {} completed", update_id);
        Ok(())
    }

    /// Explicit abandonment, the only between-steps cancellation point.
    pub fn abort_update(&mut self, reason: &str) -> Result<()> {
        let state = self
            .active
            .take()
            .or_else(|| self.load_disk_state())
            .ok_or(UpdateError::NoActiveUpdate)?;

        if let Err(e) = fs::remove_file(&self.state_path) {
            if e.kind() != ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        self.release_lock();
        info!("update {} aborted: {}", state.update_id, reason);
        Ok(())
    }

    /// A state file with no attempt active in this process means a previous
    /// process died mid-update.
    pub fn has_interrupted_update(&self) -> bool {
        self.active.is_none() && self.state_path.exists()
    }

    pub fn interrupted_state(&self) -> Option<UpdateState> {
        if self.active.is_some() {
            return None;
        }
        self.load_disk_state()
    }

    /// Pick up an interrupted attempt. Refuses when a critical step already
    /// failed; the caller must abort instead.
    pub fn resume_update(&mut self) -> Result<ResumePlan> {
        let mut state = self.load_disk_state().ok_or(UpdateError::NoActiveUpdate)?;

        if !state.can_resume {
            return Err(UpdateError::CriticalStepFailure {
                step: state.failed_step.unwrap_or_else(|| "unknown".to_string()),
                reason: format!(
                    "{}; abort the update and start fresh",
                    state.error.unwrap_or_else(|| "critical step failed".to_string())
                ),
            });
        }

        // The dead process left its lock behind; re-create it if anything
        // cleaned it up in the meantime.
        if !self.lock_path.exists() {
            self.acquire_lock(&state.update_id)?;
        }

        // A non-critical failure is forgotten on resume.
        state.failed_step = None;
        state.error = None;
        self.persist(&state)?;

        let remaining = state.remaining_steps();
        info!(
            "resuming update {} with {} of {} steps remaining",
            state.update_id,
            remaining.len(),
            state.steps.len()
        );
        self.active = Some(state.clone());
        Ok(ResumePlan { state, remaining })
    }

    pub fn progress(&self) -> UpdateProgress {
        match self.active.as_ref() {
            Some(state) => UpdateProgress::from_state(state),
            None => self
                .load_disk_state()
                .map(|s| UpdateProgress::from_state(&s))
                .unwrap_or_else(UpdateProgress::zero),
        }
    }

    /// The current lock holder, if any.
    pub fn is_update_locked(&self) -> Option<LockFileInfo> {
        let content = fs::read_to_string(&self.lock_path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Operator-initiated override for a stuck lock. Does not touch the
    /// state file.
    pub fn force_remove_lock(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path) {
            Ok(()) => {
                warn!("update lock forcibly removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn manager(temp: &TempDir) -> RecoveryManager {
        RecoveryManager::new(&StateDir::at(temp.path()))
    }

    fn three_steps() -> Vec<UpdateStep> {
        vec![
            UpdateStep::new("a", "A", "first"),
            UpdateStep::new("b", "B", "second").critical(),
            UpdateStep::new("c", "C", "third"),
        ]
    }

    #[test]
    fn standard_steps_include_a_critical_one() {
        assert!(standard_steps().iter().any(|s| s.critical_failure));
    }

    #[test]
    fn start_creates_state_and_lock() {
        let temp = TempDir::new().unwrap();
        let mut mgr = manager(&temp);
        let state = mgr
            .start_update(&v("1.0.0"), &v("1.1.0"), standard_steps(), false)
            .unwrap();
        assert!(state.can_resume);
        assert_eq!(state.step_index, 0);

        let lock = mgr.is_update_locked().unwrap();
        assert_eq!(lock.update_id, state.update_id);
        assert_eq!(lock.pid, process::id());
        assert_eq!(mgr.progress(), UpdateProgress { completed: 0, total: 4, percentage: 0 });
    }

    #[test]
    fn second_start_is_denied_while_locked() {
        let temp = TempDir::new().unwrap();
        let mut first = manager(&temp);
        first
            .start_update(&v("1.0.0"), &v("1.1.0"), standard_steps(), false)
            .unwrap();

        // A second manager models a second process on the same machine.
        let mut second = manager(&temp);
        let err = second
            .start_update(&v("1.0.0"), &v("1.1.0"), standard_steps(), false)
            .unwrap_err();
        assert!(matches!(err, UpdateError::ConcurrentUpdateDenied { .. }));

        // Force clears the stuck lock.
        second
            .start_update(&v("1.0.0"), &v("1.1.0"), standard_steps(), true)
            .unwrap();
    }

    #[test]
    fn completing_all_steps_removes_state_and_lock() {
        let temp = TempDir::new().unwrap();
        let dir = StateDir::at(temp.path());
        let mut mgr = RecoveryManager::new(&dir);
        mgr.start_update(&v("1.0.0"), &v("1.1.0"), three_steps(), false)
            .unwrap();

        for id in ["a", "b", "c"] {
            mgr.complete_step(id).unwrap();
        }
        mgr.complete_update().unwrap();

        assert!(!dir.update_state_file().exists());
        assert!(!dir.update_lock_file().exists());
        assert_eq!(mgr.progress().percentage, 100);
        assert!(!mgr.has_interrupted_update());
    }

    #[test]
    fn crash_then_fresh_manager_detects_and_resumes() {
        let temp = TempDir::new().unwrap();
        {
            let mut mgr = manager(&temp);
            mgr.start_update(&v("1.0.0"), &v("2.0.0"), three_steps(), false)
                .unwrap();
            mgr.complete_step("a").unwrap();
            // Process dies here: neither complete_update nor abort_update ran.
        }

        let mut fresh = manager(&temp);
        assert!(fresh.has_interrupted_update());
        let interrupted = fresh.interrupted_state().unwrap();
        assert_eq!(interrupted.completed_steps, ["a".to_string()]);
        assert_eq!(interrupted.step_index, 1);
        assert_eq!(fresh.progress(), UpdateProgress { completed: 1, total: 3, percentage: 33 });

        let plan = fresh.resume_update().unwrap();
        assert_eq!(plan.state.completed_steps, ["a".to_string()]);
        let ids: Vec<&str> = plan.remaining.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);
        // The update id survives the resume.
        assert_eq!(plan.state.update_id, interrupted.update_id);
    }

    #[test]
    fn critical_failure_blocks_resume() {
        let temp = TempDir::new().unwrap();
        {
            let mut mgr = manager(&temp);
            mgr.start_update(&v("1.0.0"), &v("2.0.0"), three_steps(), false)
                .unwrap();
            mgr.complete_step("a").unwrap();
            mgr.fail_step("b", "installer exploded", true).unwrap();
        }

        let mut fresh = manager(&temp);
        let err = fresh.resume_update().unwrap_err();
        match err {
            UpdateError::CriticalStepFailure { step, reason } => {
                assert_eq!(step, "b");
                assert!(reason.contains("abort"));
            }
            other => panic!("expected CriticalStepFailure, got {other:?}"),
        }

        // Abort is the only way out.
        fresh.abort_update("operator gave up").unwrap();
        assert!(!fresh.has_interrupted_update());
    }

    #[test]
    fn non_critical_failure_is_cleared_on_resume() {
        let temp = TempDir::new().unwrap();
        {
            let mut mgr = manager(&temp);
            mgr.start_update(&v("1.0.0"), &v("2.0.0"), three_steps(), false)
                .unwrap();
            mgr.fail_step("a", "transient network blip", false).unwrap();
        }

        let mut fresh = manager(&temp);
        let plan = fresh.resume_update().unwrap();
        assert!(plan.state.failed_step.is_none());
        assert!(plan.state.error.is_none());
        assert_eq!(plan.remaining.len(), 3);
    }

    #[test]
    fn force_remove_lock_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut mgr = manager(&temp);
        mgr.force_remove_lock().unwrap();
        mgr.start_update(&v("1.0.0"), &v("1.0.1"), three_steps(), false)
            .unwrap();
        mgr.force_remove_lock().unwrap();
        assert!(mgr.is_update_locked().is_none());
    }

    #[test]
    fn progress_rounds_to_nearest_percent() {
        let temp = TempDir::new().unwrap();
        let mut mgr = manager(&temp);
        mgr.start_update(&v("1.0.0"), &v("1.0.1"), three_steps(), false)
            .unwrap();
        mgr.complete_step("a").unwrap();
        mgr.complete_step("b").unwrap();
        // 2/3 rounds to 67.
        assert_eq!(mgr.progress().percentage, 67);
    }
}
