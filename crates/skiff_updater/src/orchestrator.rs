//! Update orchestration.
//!
//! Composes the release source, channel manager, lock policy, diff
//! generator, crash recovery, backups and the subprocess seams into the
//! check -> gate -> backup -> install -> verify -> record flow, plus
//! rollback. All collaborators are constructor-injected; the only
//! process-wide state is the on-disk files behind them.

use crate::backup::{ArchiverConfig, BackupManager, DEFAULT_KEEP};
use crate::channel::ChannelManager;
use crate::diff::DiffGenerator;
use crate::error::{Result, UpdateError};
use crate::history::{UpdateHistory, UpdateHistoryEntry};
use crate::installer::Installer;
use crate::paths::StateDir;
use crate::policy::LockPolicy;
use crate::recovery::{standard_steps, RecoveryManager, UpdateProgress, UpdateState, UpdateStep};
use crate::release::{ReleaseClient, UpdateCheck};
use crate::version::Version;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Attempt a state backup before installing.
    pub backup_enabled: bool,
    /// Extra attempts for steps flagged retryable.
    pub retry_limit: u32,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            backup_enabled: true,
            retry_limit: 1,
        }
    }
}

/// What an update attempt produced.
#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub from_version: Version,
    pub to_version: Version,
    pub updated: bool,
    /// False when the pre-update backup failed; rollback has no archive for
    /// this attempt.
    pub rollback_available: bool,
}

pub struct UpdateOrchestrator {
    releases: Arc<ReleaseClient>,
    channels: ChannelManager,
    policy: LockPolicy,
    recovery: RecoveryManager,
    diff: DiffGenerator,
    history: UpdateHistory,
    backups: BackupManager,
    installer: Installer,
    options: UpdateOptions,
}

impl UpdateOrchestrator {
    pub fn new(
        state_dir: &StateDir,
        releases: Arc<ReleaseClient>,
        installer: Installer,
        archiver: ArchiverConfig,
        options: UpdateOptions,
    ) -> Self {
        Self {
            channels: ChannelManager::new(state_dir, Arc::clone(&releases)),
            policy: LockPolicy::load(state_dir),
            recovery: RecoveryManager::new(state_dir),
            diff: DiffGenerator::new(Arc::clone(&releases)),
            history: UpdateHistory::new(state_dir),
            backups: BackupManager::new(state_dir, archiver),
            releases,
            installer,
            options,
        }
    }

    /// Best-effort check through the current channel. Never fails.
    pub async fn check_for_updates(&self, current: &Version) -> UpdateCheck {
        let channel = self.channels.channel_info(self.channels.current_channel());
        let include_pre = channel
            .as_ref()
            .map(|c| c.include_prereleases)
            .unwrap_or(false);
        match channel.and_then(|c| c.custom_url) {
            Some(url) => {
                ReleaseClient::new(url)
                    .check_for_update(current, include_pre)
                    .await
            }
            None => self.releases.check_for_update(current, include_pre).await,
        }
    }

    /// Run a full update to `target`, or to the channel's latest when no
    /// target is given. The outcome lands in the history log either way.
    pub async fn update(&mut self, current: &Version, target: Option<Version>) -> Result<UpdateReport> {
        let explicit = target.is_some();
        let target_version = match target {
            Some(t) => t,
            None => {
                let channel = self.channels.current_channel().to_string();
                self.channels
                    .latest_version_for_channel(&channel)
                    .await?
                    .map(|r| r.version)
                    .ok_or_else(|| {
                        UpdateError::ReleaseNotFound(format!(
                            "no releases available on channel {}",
                            channel
                        ))
                    })?
            }
        };

        if &target_version == current && !explicit {
            info!("already on latest version {}", current);
            return Ok(UpdateReport {
                from_version: current.clone(),
                to_version: target_version,
                updated: false,
                rollback_available: false,
            });
        }

        let result = self.perform_update(current, &target_version).await;
        self.record_history(current, &target_version, &result);
        result
    }

    /// Continue an interrupted attempt from its first incomplete step.
    pub async fn resume(&mut self) -> Result<UpdateReport> {
        let plan = self.recovery.resume_update()?;
        let from = plan.state.from_version.clone();
        let target = plan.state.to_version.clone();
        let rollback_available = !self.backups.list_backups().is_empty();

        let driven = self
            .drive_steps(&plan.remaining, &target, rollback_available)
            .await;
        let result = match driven {
            Ok(()) => {
                self.recovery.complete_update()?;
                info!("resumed update finished: {} -> {}", from, target);
                Ok(UpdateReport {
                    from_version: from.clone(),
                    to_version: target.clone(),
                    updated: true,
                    rollback_available,
                })
            }
            Err(e) => Err(e),
        };
        self.record_history(&from, &target, &result);
        result
    }

    async fn perform_update(&mut self, current: &Version, target: &Version) -> Result<UpdateReport> {
        let decision = self.policy.is_version_allowed(target, current);
        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or_else(|| "denied by lock policy".to_string());
            warn!("update {} -> {} denied: {}", current, target, reason);
            return Err(UpdateError::LockDenied {
                target: target.to_string(),
                reason,
            });
        }

        // Best effort only: a failed backup costs the rollback safety net
        // for this attempt, never the update itself.
        let mut rollback_available = false;
        if self.options.backup_enabled {
            match self.backups.create_backup(current).await {
                Ok(path) => {
                    debug!("pre-update backup at {}", path.display());
                    rollback_available = true;
                    self.backups.prune(DEFAULT_KEEP);
                }
                Err(e) => {
                    warn!("backup failed, rollback disabled for this attempt: {}", e);
                }
            }
        }

        let steps = standard_steps();
        self.recovery
            .start_update(current, target, steps.clone(), false)?;
        self.drive_steps(&steps, target, rollback_available).await?;
        self.recovery.complete_update()?;

        info!("update complete: {} -> {}", current, target);
        Ok(UpdateReport {
            from_version: current.clone(),
            to_version: target.clone(),
            updated: true,
            rollback_available,
        })
    }

    async fn drive_steps(
        &mut self,
        steps: &[UpdateStep],
        target: &Version,
        rollback_available: bool,
    ) -> Result<()> {
        for step in steps {
            let attempts = if step.retryable {
                1 + self.options.retry_limit
            } else {
                1
            };

            let mut last_err: Option<UpdateError> = None;
            for attempt in 1..=attempts {
                match self.run_step(&step.id, target, rollback_available).await {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(e) => {
                        if attempt < attempts {
                            warn!("step '{}' attempt {} failed, retrying: {}", step.id, attempt, e);
                        }
                        last_err = Some(e);
                    }
                }
            }

            let Some(err) = last_err else {
                self.recovery.complete_step(&step.id)?;
                continue;
            };

            if step.skippable {
                warn!("skipping failed step '{}': {}", step.id, err);
                self.recovery.complete_step(&step.id)?;
                continue;
            }

            let message = err.to_string();
            self.recovery
                .fail_step(&step.id, &message, step.critical_failure)?;
            return Err(match err {
                // The verification mismatch is its own fatal error.
                e @ UpdateError::InstallVerificationMismatch { .. } => e,
                e if step.critical_failure => UpdateError::CriticalStepFailure {
                    step: step.id.clone(),
                    reason: e.to_string(),
                },
                e => e,
            });
        }
        Ok(())
    }

    async fn run_step(&self, id: &str, target: &Version, rollback_available: bool) -> Result<()> {
        match id {
            "backup" => {
                if self.options.backup_enabled && !rollback_available {
                    Err(UpdateError::BackupFailed(
                        "no backup archive for this attempt".to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
            "download" => self.releases.release_by_version(target).await.map(|_| ()),
            "install" => self.installer.install(target).await,
            "verify" => {
                let installed = self.installer.installed_version().await?;
                if &installed == target {
                    Ok(())
                } else {
                    Err(UpdateError::InstallVerificationMismatch {
                        requested: target.to_string(),
                        installed: installed.to_string(),
                    })
                }
            }
            other => {
                debug!("step '{}' has no orchestrator action", other);
                Ok(())
            }
        }
    }

    fn record_history(&self, from: &Version, to: &Version, result: &Result<UpdateReport>) {
        let entry = UpdateHistoryEntry {
            timestamp: Utc::now(),
            from_version: from.clone(),
            to_version: to.clone(),
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        if let Err(e) = self.history.record(entry) {
            warn!("failed to record update history: {}", e);
        }
    }

    /// Restore the newest (or a named) backup archive over the installation
    /// state.
    pub async fn rollback(&mut self, archive: Option<&Path>) -> Result<PathBuf> {
        self.backups.restore(archive).await
    }

    pub fn update_history(&self) -> Vec<UpdateHistoryEntry> {
        self.history.entries()
    }

    /// Changelog of a specific version, or of the channel's latest.
    pub async fn changelog(&self, version: Option<&Version>) -> Result<String> {
        match version {
            Some(v) => Ok(self.releases.release_by_version(v).await?.changelog),
            None => {
                let include_pre = self
                    .channels
                    .channel_info(self.channels.current_channel())
                    .map(|c| c.include_prereleases)
                    .unwrap_or(false);
                Ok(self.releases.latest_release(include_pre).await?.changelog)
            }
        }
    }

    pub fn list_backups(&self) -> Vec<PathBuf> {
        self.backups.list_backups()
    }

    /// Candidate versions the lock policy would accept right now.
    pub async fn allowed_versions(&mut self, current: &Version) -> Result<Vec<Version>> {
        self.policy.allowed_versions(current, self.releases.as_ref()).await
    }

    // Crash-recovery introspection for the surrounding layer.

    pub fn has_interrupted_update(&self) -> bool {
        self.recovery.has_interrupted_update()
    }

    pub fn interrupted_state(&self) -> Option<UpdateState> {
        self.recovery.interrupted_state()
    }

    pub fn progress(&self) -> UpdateProgress {
        self.recovery.progress()
    }

    pub fn abort_update(&mut self, reason: &str) -> Result<()> {
        self.recovery.abort_update(reason)
    }

    // Direct access to the managed services for lock, channel and diff
    // operations.

    pub fn policy(&mut self) -> &mut LockPolicy {
        &mut self.policy
    }

    pub fn channels(&mut self) -> &mut ChannelManager {
        &mut self.channels
    }

    pub fn diff(&self) -> &DiffGenerator {
        &self.diff
    }

    pub fn recovery(&mut self) -> &mut RecoveryManager {
        &mut self.recovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::{CommandSpec, InstallerConfig};
    use tempfile::TempDir;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn orchestrator(temp: &TempDir) -> UpdateOrchestrator {
        let dir = StateDir::at(temp.path());
        std::fs::create_dir_all(dir.root()).unwrap();
        UpdateOrchestrator::new(
            &dir,
            Arc::new(ReleaseClient::new("http://localhost:0")),
            Installer::new(InstallerConfig {
                install: CommandSpec::new("true", &[]),
                query_version: CommandSpec::new("echo", &["5.1.0"]),
            }),
            ArchiverConfig::default(),
            UpdateOptions::default(),
        )
    }

    #[tokio::test]
    async fn lock_denial_is_recorded_in_history() {
        let temp = TempDir::new().unwrap();
        let mut orch = orchestrator(&temp);
        orch.policy().lock_to_version(v("3.0.0"), None).unwrap();

        let err = orch
            .update(&v("2.9.0"), Some(v("3.0.1")))
            .await
            .unwrap_err();
        match err {
            UpdateError::LockDenied { target, reason } => {
                assert_eq!(target, "3.0.1");
                assert!(reason.contains("3.0.0"));
            }
            other => panic!("expected LockDenied, got {other:?}"),
        }

        let history = orch.update_history();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert!(history[0].error.as_deref().unwrap().contains("lock policy"));
        // The denial never reached the step machine.
        assert!(!orch.has_interrupted_update());
    }

    #[tokio::test]
    async fn introspection_defaults_are_quiet() {
        let temp = TempDir::new().unwrap();
        let mut orch = orchestrator(&temp);
        assert!(!orch.has_interrupted_update());
        assert!(orch.interrupted_state().is_none());
        assert_eq!(orch.progress().percentage, 0);
        assert!(orch.update_history().is_empty());
        assert!(orch.list_backups().is_empty());
        assert!(matches!(
            orch.abort_update("nothing running"),
            Err(UpdateError::NoActiveUpdate)
        ));
    }
}
