//! Version lock policy.
//!
//! A single persisted record constrains which target versions an update may
//! select. Evaluation is an ordered chain; the first rule that produces a
//! verdict wins:
//!
//! 1. not locked
//! 2. expired temporary lock (auto-unlocks)
//! 3. pinned version
//! 4. allow-list
//! 5. min/max range (denies only)
//! 6. update-class flags

use crate::error::{Result, UpdateError};
use crate::paths::StateDir;
use crate::release::ReleaseClient;
use crate::version::{UpdateType, Version};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub locked: bool,
    pub locked_version: Option<Version>,
    pub min_version: Option<Version>,
    pub max_version: Option<Version>,
    pub allowed_versions: Vec<Version>,
    pub allow_major: bool,
    pub allow_minor: bool,
    pub allow_patch: bool,
    pub allow_prerelease: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            locked: false,
            locked_version: None,
            min_version: None,
            max_version: None,
            allowed_versions: Vec::new(),
            allow_major: true,
            allow_minor: true,
            allow_patch: true,
            allow_prerelease: true,
            expires_at: None,
            reason: None,
        }
    }
}

/// Verdict of the decision chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl LockDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn allow_because(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: Some(reason.into()),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Pure evaluation of the chain. Returns the verdict plus whether an expired
/// temporary lock was observed (the caller persists the auto-unlock).
fn evaluate(
    config: &LockConfig,
    target: &Version,
    current: &Version,
    now: DateTime<Utc>,
) -> (LockDecision, bool) {
    // 1. Unlocked installations accept everything.
    if !config.locked {
        return (LockDecision::allow(), false);
    }

    // 2. A lapsed temporary lock behaves as unlocked.
    if let Some(expires_at) = config.expires_at {
        if expires_at < now {
            return (LockDecision::allow_because("temporary lock expired"), true);
        }
    }

    // 3. A pinned version decides alone.
    if let Some(ref pinned) = config.locked_version {
        if target == pinned {
            return (LockDecision::allow(), false);
        }
        return (
            LockDecision::deny(format!("updates are locked to version {}", pinned)),
            false,
        );
    }

    // 4. A non-empty allow-list decides alone.
    if !config.allowed_versions.is_empty() {
        if config.allowed_versions.iter().any(|v| v == target) {
            return (LockDecision::allow(), false);
        }
        return (
            LockDecision::deny(format!("{} is not in the allowed version list", target)),
            false,
        );
    }

    // 5. Range violations deny before the class flags get a say.
    if let Some(ref min) = config.min_version {
        if target.is_older_than(min) {
            return (
                LockDecision::deny(format!("{} is below the minimum allowed {}", target, min)),
                false,
            );
        }
    }
    if let Some(ref max) = config.max_version {
        if target.is_newer_than(max) {
            return (
                LockDecision::deny(format!("{} is above the maximum allowed {}", target, max)),
                false,
            );
        }
    }

    // 6. Class flags against the concrete delta.
    if target.prerelease.is_some() && !config.allow_prerelease {
        return (
            LockDecision::deny("prerelease updates are not allowed".to_string()),
            false,
        );
    }
    let step = UpdateType::classify(current, target);
    let (allowed, class) = match step {
        UpdateType::Major => (config.allow_major, "major"),
        UpdateType::Minor => (config.allow_minor, "minor"),
        UpdateType::Patch => (config.allow_patch, "patch"),
        UpdateType::None => (true, "none"),
    };
    if allowed {
        (LockDecision::allow(), false)
    } else {
        (
            LockDecision::deny(format!("{} updates are not allowed", class)),
            false,
        )
    }
}

/// Persisted lock policy. Every mutator replaces the whole record.
pub struct LockPolicy {
    path: PathBuf,
    config: LockConfig,
}

impl LockPolicy {
    pub fn load(state_dir: &StateDir) -> Self {
        let path = state_dir.lock_config_file();
        let config = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => LockConfig::default(),
        };
        Self { path, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn replace(&mut self, config: LockConfig) -> Result<()> {
        self.config = config;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.config)?;
        fs::write(&self.path, content)?;
        Ok(())
    }

    pub fn lock_to_version(&mut self, version: Version, reason: Option<String>) -> Result<()> {
        info!("locking updates to version {}", version);
        self.replace(LockConfig {
            locked: true,
            locked_version: Some(version),
            reason,
            ..LockConfig::default()
        })
    }

    pub fn lock_to_range(
        &mut self,
        min: Option<Version>,
        max: Option<Version>,
        reason: Option<String>,
    ) -> Result<()> {
        self.replace(LockConfig {
            locked: true,
            min_version: min,
            max_version: max,
            reason,
            ..LockConfig::default()
        })
    }

    pub fn lock_with_policy(
        &mut self,
        allow_major: bool,
        allow_minor: bool,
        allow_patch: bool,
        allow_prerelease: bool,
        reason: Option<String>,
    ) -> Result<()> {
        self.replace(LockConfig {
            locked: true,
            allow_major,
            allow_minor,
            allow_patch,
            allow_prerelease,
            reason,
            ..LockConfig::default()
        })
    }

    pub fn temporary_lock(
        &mut self,
        version: Version,
        duration_days: i64,
        reason: Option<String>,
    ) -> Result<()> {
        let expires_at = Utc::now() + Duration::days(duration_days);
        info!(
            "temporarily locking updates to {} until {}",
            version, expires_at
        );
        self.replace(LockConfig {
            locked: true,
            locked_version: Some(version),
            expires_at: Some(expires_at),
            reason,
            ..LockConfig::default()
        })
    }

    pub fn unlock(&mut self) -> Result<()> {
        info!("unlocking updates");
        self.replace(LockConfig::default())
    }

    pub fn add_allowed_version(&mut self, version: Version) -> Result<()> {
        let mut config = self.config.clone();
        config.locked = true;
        if !config.allowed_versions.iter().any(|v| v == &version) {
            config.allowed_versions.push(version);
        }
        self.replace(config)
    }

    pub fn remove_allowed_version(&mut self, version: &Version) -> Result<()> {
        let mut config = self.config.clone();
        config.allowed_versions.retain(|v| v != version);
        self.replace(config)
    }

    /// Run the decision chain for one candidate. An expired temporary lock
    /// is persisted away as a side effect.
    pub fn is_version_allowed(&mut self, target: &Version, current: &Version) -> LockDecision {
        let (decision, expired) = evaluate(&self.config, target, current, Utc::now());
        if expired {
            if let Err(e) = self.unlock() {
                warn!("failed to persist expired-lock removal: {}", e);
            }
        }
        decision
    }

    /// Candidate versions the policy would accept, newest first. When the
    /// pin or allow-list alone decides, no release enumeration happens.
    pub async fn allowed_versions(
        &mut self,
        current: &Version,
        releases: &ReleaseClient,
    ) -> Result<Vec<Version>> {
        // Normalize an expired temporary lock first.
        let _ = self.is_version_allowed(current, current);

        if self.config.locked {
            if let Some(ref pinned) = self.config.locked_version {
                return Ok(vec![pinned.clone()]);
            }
            if !self.config.allowed_versions.is_empty() {
                let mut list = self.config.allowed_versions.clone();
                list.sort_by(|a, b| b.cmp(a));
                return Ok(list);
            }
        }

        let mut allowed: Vec<Version> = releases
            .all_releases(100)
            .await?
            .into_iter()
            .map(|r| r.version)
            .filter(|v| evaluate(&self.config, v, current, Utc::now()).0.allowed)
            .collect();
        allowed.sort_by(|a, b| b.cmp(a));
        Ok(allowed)
    }

    /// Human description of the active policy.
    pub fn lock_summary(&self) -> String {
        let c = &self.config;
        if !c.locked {
            return "updates unlocked: any version may be installed".to_string();
        }

        let mut parts = Vec::new();
        if let Some(ref v) = c.locked_version {
            parts.push(format!("locked to version {}", v));
        } else if !c.allowed_versions.is_empty() {
            let list: Vec<String> = c.allowed_versions.iter().map(|v| v.to_string()).collect();
            parts.push(format!("allowed versions: {}", list.join(", ")));
        } else if c.min_version.is_some() || c.max_version.is_some() {
            let min = c
                .min_version
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "any".to_string());
            let max = c
                .max_version
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "any".to_string());
            parts.push(format!("allowed range: {} to {}", min, max));
        } else {
            let mut classes = Vec::new();
            if c.allow_major {
                classes.push("major");
            }
            if c.allow_minor {
                classes.push("minor");
            }
            if c.allow_patch {
                classes.push("patch");
            }
            if c.allow_prerelease {
                classes.push("prerelease");
            }
            if classes.is_empty() {
                parts.push("all update classes blocked".to_string());
            } else {
                parts.push(format!("allowed update classes: {}", classes.join(", ")));
            }
        }
        if let Some(expires_at) = c.expires_at {
            parts.push(format!("expires {}", expires_at.format("%Y-%m-%d %H:%M UTC")));
        }
        if let Some(ref reason) = c.reason {
            parts.push(format!("reason: {}", reason));
        }
        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn policy(temp: &TempDir) -> LockPolicy {
        LockPolicy::load(&StateDir::at(temp.path()))
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn default_is_unlocked_and_allows_everything() {
        let temp = TempDir::new().unwrap();
        let mut p = policy(&temp);
        assert!(!p.config().locked);
        let decision = p.is_version_allowed(&v("99.0.0"), &v("1.0.0"));
        assert!(decision.allowed);
    }

    #[test]
    fn pinned_version_decides_alone() {
        let temp = TempDir::new().unwrap();
        let mut p = policy(&temp);
        p.lock_to_version(v("3.0.0"), Some("known good".to_string()))
            .unwrap();

        let denied = p.is_version_allowed(&v("3.0.1"), &v("2.9.0"));
        assert!(!denied.allowed);
        assert!(denied.reason.unwrap().contains("3.0.0"));

        let allowed = p.is_version_allowed(&v("3.0.0"), &v("2.9.0"));
        assert!(allowed.allowed);
    }

    #[test]
    fn allow_list_decides_before_range_and_flags() {
        let temp = TempDir::new().unwrap();
        let mut p = policy(&temp);
        // A blocked-everything policy with an allow-list entry: the list wins.
        p.lock_with_policy(false, false, false, false, None).unwrap();
        p.add_allowed_version(v("9.9.9")).unwrap();

        assert!(p.is_version_allowed(&v("9.9.9"), &v("1.0.0")).allowed);
        assert!(!p.is_version_allowed(&v("1.0.1"), &v("1.0.0")).allowed);

        p.remove_allowed_version(&v("9.9.9")).unwrap();
        assert!(!p.is_version_allowed(&v("9.9.9"), &v("1.0.0")).allowed);
    }

    #[test]
    fn range_violation_denies_even_when_flags_would_allow() {
        let temp = TempDir::new().unwrap();
        let mut p = policy(&temp);
        p.lock_to_range(Some(v("2.0.0")), Some(v("2.9.9")), None)
            .unwrap();

        // 3.0.0 is a major step the default flags would allow, but it is
        // outside the range.
        let denied = p.is_version_allowed(&v("3.0.0"), &v("2.5.0"));
        assert!(!denied.allowed);
        assert!(denied.reason.unwrap().contains("maximum"));

        assert!(!p.is_version_allowed(&v("1.9.0"), &v("2.5.0")).allowed);
        assert!(p.is_version_allowed(&v("2.6.0"), &v("2.5.0")).allowed);
    }

    #[test]
    fn class_flags_gate_by_delta() {
        let temp = TempDir::new().unwrap();
        let mut p = policy(&temp);
        p.lock_with_policy(false, true, true, false, None).unwrap();

        assert!(!p.is_version_allowed(&v("2.0.0"), &v("1.0.0")).allowed);
        assert!(p.is_version_allowed(&v("1.1.0"), &v("1.0.0")).allowed);
        assert!(p.is_version_allowed(&v("1.0.1"), &v("1.0.0")).allowed);
        assert!(!p.is_version_allowed(&v("1.1.0-rc.1"), &v("1.0.0")).allowed);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let config = LockConfig {
            locked: true,
            min_version: Some(v("1.0.0")),
            max_version: Some(v("2.0.0")),
            ..LockConfig::default()
        };
        let now = Utc::now();
        let first = evaluate(&config, &v("1.5.0"), &v("1.0.0"), now);
        let second = evaluate(&config, &v("1.5.0"), &v("1.0.0"), now);
        assert_eq!(first.0, second.0);
    }

    #[test]
    fn expired_temporary_lock_auto_unlocks() {
        let temp = TempDir::new().unwrap();
        let mut p = policy(&temp);
        p.temporary_lock(v("1.0.0"), 7, None).unwrap();
        // Rewind the expiry into the past.
        let mut config = p.config().clone();
        config.expires_at = Some(Utc::now() - Duration::days(1));
        p.replace(config).unwrap();

        let decision = p.is_version_allowed(&v("2.0.0"), &v("1.0.0"));
        assert!(decision.allowed);
        // The auto-unlock persisted.
        assert!(!p.config().locked);
        let fresh = policy(&temp);
        assert!(!fresh.config().locked);
    }

    #[test]
    fn summary_mentions_the_active_rule() {
        let temp = TempDir::new().unwrap();
        let mut p = policy(&temp);
        assert!(p.lock_summary().contains("unlocked"));

        p.lock_to_version(v("3.0.0"), Some("pinned for release week".to_string()))
            .unwrap();
        let summary = p.lock_summary();
        assert!(summary.contains("3.0.0"));
        assert!(summary.contains("pinned for release week"));

        p.lock_to_range(Some(v("1.0.0")), None, None).unwrap();
        assert!(p.lock_summary().contains("range"));
    }
}
