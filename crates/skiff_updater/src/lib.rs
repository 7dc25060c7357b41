//! skiff_updater - Self-Update Subsystem
//!
//! Governs one local installation's update lifecycle:
//! 1. Release checking against a GitHub-shaped releases API, with an
//!    in-process TTL cache and fail-open unattended checks
//! 2. Channel subscriptions (stable/beta/alpha/nightly plus custom sources)
//! 3. Changelog classification into breaking/feature/fix/security buckets
//! 4. A persisted lock policy gating which target versions may install
//! 5. Crash-safe multi-step updates: exclusive cross-process lock file,
//!    persisted step progress, resume after interruption
//! 6. Backup and rollback of the installation's state directory
//!
//! The CLI layer, notification plumbing and the package manager's install
//! mechanics live elsewhere; the latter two are reached only through the
//! configured subprocess contracts in [`installer`].

pub mod backup;
pub mod channel;
pub mod diff;
pub mod error;
pub mod history;
pub mod installer;
pub mod orchestrator;
pub mod paths;
pub mod policy;
pub mod recovery;
pub mod release;
pub mod version;

// Re-exports
pub use backup::{ArchiverConfig, BackupManager};
pub use channel::{builtin_channels, ChannelConfig, ChannelManager};
pub use diff::{DiffGenerator, RecommendedAction, VersionDiff};
pub use error::{Result, UpdateError};
pub use history::{UpdateHistory, UpdateHistoryEntry, HISTORY_LIMIT};
pub use installer::{CommandSpec, Installer, InstallerConfig};
pub use orchestrator::{UpdateOptions, UpdateOrchestrator, UpdateReport};
pub use paths::StateDir;
pub use policy::{LockConfig, LockDecision, LockPolicy};
pub use recovery::{
    standard_steps, LockFileInfo, RecoveryManager, ResumePlan, UpdateProgress, UpdateState,
    UpdateStep,
};
pub use release::{
    CheckOutcome, ReleaseAsset, ReleaseClient, ReleaseInfo, UpdateCheck, CACHE_TTL,
};
pub use version::{UpdateType, Version};
