//! Backup and restore of the installation's persisted state.
//!
//! Backups are timestamped archives created by an external archive command
//! (the tool itself is an opaque contract). Each archive gets a SHA-256
//! sidecar at creation time, re-checked before a restore.

use crate::error::{Result, UpdateError};
use crate::installer::CommandSpec;
use crate::paths::StateDir;
use crate::version::Version;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Archives kept by [`BackupManager::prune`].
pub const DEFAULT_KEEP: usize = 5;

const ARCHIVE_EXT: &str = "tar.gz";

/// Create/extract commands with `{archive}` and `{dir}` placeholders.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    pub create: CommandSpec,
    pub extract: CommandSpec,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            // The backups directory lives inside the state dir; keep it out
            // of its own archives.
            create: CommandSpec::new(
                "tar",
                &["-czf", "{archive}", "--exclude=backups", "-C", "{dir}", "."],
            ),
            extract: CommandSpec::new("tar", &["-xzf", "{archive}", "-C", "{dir}"]),
        }
    }
}

pub struct BackupManager {
    product: String,
    data_dir: PathBuf,
    backups_dir: PathBuf,
    archiver: ArchiverConfig,
}

impl BackupManager {
    pub fn new(state_dir: &StateDir, archiver: ArchiverConfig) -> Self {
        Self {
            product: "skiff".to_string(),
            data_dir: state_dir.root().to_path_buf(),
            backups_dir: state_dir.backups_dir(),
            archiver,
        }
    }

    /// Archive the state directory as `<product>-v<version>-<timestamp>`.
    pub async fn create_backup(&self, version: &Version) -> Result<PathBuf> {
        fs::create_dir_all(&self.backups_dir)?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S");
        let archive = self.backups_dir.join(format!(
            "{}-v{}-{}.{}",
            self.product, version, timestamp, ARCHIVE_EXT
        ));

        let archive_arg = archive.to_string_lossy();
        let dir_arg = self.data_dir.to_string_lossy();
        self.archiver
            .create
            .run(&[("archive", archive_arg.as_ref()), ("dir", dir_arg.as_ref())])
            .await
            .map_err(|e| UpdateError::BackupFailed(e.to_string()))?;

        match file_sha256(&archive) {
            Ok(digest) => {
                let _ = fs::write(sidecar_path(&archive), &digest);
                info!("backup created: {} ({})", archive.display(), &digest[..16]);
            }
            Err(e) => warn!("backup digest could not be computed: {}", e),
        }

        Ok(archive)
    }

    /// All archives, newest first.
    pub fn list_backups(&self) -> Vec<PathBuf> {
        let mut archives: Vec<PathBuf> = match fs::read_dir(&self.backups_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.to_string_lossy().ends_with(ARCHIVE_EXT))
                .collect(),
            Err(_) => Vec::new(),
        };
        // The timestamp suffix makes lexicographic order chronological.
        archives.sort();
        archives.reverse();
        archives
    }

    /// Restore the named archive, or the most recent one, over the state
    /// directory. The sidecar digest, when present, must still match.
    pub async fn restore(&self, archive: Option<&Path>) -> Result<PathBuf> {
        let archive = match archive {
            Some(path) => path.to_path_buf(),
            None => self
                .list_backups()
                .into_iter()
                .next()
                .ok_or(UpdateError::NoBackupAvailable)?,
        };
        if !archive.exists() {
            return Err(UpdateError::NoBackupAvailable);
        }

        let sidecar = sidecar_path(&archive);
        if let Ok(expected) = fs::read_to_string(&sidecar) {
            let actual = file_sha256(&archive)
                .map_err(|e| UpdateError::BackupFailed(format!("digest check: {}", e)))?;
            if actual != expected.trim() {
                return Err(UpdateError::BackupFailed(format!(
                    "archive {} does not match its recorded digest",
                    archive.display()
                )));
            }
        }

        fs::create_dir_all(&self.data_dir)?;
        let archive_arg = archive.to_string_lossy();
        let dir_arg = self.data_dir.to_string_lossy();
        self.archiver
            .extract
            .run(&[("archive", archive_arg.as_ref()), ("dir", dir_arg.as_ref())])
            .await
            .map_err(|e| UpdateError::BackupFailed(e.to_string()))?;

        info!("restored backup {}", archive.display());
        Ok(archive)
    }

    /// Keep the newest `keep` archives, remove the rest (and sidecars).
    pub fn prune(&self, keep: usize) {
        for old in self.list_backups().into_iter().skip(keep) {
            let _ = fs::remove_file(sidecar_path(&old));
            if let Err(e) = fs::remove_file(&old) {
                warn!("failed to prune backup {}: {}", old.display(), e);
            }
        }
    }
}

fn sidecar_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".sha256");
    PathBuf::from(name)
}

fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn seeded_manager(temp: &TempDir) -> BackupManager {
        let dir = StateDir::at(temp.path());
        fs::create_dir_all(dir.root()).unwrap();
        fs::write(dir.root().join("settings.json"), r#"{"theme":"dark"}"#).unwrap();
        BackupManager::new(&dir, ArchiverConfig::default())
    }

    #[tokio::test]
    async fn create_list_restore_round_trip() {
        let temp = TempDir::new().unwrap();
        let mgr = seeded_manager(&temp);

        let archive = mgr.create_backup(&v("1.0.0")).await.unwrap();
        assert!(archive.exists());
        assert!(sidecar_path(&archive).exists());
        let name = archive.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("skiff-v1.0.0-"));
        assert!(name.ends_with(".tar.gz"));
        assert_eq!(mgr.list_backups(), vec![archive.clone()]);

        // Damage the live state, then restore.
        fs::write(temp.path().join("settings.json"), "corrupted").unwrap();
        let restored = mgr.restore(None).await.unwrap();
        assert_eq!(restored, archive);
        let content = fs::read_to_string(temp.path().join("settings.json")).unwrap();
        assert!(content.contains("dark"));
    }

    #[tokio::test]
    async fn restore_with_no_backups_fails() {
        let temp = TempDir::new().unwrap();
        let mgr = seeded_manager(&temp);
        let err = mgr.restore(None).await.unwrap_err();
        assert!(matches!(err, UpdateError::NoBackupAvailable));
    }

    #[tokio::test]
    async fn tampered_archive_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mgr = seeded_manager(&temp);
        let archive = mgr.create_backup(&v("1.0.0")).await.unwrap();

        fs::write(&archive, "not a real archive").unwrap();
        let err = mgr.restore(Some(&archive)).await.unwrap_err();
        assert!(matches!(err, UpdateError::BackupFailed(_)));
    }

    #[tokio::test]
    async fn prune_keeps_newest() {
        let temp = TempDir::new().unwrap();
        let mgr = seeded_manager(&temp);
        // Fake archives with ascending timestamps; prune never inspects the
        // contents.
        let dir = temp.path().join("backups");
        fs::create_dir_all(&dir).unwrap();
        for i in 0..4 {
            fs::write(
                dir.join(format!("skiff-v1.0.{}-2026010100000{}.tar.gz", i, i)),
                "x",
            )
            .unwrap();
        }

        mgr.prune(2);
        let left = mgr.list_backups();
        assert_eq!(left.len(), 2);
        assert!(left[0].to_string_lossy().contains("v1.0.3"));
    }

    #[tokio::test]
    async fn failing_archiver_reports_backup_failed() {
        let temp = TempDir::new().unwrap();
        let dir = StateDir::at(temp.path());
        fs::create_dir_all(dir.root()).unwrap();
        let mgr = BackupManager::new(
            &dir,
            ArchiverConfig {
                create: CommandSpec::new("false", &[]),
                extract: CommandSpec::new("false", &[]),
            },
        );
        let err = mgr.create_backup(&v("1.0.0")).await.unwrap_err();
        assert!(matches!(err, UpdateError::BackupFailed(_)));
    }
}
