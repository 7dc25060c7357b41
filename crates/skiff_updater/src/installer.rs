//! Opaque subprocess contracts.
//!
//! The package manager's install mechanics and the archive tool are not this
//! subsystem's business; they are configured commands. Placeholders
//! (`{version}`, `{archive}`, `{dir}`) are substituted before spawning.

use crate::error::{Result, UpdateError};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

/// A configured external command with placeholder arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Run with `{placeholder}` substitutions applied, returning stdout.
    /// A non-zero exit is an [`UpdateError::InstallFailed`] carrying stderr.
    pub async fn run(&self, substitutions: &[(&str, &str)]) -> Result<String> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                let mut out = arg.clone();
                for (key, value) in substitutions {
                    out = out.replace(&format!("{{{}}}", key), value);
                }
                out
            })
            .collect();

        debug!("running {} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| UpdateError::InstallFailed(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UpdateError::InstallFailed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// The package manager seam: install a version, report the installed one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerConfig {
    pub install: CommandSpec,
    pub query_version: CommandSpec,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            install: CommandSpec::new("skiff-pkg", &["install", "skiff@{version}"]),
            query_version: CommandSpec::new("skiff", &["--version"]),
        }
    }
}

pub struct Installer {
    config: InstallerConfig,
}

impl Installer {
    pub fn new(config: InstallerConfig) -> Self {
        Self { config }
    }

    /// Drive the package manager to the requested version. Blocking from the
    /// caller's point of view; the subprocess runs to completion.
    pub async fn install(&self, version: &Version) -> Result<()> {
        self.config
            .install
            .run(&[("version", &version.to_string())])
            .await?;
        Ok(())
    }

    /// Ask the installation what version it is now. The last whitespace
    /// token of stdout is taken as the version string ("skiff 1.2.3" and
    /// bare "1.2.3" both parse).
    pub async fn installed_version(&self) -> Result<Version> {
        let stdout = self.config.query_version.run(&[]).await?;
        let token = stdout
            .split_whitespace()
            .last()
            .ok_or_else(|| UpdateError::InvalidVersionFormat(stdout.clone()))?;
        Version::parse(token)
    }
}
