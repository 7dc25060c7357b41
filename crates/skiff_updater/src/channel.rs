//! Subscription channels.
//!
//! A channel controls which releases an installation is exposed to. Built-in
//! channels cover the usual tiers; custom channels point at an alternate
//! release source. The current channel and subscription set persist to
//! `channels.json`.

use crate::error::{Result, UpdateError};
use crate::paths::StateDir;
use crate::release::{ReleaseClient, ReleaseInfo};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub description: String,
    pub include_prereleases: bool,
    #[serde(default)]
    pub custom_url: Option<String>,
    /// Suggested check interval in seconds, advisory only.
    #[serde(default)]
    pub update_frequency: Option<u64>,
}

/// The fixed registry every installation starts with.
pub fn builtin_channels() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig {
            name: "stable".to_string(),
            description: "Production releases only".to_string(),
            include_prereleases: false,
            custom_url: None,
            update_frequency: Some(86400),
        },
        ChannelConfig {
            name: "beta".to_string(),
            description: "Beta prereleases plus everything in stable".to_string(),
            include_prereleases: true,
            custom_url: None,
            update_frequency: Some(43200),
        },
        ChannelConfig {
            name: "alpha".to_string(),
            description: "Early prereleases, may be unstable".to_string(),
            include_prereleases: true,
            custom_url: None,
            update_frequency: Some(21600),
        },
        ChannelConfig {
            name: "nightly".to_string(),
            description: "Every published build, no stability promises".to_string(),
            include_prereleases: true,
            custom_url: None,
            update_frequency: Some(3600),
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelState {
    pub current: String,
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub custom: Vec<ChannelConfig>,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            current: "stable".to_string(),
            subscriptions: vec!["stable".to_string()],
            custom: Vec::new(),
        }
    }
}

impl ChannelState {
    fn load(path: &PathBuf) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Filter a release list down to what a channel exposes, newest first.
pub fn filter_for_channel(mut releases: Vec<ReleaseInfo>, channel: &ChannelConfig) -> Vec<ReleaseInfo> {
    releases.retain(|r| !r.draft && (channel.include_prereleases || !r.prerelease));
    releases.sort_by(|a, b| b.version.cmp(&a.version));
    releases
}

pub struct ChannelManager {
    state_path: PathBuf,
    state: ChannelState,
    releases: Arc<ReleaseClient>,
}

impl ChannelManager {
    pub fn new(state_dir: &StateDir, releases: Arc<ReleaseClient>) -> Self {
        let state_path = state_dir.channels_file();
        let state = ChannelState::load(&state_path);
        Self {
            state_path,
            state,
            releases,
        }
    }

    pub fn current_channel(&self) -> &str {
        &self.state.current
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.state.subscriptions
    }

    pub fn available_channels(&self) -> Vec<ChannelConfig> {
        let mut channels = builtin_channels();
        channels.extend(self.state.custom.iter().cloned());
        channels
    }

    pub fn channel_info(&self, name: &str) -> Option<ChannelConfig> {
        self.available_channels().into_iter().find(|c| c.name == name)
    }

    pub fn switch_channel(&mut self, name: &str) -> Result<()> {
        if self.channel_info(name).is_none() {
            return Err(UpdateError::UnknownChannel(name.to_string()));
        }
        info!("switching channel {} -> {}", self.state.current, name);
        self.state.current = name.to_string();
        if !self.state.subscriptions.iter().any(|s| s == name) {
            self.state.subscriptions.push(name.to_string());
        }
        self.state.save(&self.state_path)
    }

    pub fn add_custom_channel(&mut self, config: ChannelConfig) -> Result<()> {
        if self.channel_info(&config.name).is_some() {
            return Err(UpdateError::InvalidChannelOperation(format!(
                "channel {} already exists",
                config.name
            )));
        }
        self.state.custom.push(config);
        self.state.save(&self.state_path)
    }

    pub fn remove_custom_channel(&mut self, name: &str) -> Result<()> {
        if builtin_channels().iter().any(|c| c.name == name) {
            return Err(UpdateError::InvalidChannelOperation(format!(
                "cannot remove built-in channel {}",
                name
            )));
        }
        let before = self.state.custom.len();
        self.state.custom.retain(|c| c.name != name);
        if self.state.custom.len() == before {
            return Err(UpdateError::UnknownChannel(name.to_string()));
        }
        if self.state.current == name {
            self.state.current = "stable".to_string();
        }
        self.state.subscriptions.retain(|s| s != name);
        self.state.save(&self.state_path)
    }

    pub fn subscribe(&mut self, name: &str) -> Result<()> {
        if self.channel_info(name).is_none() {
            return Err(UpdateError::UnknownChannel(name.to_string()));
        }
        if !self.state.subscriptions.iter().any(|s| s == name) {
            self.state.subscriptions.push(name.to_string());
            self.state.save(&self.state_path)?;
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, name: &str) -> Result<()> {
        let before = self.state.subscriptions.len();
        self.state.subscriptions.retain(|s| s != name);
        if self.state.subscriptions.len() == before {
            return Err(UpdateError::UnknownChannel(name.to_string()));
        }
        self.state.save(&self.state_path)
    }

    /// Releases exposed by a channel, newest first. A custom channel's
    /// alternate source is consulted instead of the default one.
    pub async fn versions_for_channel(&self, name: &str) -> Result<Vec<ReleaseInfo>> {
        let channel = self
            .channel_info(name)
            .ok_or_else(|| UpdateError::UnknownChannel(name.to_string()))?;

        let custom;
        let client: &ReleaseClient = match channel.custom_url {
            Some(ref url) => {
                custom = ReleaseClient::new(url.clone());
                &custom
            }
            None => self.releases.as_ref(),
        };

        let releases = client.all_releases(100).await?;
        Ok(filter_for_channel(releases, &channel))
    }

    pub async fn latest_version_for_channel(&self, name: &str) -> Result<Option<ReleaseInfo>> {
        Ok(self.versions_for_channel(name).await?.into_iter().next())
    }
}
