//! Release source client.
//!
//! Talks to a GitHub-shaped releases REST API:
//! - GET {base}/releases/latest (404 means "no published releases")
//! - GET {base}/releases/tags/{tag}
//! - GET {base}/releases?per_page=N
//!
//! Successful fetches are cached in-process per query key with a fixed TTL.
//! The cache is never shared across processes.

use crate::error::{Result, UpdateError};
use crate::version::{UpdateType, Version};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a cached query stays fresh.
pub const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Per-request timeout, deliberately much shorter than the cache TTL.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default page size when scanning the full release list.
const LIST_LIMIT: usize = 100;

/// One downloadable artifact attached to a release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub download_url: String,
    pub size: Option<u64>,
}

/// A published release, built only from remote data and immutable after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub version: Version,
    pub tag: String,
    pub published_at: Option<DateTime<Utc>>,
    pub changelog: String,
    pub release_notes: String,
    pub download_url: String,
    pub assets: Vec<ReleaseAsset>,
    pub prerelease: bool,
    pub draft: bool,
}

/// Wire shape of the releases API.
#[derive(Debug, Deserialize)]
struct WireRelease {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    assets: Vec<WireAsset>,
}

#[derive(Debug, Deserialize)]
struct WireAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: Option<u64>,
}

impl WireRelease {
    fn into_release(self) -> Result<ReleaseInfo> {
        let version = Version::parse(&self.tag_name)?;
        Ok(ReleaseInfo {
            version,
            release_notes: self.name.unwrap_or_default(),
            changelog: self.body.unwrap_or_default(),
            download_url: self.html_url.unwrap_or_default(),
            published_at: self.published_at,
            prerelease: self.prerelease,
            draft: self.draft,
            assets: self
                .assets
                .into_iter()
                .map(|a| ReleaseAsset {
                    name: a.name,
                    download_url: a.browser_download_url,
                    size: a.size,
                })
                .collect(),
            tag: self.tag_name,
        })
    }
}

struct CacheEntry {
    fetched_at: Instant,
    releases: Vec<ReleaseInfo>,
}

/// Outcome of a best-effort update check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckOutcome {
    UpToDate,
    Available {
        latest: Version,
        update_type: UpdateType,
        release: ReleaseInfo,
    },
    /// The remote could not be consulted. Distinct from "no update" so
    /// interactive callers can tell the difference; unattended callers treat
    /// it the same via [`UpdateCheck::has_update`].
    Failed { reason: String },
}

/// Result of [`ReleaseClient::check_for_update`]. Never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCheck {
    pub checked_at: DateTime<Utc>,
    pub current: Version,
    pub outcome: CheckOutcome,
}

impl UpdateCheck {
    pub fn has_update(&self) -> bool {
        matches!(self.outcome, CheckOutcome::Available { .. })
    }

    /// Latest known version; falls back to the current one when the check
    /// found nothing newer or could not run.
    pub fn latest_version(&self) -> &Version {
        match &self.outcome {
            CheckOutcome::Available { latest, .. } => latest,
            _ => &self.current,
        }
    }

    pub fn update_type(&self) -> Option<UpdateType> {
        match &self.outcome {
            CheckOutcome::Available { update_type, .. } => Some(*update_type),
            _ => None,
        }
    }
}

/// Client for one release source.
pub struct ReleaseClient {
    http: reqwest::Client,
    base_url: String,
    cache: Mutex<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
}

impl ReleaseClient {
    /// `base_url` is the repository root of the API, e.g.
    /// `https://api.github.com/repos/skiff-sh/skiff`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(format!("skiff/{}", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: Mutex::new(HashMap::new()),
            cache_ttl: CACHE_TTL,
        }
    }

    /// GitHub convenience constructor.
    pub fn for_repo(owner: &str, repo: &str) -> Self {
        Self::new(format!("https://api.github.com/repos/{}/{}", owner, repo))
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    fn cached(&self, key: &str) -> Option<Vec<ReleaseInfo>> {
        let cache = self.cache.lock().ok()?;
        let entry = cache.get(key)?;
        if entry.fetched_at.elapsed() < self.cache_ttl {
            Some(entry.releases.clone())
        } else {
            None
        }
    }

    fn store(&self, key: &str, releases: Vec<ReleaseInfo>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                key.to_string(),
                CacheEntry {
                    fetched_at: Instant::now(),
                    releases,
                },
            );
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        self.http
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| UpdateError::ReleaseSourceUnavailable(e.to_string()))
    }

    /// Fetch the latest release. When `include_prerelease` is false and the
    /// remote's "latest" happens to be a prerelease, falls back to scanning
    /// the full list for the newest stable entry.
    pub async fn latest_release(&self, include_prerelease: bool) -> Result<ReleaseInfo> {
        let key = "latest";
        let latest = match self.cached(key) {
            Some(cached) => cached.into_iter().next(),
            None => {
                let resp = self.get("/releases/latest").await?;
                match resp.status() {
                    StatusCode::NOT_FOUND => {
                        return Err(UpdateError::ReleaseNotFound(
                            "remote reports no published releases".to_string(),
                        ))
                    }
                    status if !status.is_success() => {
                        return Err(UpdateError::ReleaseSourceUnavailable(format!(
                            "release API returned {}",
                            status
                        )))
                    }
                    _ => {}
                }
                let wire: WireRelease = resp
                    .json()
                    .await
                    .map_err(|e| UpdateError::ReleaseSourceUnavailable(e.to_string()))?;
                let release = wire.into_release()?;
                self.store(key, vec![release.clone()]);
                Some(release)
            }
        };

        match latest {
            Some(release) if include_prerelease || !release.prerelease => Ok(release),
            _ => {
                // "Latest" was filtered out; the full list decides.
                debug!("latest release is a prerelease, scanning list for stable");
                self.all_releases(LIST_LIMIT)
                    .await?
                    .into_iter()
                    .find(|r| !r.prerelease && !r.draft)
                    .ok_or_else(|| {
                        UpdateError::ReleaseNotFound("no stable release available".to_string())
                    })
            }
        }
    }

    /// All releases, newest first, up to `limit`.
    pub async fn all_releases(&self, limit: usize) -> Result<Vec<ReleaseInfo>> {
        let key = format!("all:{}", limit);
        if let Some(cached) = self.cached(&key) {
            return Ok(cached);
        }

        let resp = self.get(&format!("/releases?per_page={}", limit)).await?;
        if !resp.status().is_success() {
            return Err(UpdateError::ReleaseSourceUnavailable(format!(
                "release API returned {}",
                resp.status()
            )));
        }

        let wire: Vec<WireRelease> = resp
            .json()
            .await
            .map_err(|e| UpdateError::ReleaseSourceUnavailable(e.to_string()))?;

        let mut releases: Vec<ReleaseInfo> = wire
            .into_iter()
            .filter_map(|w| {
                let tag = w.tag_name.clone();
                match w.into_release() {
                    Ok(r) => Some(r),
                    Err(_) => {
                        warn!("skipping release with unparseable tag {:?}", tag);
                        None
                    }
                }
            })
            .collect();
        releases.sort_by(|a, b| b.version.cmp(&a.version));

        self.store(&key, releases.clone());
        Ok(releases)
    }

    /// Fetch a release by its exact tag. Missing tag is `ReleaseNotFound`.
    pub async fn release_by_tag(&self, tag: &str) -> Result<ReleaseInfo> {
        let key = format!("tag:{}", tag);
        if let Some(cached) = self.cached(&key) {
            if let Some(release) = cached.into_iter().next() {
                return Ok(release);
            }
        }

        let resp = self.get(&format!("/releases/tags/{}", tag)).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => return Err(UpdateError::ReleaseNotFound(tag.to_string())),
            status if !status.is_success() => {
                return Err(UpdateError::ReleaseSourceUnavailable(format!(
                    "release API returned {}",
                    status
                )))
            }
            _ => {}
        }

        let wire: WireRelease = resp
            .json()
            .await
            .map_err(|e| UpdateError::ReleaseSourceUnavailable(e.to_string()))?;
        let release = wire.into_release()?;
        self.store(&key, vec![release.clone()]);
        Ok(release)
    }

    /// Fetch a release by version, trying the `v`-prefixed tag first.
    /// Same contract as [`release_by_tag`]: missing is `ReleaseNotFound`.
    pub async fn release_by_version(&self, version: &Version) -> Result<ReleaseInfo> {
        match self.release_by_tag(&version.format(true)).await {
            Err(UpdateError::ReleaseNotFound(_)) => {
                self.release_by_tag(&version.to_string()).await
            }
            other => other,
        }
    }

    /// Releases strictly newer than `from` and at most `to`, newest first.
    pub async fn releases_between(&self, from: &Version, to: &Version) -> Result<Vec<ReleaseInfo>> {
        let mut releases: Vec<ReleaseInfo> = self
            .all_releases(LIST_LIMIT)
            .await?
            .into_iter()
            .filter(|r| r.version.is_newer_than(from) && !r.version.is_newer_than(to))
            .collect();
        releases.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(releases)
    }

    /// Best-effort update check. Converts every failure into
    /// [`CheckOutcome::Failed`] so unattended callers are never crashed or
    /// blocked by a flaky remote.
    pub async fn check_for_update(&self, current: &Version, include_prerelease: bool) -> UpdateCheck {
        let checked_at = Utc::now();
        let outcome = match self.latest_release(include_prerelease).await {
            Ok(release) if release.version.is_newer_than(current) => CheckOutcome::Available {
                latest: release.version.clone(),
                update_type: UpdateType::classify(current, &release.version),
                release,
            },
            Ok(_) => CheckOutcome::UpToDate,
            Err(e) => {
                warn!("update check failed, treating as no update: {}", e);
                CheckOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        UpdateCheck {
            checked_at,
            current: current.clone(),
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(tag: &str, prerelease: bool, draft: bool) -> ReleaseInfo {
        ReleaseInfo {
            version: Version::parse(tag).unwrap(),
            tag: tag.to_string(),
            published_at: None,
            changelog: String::new(),
            release_notes: String::new(),
            download_url: String::new(),
            assets: Vec::new(),
            prerelease,
            draft,
        }
    }

    #[test]
    fn wire_release_parses_github_payload() {
        let json = serde_json::json!({
            "tag_name": "v5.1.0",
            "name": "Skiff 5.1.0",
            "body": "## Features\n- faster sync",
            "prerelease": false,
            "draft": false,
            "published_at": "2026-05-01T12:00:00Z",
            "html_url": "https://example.com/releases/v5.1.0",
            "assets": [
                {"name": "skiff-5.1.0.tar.gz", "browser_download_url": "https://example.com/a", "size": 1024}
            ]
        });
        let wire: WireRelease = serde_json::from_value(json).unwrap();
        let release = wire.into_release().unwrap();
        assert_eq!(release.version, Version::parse("5.1.0").unwrap());
        assert_eq!(release.tag, "v5.1.0");
        assert_eq!(release.assets.len(), 1);
        assert!(release.changelog.contains("faster sync"));
        assert!(release.published_at.is_some());
    }

    #[test]
    fn wire_release_tolerates_missing_optionals() {
        let wire: WireRelease = serde_json::from_str(r#"{"tag_name": "1.0.0"}"#).unwrap();
        let release = wire.into_release().unwrap();
        assert!(release.changelog.is_empty());
        assert!(release.assets.is_empty());
        assert!(!release.prerelease);
    }

    #[test]
    fn cache_store_and_expiry() {
        let client = ReleaseClient::new("http://localhost:0");
        client.store("latest", vec![release("1.0.0", false, false)]);
        assert!(client.cached("latest").is_some());
        assert!(client.cached("other").is_none());

        let client = ReleaseClient::new("http://localhost:0").with_cache_ttl(Duration::ZERO);
        client.store("latest", vec![release("1.0.0", false, false)]);
        assert!(client.cached("latest").is_none());
    }

    #[test]
    fn update_check_accessors() {
        let current = Version::parse("5.0.0").unwrap();
        let latest = Version::parse("5.1.0").unwrap();
        let check = UpdateCheck {
            checked_at: Utc::now(),
            current: current.clone(),
            outcome: CheckOutcome::Available {
                latest: latest.clone(),
                update_type: UpdateType::Minor,
                release: release("5.1.0", false, false),
            },
        };
        assert!(check.has_update());
        assert_eq!(check.latest_version(), &latest);
        assert_eq!(check.update_type(), Some(UpdateType::Minor));

        let failed = UpdateCheck {
            checked_at: Utc::now(),
            current: current.clone(),
            outcome: CheckOutcome::Failed {
                reason: "boom".to_string(),
            },
        };
        assert!(!failed.has_update());
        assert_eq!(failed.latest_version(), &current);
        assert_eq!(failed.update_type(), None);
    }
}
