//! Changelog classification between two versions.
//!
//! Parses the target release's changelog line by line. Section headers
//! ("Breaking Changes", "Features", ...) switch the active bucket; bullet
//! lines land in it unless a conventional `type(scope): subject` prefix
//! overrides the bucket for that single line.

use crate::error::Result;
use crate::release::ReleaseClient;
use crate::version::{UpdateType, Version};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};

/// How many items per bucket the human summary shows.
const SUMMARY_CAP: usize = 5;

fn section_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*#{0,6}\s*(breaking changes?|features?|bug ?fixes?|deprecations?|security|performance|documentation)\s*:?\s*$",
        )
        .expect("section regex is valid")
    })
}

fn bullet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*[-*•]\s+(.+)$").expect("bullet regex is valid"))
}

fn prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(feat|fix|perf|docs|security|breaking)(?:\([^)]*\))?(!)?:\s*(.+)$")
            .expect("prefix regex is valid")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Breaking,
    Features,
    BugFixes,
    Deprecations,
    Security,
    Performance,
    Documentation,
    Other,
}

impl Bucket {
    fn from_section(header: &str) -> Self {
        let h = header.to_ascii_lowercase();
        if h.starts_with("breaking") {
            Bucket::Breaking
        } else if h.starts_with("feature") {
            Bucket::Features
        } else if h.starts_with("bug") {
            Bucket::BugFixes
        } else if h.starts_with("deprecation") {
            Bucket::Deprecations
        } else if h.starts_with("security") {
            Bucket::Security
        } else if h.starts_with("performance") {
            Bucket::Performance
        } else {
            Bucket::Documentation
        }
    }

    fn from_prefix(prefix: &str, bang: bool) -> Self {
        if bang {
            return Bucket::Breaking;
        }
        match prefix.to_ascii_lowercase().as_str() {
            "feat" => Bucket::Features,
            "fix" => Bucket::BugFixes,
            "perf" => Bucket::Performance,
            "docs" => Bucket::Documentation,
            "security" => Bucket::Security,
            "breaking" => Bucket::Breaking,
            _ => Bucket::Other,
        }
    }
}

/// Derived change summary between two versions. Recomputed on demand,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionDiff {
    pub from_version: Version,
    pub to_version: Version,
    pub update_type: UpdateType,
    pub breaking_changes: Vec<String>,
    pub new_features: Vec<String>,
    pub bug_fixes: Vec<String>,
    pub deprecations: Vec<String>,
    pub security_fixes: Vec<String>,
    pub performance_improvements: Vec<String>,
    pub documentation: Vec<String>,
    pub other: Vec<String>,
    pub full_changelog: String,
    pub release_notes: String,
}

/// Recommendation derived from a diff's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Required,
    Recommended,
    Optional,
}

impl VersionDiff {
    fn empty(from: &Version, to: &Version) -> Self {
        Self {
            from_version: from.clone(),
            to_version: to.clone(),
            update_type: UpdateType::classify(from, to),
            breaking_changes: Vec::new(),
            new_features: Vec::new(),
            bug_fixes: Vec::new(),
            deprecations: Vec::new(),
            security_fixes: Vec::new(),
            performance_improvements: Vec::new(),
            documentation: Vec::new(),
            other: Vec::new(),
            full_changelog: String::new(),
            release_notes: String::new(),
        }
    }

    fn bucket_mut(&mut self, bucket: Bucket) -> &mut Vec<String> {
        match bucket {
            Bucket::Breaking => &mut self.breaking_changes,
            Bucket::Features => &mut self.new_features,
            Bucket::BugFixes => &mut self.bug_fixes,
            Bucket::Deprecations => &mut self.deprecations,
            Bucket::Security => &mut self.security_fixes,
            Bucket::Performance => &mut self.performance_improvements,
            Bucket::Documentation => &mut self.documentation,
            Bucket::Other => &mut self.other,
        }
    }

    /// Feed one changelog body through the line classifier.
    fn classify(&mut self, changelog: &str) {
        let mut active = Bucket::Other;
        for line in changelog.lines() {
            if let Some(caps) = section_re().captures(line) {
                active = Bucket::from_section(caps.get(1).map(|m| m.as_str()).unwrap_or(""));
                continue;
            }
            let Some(caps) = bullet_re().captures(line) else {
                continue;
            };
            let content = caps.get(1).map(|m| m.as_str()).unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }
            // A conventional prefix beats the section context for this line.
            let bucket = match prefix_re().captures(content) {
                Some(pc) => Bucket::from_prefix(
                    pc.get(1).map(|m| m.as_str()).unwrap_or(""),
                    pc.get(2).is_some(),
                ),
                None => active,
            };
            self.bucket_mut(bucket).push(content.to_string());
        }
    }

    pub fn requires_user_action(&self) -> bool {
        !self.breaking_changes.is_empty() || !self.deprecations.is_empty()
    }

    pub fn has_security_fixes(&self) -> bool {
        !self.security_fixes.is_empty()
    }

    pub fn recommended_action(&self) -> RecommendedAction {
        if self.has_security_fixes() {
            RecommendedAction::Required
        } else if !self.breaking_changes.is_empty() || self.update_type == UpdateType::Major {
            RecommendedAction::Recommended
        } else {
            RecommendedAction::Optional
        }
    }

    /// Capped human summary, first five items per bucket.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Update {} -> {} ({})\n",
            self.from_version, self.to_version, self.update_type
        );

        let sections: [(&str, &Vec<String>); 8] = [
            ("Breaking changes", &self.breaking_changes),
            ("New features", &self.new_features),
            ("Bug fixes", &self.bug_fixes),
            ("Deprecations", &self.deprecations),
            ("Security fixes", &self.security_fixes),
            ("Performance", &self.performance_improvements),
            ("Documentation", &self.documentation),
            ("Other", &self.other),
        ];

        for (title, items) in sections {
            if items.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n{}:", title);
            for item in items.iter().take(SUMMARY_CAP) {
                let _ = writeln!(out, "  - {}", item);
            }
            if items.len() > SUMMARY_CAP {
                let _ = writeln!(out, "  ...and {} more", items.len() - SUMMARY_CAP);
            }
        }

        out
    }
}

/// Produces [`VersionDiff`]s from release changelogs.
pub struct DiffGenerator {
    releases: Arc<ReleaseClient>,
}

impl DiffGenerator {
    pub fn new(releases: Arc<ReleaseClient>) -> Self {
        Self { releases }
    }

    /// Classify the changes introduced by `to` relative to `from`.
    pub async fn generate_diff(&self, from: &Version, to: &Version) -> Result<VersionDiff> {
        // Both ends must exist upstream; a typo'd target should fail loudly.
        let _ = self.releases.release_by_version(from).await?;
        let target = self.releases.release_by_version(to).await?;

        let mut diff = VersionDiff::empty(from, to);
        diff.full_changelog = target.changelog.clone();
        diff.release_notes = target.release_notes.clone();
        diff.classify(&target.changelog);
        Ok(diff)
    }

    /// Aggregate the changes of every release after `current` up to and
    /// including `target`, newest first.
    pub async fn generate_cumulative_diff(
        &self,
        current: &Version,
        target: &Version,
    ) -> Result<VersionDiff> {
        let between = self.releases.releases_between(current, target).await?;
        if between.is_empty() {
            return self.generate_diff(current, target).await;
        }

        let mut diff = VersionDiff::empty(current, target);
        let mut combined = String::new();
        for release in &between {
            diff.classify(&release.changelog);
            let _ = writeln!(combined, "## {}\n\n{}\n", release.tag, release.changelog);
        }
        diff.full_changelog = combined;
        diff.release_notes = between
            .first()
            .map(|r| r.release_notes.clone())
            .unwrap_or_default();
        Ok(diff)
    }
}
