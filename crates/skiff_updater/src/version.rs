//! Version parsing and ordering.
//!
//! Versions follow `major.minor.patch[-prerelease][+build]` with an optional
//! leading `v`. Ordering is numeric on the release triple; a version without
//! a prerelease outranks the same triple with one. Build metadata never
//! participates in ordering.

use crate::error::{Result, UpdateError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d+)\.(\d+)\.(\d+)(?:-([0-9A-Za-z.-]+))?(?:\+([0-9A-Za-z.-]+))?$")
            .expect("version regex is valid")
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
    pub build: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
            build: None,
        }
    }

    /// Parse a version string, tolerating one leading `v`.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);

        let caps = version_re()
            .captures(bare)
            .ok_or_else(|| UpdateError::InvalidVersionFormat(input.to_string()))?;

        // The regex guarantees the numeric groups, but an absurdly long digit
        // run can still overflow u64.
        let part = |i: usize| -> Result<u64> {
            caps.get(i)
                .map(|m| m.as_str())
                .unwrap_or("0")
                .parse()
                .map_err(|_| UpdateError::InvalidVersionFormat(input.to_string()))
        };

        Ok(Self {
            major: part(1)?,
            minor: part(2)?,
            patch: part(3)?,
            prerelease: caps.get(4).map(|m| m.as_str().to_string()),
            build: caps.get(5).map(|m| m.as_str().to_string()),
        })
    }

    /// Render the canonical string, optionally with a leading `v`.
    pub fn format(&self, leading_v: bool) -> String {
        if leading_v {
            format!("v{}", self)
        } else {
            self.to_string()
        }
    }

    pub fn is_newer_than(&self, other: &Version) -> bool {
        self.cmp(other) == Ordering::Greater
    }

    pub fn is_older_than(&self, other: &Version) -> bool {
        self.cmp(other) == Ordering::Less
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref pre) = self.prerelease {
            write!(f, "-{}", pre)?;
        }
        if let Some(ref build) = self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                // A release outranks its own prerelease.
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                // Plain lexical ordering, not per-segment semver precedence:
                // "beta.10" sorts before "beta.2".
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Equality tracks ordering, so build metadata is ignored.
impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

/// Class of step between two versions, by first differing component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Major,
    Minor,
    Patch,
    None,
}

impl UpdateType {
    pub fn classify(old: &Version, new: &Version) -> Self {
        if old.major != new.major {
            UpdateType::Major
        } else if old.minor != new.minor {
            UpdateType::Minor
        } else if old.patch != new.patch {
            UpdateType::Patch
        } else {
            UpdateType::None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Major => "major",
            UpdateType::Minor => "minor",
            UpdateType::Patch => "patch",
            UpdateType::None => "none",
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
