//! Package references and version constraints.
//!
//! A reference names a package the way recipes write it:
//!
//! ```text
//! glad/0.1.34
//! glad/0.1.29@bincrafters/stable
//! cmake_installer/[>=3.16]@conan/stable
//! math/local#3f2a9c
//! ```
//!
//! The version part is either an exact token (`0.1.34`, `local`) or a
//! bracketed semver range.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur when parsing references.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("invalid reference '{reference}': {reason}")]
    Invalid { reference: String, reason: String },

    #[error("invalid version range '{range}' for package '{package}': {reason}")]
    InvalidRange {
        package: String,
        range: String,
        reason: String,
    },
}

/// The `@user/channel` part of a reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel {
    pub user: String,
    pub channel: String,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.channel)
    }
}

/// A concrete package version as a node of the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageIdentity {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl PackageIdentity {
    /// Create an identity without channel or revision.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            channel: None,
            revision: None,
        }
    }

    /// Attach a channel.
    #[must_use]
    pub fn with_channel(mut self, channel: Option<Channel>) -> Self {
        self.channel = channel;
        self
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)?;
        if let Some(ref channel) = self.channel {
            write!(f, "@{channel}")?;
        }
        if let Some(ref revision) = self.revision {
            write!(f, "#{revision}")?;
        }
        Ok(())
    }
}

/// The version part of a requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// An exact version token. Not necessarily semver (`local`, `3.3`).
    Exact(String),
    /// A semver range, written `[...]` in references.
    Range(VersionReq),
}

impl VersionConstraint {
    /// Returns true if a concrete version satisfies this constraint.
    #[must_use]
    pub fn matches(&self, version: &str) -> bool {
        match self {
            Self::Exact(token) => {
                token == version
                    || matches!(
                        (lenient_version(token), lenient_version(version)),
                        (Some(a), Some(b)) if a == b
                    )
            }
            Self::Range(req) => lenient_version(version).is_some_and(|v| req.matches(&v)),
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(token) => f.write_str(token),
            Self::Range(req) => write!(f, "[{req}]"),
        }
    }
}

/// A parsed requirement reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    pub constraint: VersionConstraint,
    pub channel: Option<Channel>,
    pub revision: Option<String>,
}

impl Reference {
    /// Parse a reference string.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, the version part is missing,
    /// the channel is malformed or a range does not parse.
    pub fn parse(text: &str) -> Result<Self, ReferenceError> {
        let invalid = |reason: &str| ReferenceError::Invalid {
            reference: text.to_string(),
            reason: reason.to_string(),
        };

        let text = text.trim();
        let (rest, revision) = match text.split_once('#') {
            Some((_, "")) => return Err(invalid("revision after '#' cannot be empty")),
            Some((rest, rev)) => (rest, Some(rev.to_string())),
            None => (text, None),
        };

        // The range may itself contain no '@', so split on the last one
        let (rest, channel) = match rest.rsplit_once('@') {
            Some((rest, channel)) => {
                let (user, channel) = channel
                    .split_once('/')
                    .ok_or_else(|| invalid("channel must be written '@user/channel'"))?;
                if user.is_empty() || channel.is_empty() {
                    return Err(invalid("channel user and name cannot be empty"));
                }
                (
                    rest,
                    Some(Channel {
                        user: user.to_string(),
                        channel: channel.to_string(),
                    }),
                )
            }
            None => (rest, None),
        };

        let (name, version) = rest
            .split_once('/')
            .ok_or_else(|| invalid("expected 'name/version'"))?;
        validate_package_name(name).map_err(|reason| invalid(reason))?;
        if version.is_empty() {
            return Err(invalid("version cannot be empty"));
        }

        let constraint = if let Some(range) = version.strip_prefix('[') {
            let range = range
                .strip_suffix(']')
                .ok_or_else(|| invalid("version range must end with ']'"))?;
            VersionConstraint::Range(parse_range(name, range)?)
        } else {
            if version.contains(['[', ']', ' ']) {
                return Err(invalid("malformed version"));
            }
            VersionConstraint::Exact(version.to_string())
        };

        Ok(Self {
            name: name.to_string(),
            constraint,
            channel,
            revision,
        })
    }

    /// Returns true if the identity fulfils this reference: same name, a
    /// matching version and a matching channel when one was requested.
    #[must_use]
    pub fn is_satisfied_by(&self, identity: &PackageIdentity) -> bool {
        identity.name == self.name
            && self.constraint.matches(&identity.version)
            && (self.channel.is_none() || self.channel == identity.channel)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.constraint)?;
        if let Some(ref channel) = self.channel {
            write!(f, "@{channel}")?;
        }
        if let Some(ref revision) = self.revision {
            write!(f, "#{revision}")?;
        }
        Ok(())
    }
}

/// Validate a package name.
pub(crate) fn validate_package_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }

    if name.len() > 64 {
        return Err("name cannot exceed 64 characters");
    }

    if !name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err("name must start with a letter, digit or underscore");
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
    {
        return Err("name can only contain letters, numbers, '-', '_', '.' and '+'");
    }

    Ok(())
}

/// Parse a range body. Whitespace-separated comparators are accepted as well
/// as the comma-separated semver form, and bare versions mean caret.
fn parse_range(package: &str, range: &str) -> Result<VersionReq, ReferenceError> {
    let mut comparators: Vec<String> = Vec::new();
    for part in range.split(',') {
        let mut pending_op: Option<&str> = None;
        for token in part.split_whitespace() {
            if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '^' | '~')) {
                pending_op = Some(token);
                continue;
            }
            let token = match pending_op.take() {
                Some(op) => format!("{op}{token}"),
                None => token.to_string(),
            };
            comparators.push(token);
        }
    }

    if comparators.is_empty() {
        return Err(ReferenceError::InvalidRange {
            package: package.to_string(),
            range: range.to_string(),
            reason: "empty range".to_string(),
        });
    }

    let normalized = comparators
        .iter()
        .map(|c| {
            if c.starts_with(|ch: char| ch.is_ascii_digit()) {
                format!("^{c}")
            } else {
                c.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    VersionReq::parse(&normalized).map_err(|e| ReferenceError::InvalidRange {
        package: package.to_string(),
        range: range.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a version leniently: `3.3` is read as `3.3.0`, `1` as `1.0.0`.
/// Returns `None` for non-numeric versions such as `local`.
#[must_use]
pub fn lenient_version(text: &str) -> Option<Version> {
    if let Ok(version) = Version::parse(text) {
        return Some(version);
    }

    let split = text.find(['-', '+']).unwrap_or(text.len());
    let (core, suffix) = text.split_at(split);
    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty()
        || parts.len() > 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }

    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(suffix);
    Version::parse(&padded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_exact_reference() {
        let r = Reference::parse("glad/0.1.34").unwrap();
        assert_eq!(r.name, "glad");
        assert_eq!(r.constraint, VersionConstraint::Exact("0.1.34".to_string()));
        assert!(r.channel.is_none());
    }

    #[test]
    fn parse_reference_with_channel() {
        let r = Reference::parse("glad/0.1.29@bincrafters/stable").unwrap();
        let channel = r.channel.unwrap();
        assert_eq!(channel.user, "bincrafters");
        assert_eq!(channel.channel, "stable");
    }

    #[test]
    fn parse_range_reference() {
        let r = Reference::parse("cmake_installer/[>=3.16]@conan/stable").unwrap();
        assert!(r.constraint.matches("3.16.2"));
        assert!(r.constraint.matches("3.20"));
        assert!(!r.constraint.matches("3.15.0"));
        assert!(matches!(r.constraint, VersionConstraint::Range(_)));
    }

    #[test]
    fn parse_space_separated_range() {
        let r = Reference::parse("boost/[>=1.70 <1.80]").unwrap();
        assert!(r.constraint.matches("1.71.0"));
        assert!(!r.constraint.matches("1.80.0"));

        let r = Reference::parse("boost/[>= 1.70, < 1.80]").unwrap();
        assert!(r.constraint.matches("1.75"));
    }

    #[test]
    fn bare_range_version_is_caret() {
        let r = Reference::parse("glfw/[3.3]").unwrap();
        assert!(r.constraint.matches("3.4.0"));
        assert!(!r.constraint.matches("4.0.0"));
    }

    #[test]
    fn parse_non_semver_exact() {
        let r = Reference::parse("math/local").unwrap();
        assert!(r.constraint.matches("local"));
        assert!(!r.constraint.matches("1.0.0"));
    }

    #[test]
    fn exact_matches_padded_versions() {
        let r = Reference::parse("glfw/3.3").unwrap();
        assert!(r.constraint.matches("3.3"));
        assert!(r.constraint.matches("3.3.0"));
        assert!(!r.constraint.matches("3.3.1"));
    }

    #[test]
    fn parse_revision() {
        let r = Reference::parse("math/local#abc123").unwrap();
        assert_eq!(r.revision.as_deref(), Some("abc123"));
        assert_eq!(r.to_string(), "math/local#abc123");
    }

    #[test]
    fn reject_malformed_references() {
        assert!(Reference::parse("glad").is_err());
        assert!(Reference::parse("glad/").is_err());
        assert!(Reference::parse("/1.0").is_err());
        assert!(Reference::parse("glad/1.0@bincrafters").is_err());
        assert!(Reference::parse("glad/[>=1.0").is_err());
        assert!(Reference::parse("glad/[]").is_err());
        assert!(Reference::parse("gl ad/1.0").is_err());
        assert!(Reference::parse("glad/1.0#").is_err());
    }

    #[test]
    fn name_may_start_with_digit() {
        let r = Reference::parse("2d/0.1.0").unwrap();
        assert_eq!(r.name, "2d");
    }

    #[test]
    fn satisfied_by_checks_channel() {
        let r = Reference::parse("glad/0.1.29@bincrafters/stable").unwrap();
        let plain = PackageIdentity::new("glad", "0.1.29");
        let channelled = plain.clone().with_channel(r.channel.clone());
        assert!(!r.is_satisfied_by(&plain));
        assert!(r.is_satisfied_by(&channelled));
    }

    #[test]
    fn lenient_versions() {
        assert_eq!(lenient_version("3.3"), Version::parse("3.3.0").ok());
        assert_eq!(lenient_version("1"), Version::parse("1.0.0").ok());
        assert_eq!(lenient_version("1.2-rc1"), Version::parse("1.2.0-rc1").ok());
        assert_eq!(lenient_version("local"), None);
        assert_eq!(lenient_version("1.2.3.4"), None);
    }

    #[test]
    fn identity_display() {
        let identity = PackageIdentity::new("glad", "0.1.29").with_channel(Some(Channel {
            user: "bincrafters".to_string(),
            channel: "stable".to_string(),
        }));
        assert_eq!(identity.to_string(), "glad/0.1.29@bincrafters/stable");
    }
}
