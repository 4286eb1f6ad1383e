//! Ambient build settings.
//!
//! Settings are facts about the build supplied by the caller (target OS,
//! compiler, build type, architecture). A recipe can read them and branch on
//! them, but never changes them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when building a settings set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unknown settings axis '{0}', expected one of: os, compiler, build_type, arch")]
    UnknownAxis(String),

    #[error("invalid value '{value}' for setting '{axis}', expected one of: {}", .expected.join(", "))]
    InvalidValue {
        axis: SettingsAxis,
        value: String,
        expected: Vec<&'static str>,
    },

    #[error("malformed setting '{0}', expected axis=value")]
    Malformed(String),
}

/// One axis of the build settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SettingsAxis {
    /// Target operating system.
    Os,
    /// Compiler family. Open domain.
    Compiler,
    /// CMake-style build type.
    BuildType,
    /// Target architecture.
    Arch,
}

const OS_VALUES: &[&str] = &["Linux", "Windows", "Macos", "FreeBSD", "Android", "iOS"];
const BUILD_TYPE_VALUES: &[&str] = &["Debug", "Release", "RelWithDebInfo", "MinSizeRel"];
const ARCH_VALUES: &[&str] = &["x86", "x86_64", "armv7", "armv8", "wasm"];

impl SettingsAxis {
    /// Every known axis, in canonical order.
    pub const ALL: [Self; 4] = [Self::Os, Self::Compiler, Self::BuildType, Self::Arch];

    /// Returns the axis name as written in manifests and profiles.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Os => "os",
            Self::Compiler => "compiler",
            Self::BuildType => "build_type",
            Self::Arch => "arch",
        }
    }

    /// The closed value domain of this axis, or `None` if any value is accepted.
    #[must_use]
    pub fn domain(self) -> Option<&'static [&'static str]> {
        match self {
            Self::Os => Some(OS_VALUES),
            Self::BuildType => Some(BUILD_TYPE_VALUES),
            Self::Arch => Some(ARCH_VALUES),
            Self::Compiler => None,
        }
    }

    /// Validate a value against this axis and return its canonical spelling.
    ///
    /// Closed domains match case-insensitively, so `linux` becomes `Linux`.
    pub fn normalize(self, value: &str) -> Result<String, SettingsError> {
        let value = value.trim();
        match self.domain() {
            Some(domain) => domain
                .iter()
                .find(|candidate| candidate.eq_ignore_ascii_case(value))
                .map(|candidate| (*candidate).to_string())
                .ok_or_else(|| SettingsError::InvalidValue {
                    axis: self,
                    value: value.to_string(),
                    expected: domain.to_vec(),
                }),
            None if value.is_empty() => Err(SettingsError::InvalidValue {
                axis: self,
                value: String::new(),
                expected: Vec::new(),
            }),
            None => Ok(value.to_string()),
        }
    }
}

impl fmt::Display for SettingsAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingsAxis {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|axis| axis.as_str() == s)
            .ok_or_else(|| SettingsError::UnknownAxis(s.to_string()))
    }
}

/// A validated set of settings values for one build invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, String>",
    into = "BTreeMap<String, String>"
)]
pub struct Settings {
    values: BTreeMap<SettingsAxis, String>,
}

impl Settings {
    /// Create an empty settings set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style variant of [`Settings::set`].
    pub fn with(mut self, axis: SettingsAxis, value: &str) -> Result<Self, SettingsError> {
        self.set(axis, value)?;
        Ok(self)
    }

    /// Set one axis, validating and normalizing the value.
    pub fn set(&mut self, axis: SettingsAxis, value: &str) -> Result<(), SettingsError> {
        let value = axis.normalize(value)?;
        self.values.insert(axis, value);
        Ok(())
    }

    /// Apply an `axis=value` assignment, as given on the command line.
    pub fn apply_assignment(&mut self, assignment: &str) -> Result<(), SettingsError> {
        let (axis, value) = assignment
            .split_once('=')
            .ok_or_else(|| SettingsError::Malformed(assignment.to_string()))?;
        self.set(axis.trim().parse()?, value)
    }

    /// Get the value of an axis, if set.
    #[must_use]
    pub fn get(&self, axis: SettingsAxis) -> Option<&str> {
        self.values.get(&axis).map(String::as_str)
    }

    /// Returns true if no axis is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over the set axes in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (SettingsAxis, &str)> {
        self.values.iter().map(|(axis, value)| (*axis, value.as_str()))
    }

    /// Only the given axes. A package's configuration depends on the axes
    /// its recipe declares and nothing else.
    #[must_use]
    pub fn restricted_to(&self, axes: &[SettingsAxis]) -> Settings {
        let values = self
            .values
            .iter()
            .filter(|(axis, _)| axes.contains(axis))
            .map(|(axis, value)| (*axis, value.clone()))
            .collect();
        Settings { values }
    }

    /// Overlay another settings set on top of this one.
    #[must_use]
    pub fn merged_with(&self, other: &Settings) -> Settings {
        let mut values = self.values.clone();
        values.extend(other.values.iter().map(|(k, v)| (*k, v.clone())));
        Settings { values }
    }
}

impl TryFrom<BTreeMap<String, String>> for Settings {
    type Error = SettingsError;

    fn try_from(raw: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        let mut settings = Settings::new();
        for (axis, value) in raw {
            settings.set(axis.parse()?, &value)?;
        }
        Ok(settings)
    }
}

impl From<Settings> for BTreeMap<String, String> {
    fn from(settings: Settings) -> Self {
        settings
            .values
            .into_iter()
            .map(|(axis, value)| (axis.as_str().to_string(), value))
            .collect()
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .iter()
            .map(|(axis, value)| format!("{axis}={value}"))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

/// A conjunction of settings equalities, used to gate conditional defaults
/// and imports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Condition {
    required: BTreeMap<SettingsAxis, String>,
}

impl Condition {
    /// A condition that always holds.
    #[must_use]
    pub fn always() -> Self {
        Self::default()
    }

    /// Require an axis to hold a value. The value must already be normalized.
    #[must_use]
    pub fn requiring(mut self, axis: SettingsAxis, value: impl Into<String>) -> Self {
        self.required.insert(axis, value.into());
        self
    }

    /// Returns true if every required axis is set to the required value.
    /// An axis that is not set at all never matches.
    #[must_use]
    pub fn matches(&self, settings: &Settings) -> bool {
        self.required
            .iter()
            .all(|(axis, value)| settings.get(*axis) == Some(value.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_domain_is_normalized() {
        let settings = Settings::new()
            .with(SettingsAxis::Os, "linux")
            .unwrap()
            .with(SettingsAxis::BuildType, "release")
            .unwrap();
        assert_eq!(settings.get(SettingsAxis::Os), Some("Linux"));
        assert_eq!(settings.get(SettingsAxis::BuildType), Some("Release"));
    }

    #[test]
    fn closed_domain_rejects_unknown_value() {
        let err = Settings::new()
            .with(SettingsAxis::Arch, "sparc")
            .unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue { axis: SettingsAxis::Arch, .. }));
    }

    #[test]
    fn compiler_is_open() {
        let settings = Settings::new()
            .with(SettingsAxis::Compiler, "clang-17")
            .unwrap();
        assert_eq!(settings.get(SettingsAxis::Compiler), Some("clang-17"));
    }

    #[test]
    fn assignment_parsing() {
        let mut settings = Settings::new();
        settings.apply_assignment("build_type=Debug").unwrap();
        assert_eq!(settings.get(SettingsAxis::BuildType), Some("Debug"));
        assert!(matches!(
            settings.apply_assignment("build_type"),
            Err(SettingsError::Malformed(_))
        ));
        assert!(matches!(
            settings.apply_assignment("flavor=x"),
            Err(SettingsError::UnknownAxis(_))
        ));
    }

    #[test]
    fn condition_requires_every_axis() {
        let settings = Settings::new().with(SettingsAxis::Os, "Windows").unwrap();
        let on_windows = Condition::always().requiring(SettingsAxis::Os, "Windows");
        let windows_debug = on_windows
            .clone()
            .requiring(SettingsAxis::BuildType, "Debug");

        assert!(Condition::always().matches(&settings));
        assert!(on_windows.matches(&settings));
        assert!(!windows_debug.matches(&settings));
    }

    #[test]
    fn restriction_keeps_declared_axes() {
        let settings = Settings::new()
            .with(SettingsAxis::Os, "Linux")
            .unwrap()
            .with(SettingsAxis::BuildType, "Debug")
            .unwrap();
        let restricted = settings.restricted_to(&[SettingsAxis::Os, SettingsAxis::Arch]);
        assert_eq!(restricted.get(SettingsAxis::Os), Some("Linux"));
        assert_eq!(restricted.get(SettingsAxis::BuildType), None);
        assert!(settings.restricted_to(&[]).is_empty());
    }

    #[test]
    fn settings_roundtrip_through_toml() {
        let settings = Settings::new()
            .with(SettingsAxis::Os, "Linux")
            .unwrap()
            .with(SettingsAxis::Arch, "x86_64")
            .unwrap();
        let text = toml::to_string(&settings).unwrap();
        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back, settings);
    }
}
