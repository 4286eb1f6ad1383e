//! Profiles: settings and option overrides kept in a file.
//!
//! ```toml
//! store = "/var/lib/kiln/store"
//!
//! [settings]
//! os = "Linux"
//! build_type = "Release"
//!
//! [options]
//! build_tests = true
//! "glad:api_version" = "4.1"
//! ```

use crate::options::{OptionError, OptionOverrides, OptionValue};
use crate::settings::{Settings, SettingsError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur when loading a profile.
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("failed to read profile '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse profile: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Option(#[from] OptionError),
}

/// A loaded profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    /// Package store to resolve dependencies from.
    #[serde(default)]
    pub store: Option<PathBuf>,

    #[serde(default)]
    pub settings: Settings,

    /// Flat option overrides; bare names address the root package.
    #[serde(default)]
    pub options: BTreeMap<String, OptionValue>,
}

impl Profile {
    /// Load a profile from a file. A relative `store` is resolved against
    /// the profile's directory.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ProfileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut profile = Self::parse(&content)?;
        if let (Some(store), Some(dir)) = (&profile.store, path.parent()) {
            if store.is_relative() {
                profile.store = Some(dir.join(store));
            }
        }
        Ok(profile)
    }

    /// Parse a profile from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ProfileError> {
        Ok(toml::from_str(content)?)
    }

    /// The option overrides, with bare names addressed to `root`.
    pub fn overrides(&self, root: &str) -> Result<OptionOverrides, ProfileError> {
        let mut overrides = OptionOverrides::new();
        for (key, value) in &self.options {
            overrides.apply_flat(key, value.clone(), root)?;
        }
        Ok(overrides)
    }

    /// Apply command line `axis=value` settings on top of the profile.
    pub fn apply_settings<S: AsRef<str>>(&mut self, assignments: &[S]) -> Result<(), ProfileError> {
        for assignment in assignments {
            self.settings.apply_assignment(assignment.as_ref())?;
        }
        Ok(())
    }
}
