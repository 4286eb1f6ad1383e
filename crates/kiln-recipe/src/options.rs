//! Option schemas, per-package overrides and option resolution.
//!
//! Resolution merges three layers, in order:
//! 1. the defaults declared in the schema,
//! 2. conditional defaults whose settings condition holds,
//! 3. overrides addressed to this package's own namespace.
//!
//! Overrides are kept as an explicit `package -> option -> value` map, so an
//! override for `glad:api_version` can never leak into another package that
//! happens to declare an `api_version` option too.

use crate::reference::PackageIdentity;
use crate::settings::{Condition, Settings};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors that can occur while resolving options.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionError {
    #[error("unknown option '{option}' for package '{package}'")]
    Unknown { package: String, option: String },

    #[error("invalid value '{value}' for option '{package}:{option}': {reason}")]
    InvalidValue {
        package: String,
        option: String,
        value: String,
        reason: String,
    },

    #[error("conflicting values for option '{package}:{option}': {reason}")]
    Conflict {
        package: String,
        option: String,
        reason: String,
    },

    #[error("malformed option assignment '{0}', expected [package:]option=value")]
    Malformed(String),
}

/// A concrete option value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Str(String),
}

/// Booleans print as `True` / `False`, which is also the token the build
/// backend reads back from cache-variable files.
impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

/// The value domain of an option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionDomain {
    /// `True` or `False`.
    Bool,
    /// One of an enumerated list of strings.
    Enum(Vec<String>),
    /// Any string, passed through verbatim.
    String,
}

impl OptionDomain {
    /// Check a value against the domain, converting the canonical `True` /
    /// `False` tokens to booleans for boolean options.
    pub fn coerce(&self, value: &OptionValue) -> Result<OptionValue, String> {
        match (self, value) {
            (Self::Bool, OptionValue::Bool(_)) => Ok(value.clone()),
            (Self::Bool, OptionValue::Str(s)) => match s.as_str() {
                "True" => Ok(OptionValue::Bool(true)),
                "False" => Ok(OptionValue::Bool(false)),
                _ => Err("expected True or False".to_string()),
            },
            (Self::Enum(values), OptionValue::Str(s)) => {
                if values.iter().any(|v| v == s) {
                    Ok(value.clone())
                } else {
                    Err(format!("expected one of: {}", values.join(", ")))
                }
            }
            (Self::Enum(values), OptionValue::Bool(_)) => {
                Err(format!("expected one of: {}", values.join(", ")))
            }
            (Self::String, OptionValue::Str(_)) => Ok(value.clone()),
            (Self::String, OptionValue::Bool(b)) => Ok(OptionValue::Str(
                OptionValue::Bool(*b).to_string(),
            )),
        }
    }
}

/// Declaration of one option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionDef {
    pub domain: OptionDomain,
    pub default: OptionValue,
}

/// A default that only applies when the build settings match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalDefault {
    pub when: Condition,
    pub set: BTreeMap<String, OptionValue>,
}

/// The options a package declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSchema {
    options: BTreeMap<String, OptionDef>,
    conditionals: Vec<ConditionalDefault>,
}

impl OptionSchema {
    /// Create an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an option declaration.
    #[must_use]
    pub fn with_option(mut self, name: impl Into<String>, def: OptionDef) -> Self {
        self.options.insert(name.into(), def);
        self
    }

    /// Add a conditional default.
    #[must_use]
    pub fn with_conditional(mut self, conditional: ConditionalDefault) -> Self {
        self.conditionals.push(conditional);
        self
    }

    /// Get an option declaration.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OptionDef> {
        self.options.get(name)
    }

    /// Returns true if the option is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }

    /// Iterate over declarations by name.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptionDef)> {
        self.options.iter()
    }

    /// The conditional defaults, in declaration order.
    #[must_use]
    pub fn conditionals(&self) -> &[ConditionalDefault] {
        &self.conditionals
    }

    /// Returns true if no options are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

/// Option overrides addressed to packages by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionOverrides {
    by_package: BTreeMap<String, BTreeMap<String, OptionValue>>,
}

impl OptionOverrides {
    /// Create an empty override set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one override, replacing any previous value.
    pub fn set(
        &mut self,
        package: impl Into<String>,
        option: impl Into<String>,
        value: OptionValue,
    ) {
        self.by_package
            .entry(package.into())
            .or_default()
            .insert(option.into(), value);
    }

    /// Builder-style variant of [`OptionOverrides::set`].
    #[must_use]
    pub fn with(
        mut self,
        package: impl Into<String>,
        option: impl Into<String>,
        value: impl Into<OptionValue>,
    ) -> Self {
        self.set(package, option, value.into());
        self
    }

    /// Apply a `[package:]option=value` assignment. A bare option name
    /// addresses `root`. The value is kept as a string; boolean options accept
    /// `True` / `False` at resolution time.
    pub fn apply_assignment(&mut self, assignment: &str, root: &str) -> Result<(), OptionError> {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| OptionError::Malformed(assignment.to_string()))?;
        self.apply_flat(key.trim(), OptionValue::Str(value.trim().to_string()), root)
    }

    /// Apply a flat `[package:]option` key.
    pub fn apply_flat(&mut self, key: &str, value: OptionValue, root: &str) -> Result<(), OptionError> {
        let (package, option) = match key.split_once(':') {
            Some((package, option)) => (package, option),
            None => (root, key),
        };
        if package.is_empty() || option.is_empty() {
            return Err(OptionError::Malformed(key.to_string()));
        }
        self.set(package, option, value);
        Ok(())
    }

    /// The overrides addressed to one package.
    #[must_use]
    pub fn for_package(&self, package: &str) -> Option<&BTreeMap<String, OptionValue>> {
        self.by_package.get(package)
    }

    /// Get one override.
    #[must_use]
    pub fn get(&self, package: &str, option: &str) -> Option<&OptionValue> {
        self.by_package.get(package).and_then(|opts| opts.get(option))
    }

    /// Returns true if there are no overrides.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_package.values().all(BTreeMap::is_empty)
    }

    /// Iterate as `(package, option, value)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &OptionValue)> {
        self.by_package.iter().flat_map(|(package, opts)| {
            opts.iter()
                .map(move |(option, value)| (package.as_str(), option.as_str(), value))
        })
    }

    /// Fill in values from `other` that are not already present here.
    pub fn merge_missing(&mut self, other: &OptionOverrides) {
        for (package, option, value) in other.iter() {
            self.by_package
                .entry(package.to_string())
                .or_default()
                .entry(option.to_string())
                .or_insert_with(|| value.clone());
        }
    }
}

/// The options of one package, fully resolved for one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedConfiguration {
    identity: PackageIdentity,
    settings: Settings,
    options: BTreeMap<String, OptionValue>,
}

impl ResolvedConfiguration {
    /// The package this configuration belongs to.
    #[must_use]
    pub fn identity(&self) -> &PackageIdentity {
        &self.identity
    }

    /// The settings the configuration was resolved under.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// All resolved options, sorted by name.
    #[must_use]
    pub fn options(&self) -> &BTreeMap<String, OptionValue> {
        &self.options
    }

    /// Get one resolved option.
    #[must_use]
    pub fn option(&self, name: &str) -> Option<&OptionValue> {
        self.options.get(name)
    }

    /// Canonical text form. Identical inputs always give identical text.
    #[must_use]
    pub fn canonical(&self) -> String {
        let mut out = format!("{}\n[settings]\n", self.identity);
        for (axis, value) in self.settings.iter() {
            out.push_str(&format!("{axis}={value}\n"));
        }
        out.push_str("[options]\n");
        for (name, value) in &self.options {
            out.push_str(&format!("{name}={value}\n"));
        }
        out
    }

    /// SHA-256 over the canonical form, identifying the binary this
    /// configuration produces.
    #[must_use]
    pub fn package_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Resolve a package's options for one build.
///
/// # Errors
///
/// Returns an error if an override names an option the schema does not
/// declare, or a value falls outside its option's domain.
pub fn resolve(
    identity: &PackageIdentity,
    schema: &OptionSchema,
    overrides: &OptionOverrides,
    settings: &Settings,
) -> Result<ResolvedConfiguration, OptionError> {
    let package = identity.name.as_str();
    let mut options: BTreeMap<String, OptionValue> = schema
        .iter()
        .map(|(name, def)| (name.clone(), def.default.clone()))
        .collect();

    for conditional in schema.conditionals() {
        if !conditional.when.matches(settings) {
            continue;
        }
        for (name, value) in &conditional.set {
            let value = coerce(schema, package, name, value)?;
            options.insert(name.clone(), value);
        }
    }

    if let Some(own) = overrides.for_package(package) {
        for (name, value) in own {
            let value = coerce(schema, package, name, value)?;
            options.insert(name.clone(), value);
        }
    }

    Ok(ResolvedConfiguration {
        identity: identity.clone(),
        settings: settings.clone(),
        options,
    })
}

fn coerce(
    schema: &OptionSchema,
    package: &str,
    name: &str,
    value: &OptionValue,
) -> Result<OptionValue, OptionError> {
    let def = schema.get(name).ok_or_else(|| OptionError::Unknown {
        package: package.to_string(),
        option: name.to_string(),
    })?;
    def.domain
        .coerce(value)
        .map_err(|reason| OptionError::InvalidValue {
            package: package.to_string(),
            option: name.to_string(),
            value: value.to_string(),
            reason,
        })
}
