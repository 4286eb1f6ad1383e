//! Recipe manifest (`kiln.toml`) schema.
//!
//! These are the raw, versioned shapes read from TOML. [`crate::Recipe`]
//! validates them into the typed model; nothing outside this crate sees the
//! raw structs.
//!
//! Two schema versions are understood:
//!
//! - **1** — options declared as value lists with a flat `default-options`
//!   table (`"glad:api_version" = "4.1"`), `cmake` / `cmake_paths`
//!   generators, and `[scm]` sourcing.
//! - **2** — typed option tables, a `[dependency-options]` table per
//!   dependency, `toolchain` / `cache_variables` / `find_package` generators,
//!   and a pinned `[source]`.

use crate::options::OptionValue;
use crate::staging::FindMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The manifest filename.
pub const MANIFEST_FILE: &str = "kiln.toml";

/// A manifest schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchemaVersion {
    V1,
    V2,
}

impl SchemaVersion {
    /// Map a declared `schema = N` to a known version.
    #[must_use]
    pub fn from_number(number: i64) -> Option<Self> {
        match number {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }

    /// The number written in manifests.
    #[must_use]
    pub fn number(self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// The complete manifest, as read from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawManifest {
    /// Checked before deserialization; kept here so `deny_unknown_fields`
    /// accepts it.
    #[allow(dead_code)]
    pub schema: i64,

    /// Settings axes the recipe reads.
    #[serde(default)]
    pub settings: Vec<String>,

    /// Package metadata (required).
    pub package: RawPackage,

    /// Option declarations.
    #[serde(default)]
    pub options: BTreeMap<String, RawOption>,

    /// Schema 1: flat defaults, including `dep:option` keys.
    #[serde(default, rename = "default-options")]
    pub default_options: BTreeMap<String, OptionValue>,

    /// Schema 2: defaults for dependencies' options, per dependency.
    #[serde(default, rename = "dependency-options")]
    pub dependency_options: BTreeMap<String, BTreeMap<String, OptionValue>>,

    /// Defaults applied when the settings match.
    #[serde(default, rename = "conditional-defaults")]
    pub conditional_defaults: Vec<RawConditional>,

    /// Host requirements.
    #[serde(default)]
    pub requires: Vec<RequirementSpec>,

    /// Tool requirements.
    #[serde(default, rename = "build-requires")]
    pub build_requires: Vec<RequirementSpec>,

    /// Generator names, in order.
    #[serde(default)]
    pub generators: Vec<String>,

    /// Backend configuration.
    #[serde(default)]
    pub configure: RawConfigure,

    /// Files copied from dependencies into the build tree.
    #[serde(default)]
    pub imports: Vec<RawImport>,

    /// Packaging layout.
    #[serde(default)]
    pub layout: RawLayout,

    /// Schema 1: source control checkout description.
    #[serde(default)]
    pub scm: Option<ScmSource>,

    /// Schema 2: pinned source reference.
    #[serde(default)]
    pub source: Option<PinnedSource>,
}

/// Package metadata section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawPackage {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default, rename = "build-policy")]
    pub build_policy: BuildPolicy,
}

/// When a package should be built from source instead of reused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildPolicy {
    /// Build only if no binary exists for the configuration.
    #[default]
    Missing,
    /// Never build; a binary must exist.
    Never,
    /// Always build.
    Always,
}

impl fmt::Display for BuildPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("missing"),
            Self::Never => f.write_str("never"),
            Self::Always => f.write_str("always"),
        }
    }
}

/// An option declaration: a value list (schema 1) or a typed table
/// (schema 2).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawOption {
    Values(Vec<OptionValue>),
    Typed(RawTypedOption),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawTypedOption {
    #[serde(rename = "type")]
    pub kind: RawOptionType,
    #[serde(default)]
    pub values: Vec<String>,
    pub default: OptionValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RawOptionType {
    Bool,
    Enum,
    String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawConditional {
    pub when: BTreeMap<String, String>,
    pub set: BTreeMap<String, OptionValue>,
}

/// A requirement entry: a bare reference or a table with inline options.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum RequirementSpec {
    Simple(String),
    Detailed(RawRequirement),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawRequirement {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub options: BTreeMap<String, OptionValue>,
    #[serde(default, rename = "override")]
    pub overriding: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawConfigure {
    /// Backend variable name to value or template.
    #[serde(default)]
    pub definitions: BTreeMap<String, OptionValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawImport {
    pub package: String,
    #[serde(default)]
    pub src: String,
    pub pattern: String,
    #[serde(default)]
    pub dst: String,
    #[serde(default)]
    pub when: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawLayout {
    #[serde(default, rename = "find-mode")]
    pub find_mode: FindMode,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub copy: Vec<RawCopy>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawCopy {
    #[serde(default)]
    pub src: String,
    pub pattern: String,
    #[serde(default)]
    pub dst: String,
}

/// Source control checkout description (schema 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScmSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub revision: String,
    #[serde(default)]
    pub submodule: Option<String>,
}

/// Pinned source reference (schema 2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PinnedSource {
    pub url: String,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}
