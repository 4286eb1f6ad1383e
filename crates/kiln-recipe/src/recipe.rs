//! The typed recipe model and its describe hooks.
//!
//! A [`Recipe`] is immutable once loaded. Its lifecycle hooks are pure
//! functions returning declarative plans ([`ConfigurationPlan`],
//! [`ImportRule`]s, [`PackageLayoutPlan`]); executing those plans is the job
//! of the generator and staging modules.

use crate::generate::ConfigurationPlan;
use crate::graph::DependencyGraph;
use crate::manifest::{
    BuildPolicy, PinnedSource, RawImport, RawManifest, RawOption, RawOptionType, RequirementSpec,
    SchemaVersion, ScmSource,
};
use crate::options::{
    ConditionalDefault, OptionDef, OptionDomain, OptionError, OptionOverrides, OptionSchema,
    OptionValue, ResolvedConfiguration,
};
use crate::reference::{validate_package_name, PackageIdentity, Reference, ReferenceError};
use crate::settings::{Condition, SettingsAxis, SettingsError};
use crate::staging::{FindMode, ImportRule, LayoutCopy, PackageLayoutPlan, PackageMetadata};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Errors that can occur when loading a recipe.
#[derive(Error, Debug)]
pub enum RecipeError {
    #[error("failed to read recipe file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse recipe: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required field: schema")]
    MissingSchema,

    #[error("unsupported schema version {0}, expected one of: 1, 2")]
    UnsupportedSchema(String),

    #[error("invalid package name '{0}': {1}")]
    InvalidName(String, &'static str),

    #[error("invalid version '{0}': {1}")]
    InvalidVersion(String, &'static str),

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("invalid option '{option}': {reason}")]
    InvalidOption { option: String, reason: String },

    #[error("condition reads setting '{0}', which the recipe does not declare in `settings`")]
    UndeclaredAxis(SettingsAxis),

    #[error(transparent)]
    Option(#[from] OptionError),

    #[error("'{feature}' is not available in schema {schema}")]
    SchemaFeature {
        feature: &'static str,
        schema: SchemaVersion,
    },

    #[error("invalid path '{path}' in {context}: {reason}")]
    InvalidPath {
        context: String,
        path: String,
        reason: &'static str,
    },

    #[error("invalid template for definition '{definition}': {reason}")]
    InvalidTemplate { definition: String, reason: String },

    #[error("definition '{definition}' reads setting '{axis}', which is not set")]
    UnsetSetting {
        definition: String,
        axis: SettingsAxis,
    },
}

/// Whether a requirement is linked into the package or only used to build it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequirementKind {
    Host,
    Build,
}

impl std::fmt::Display for RequirementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => f.write_str("requires"),
            Self::Build => f.write_str("build-requires"),
        }
    }
}

/// One declared dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub reference: Reference,
    pub kind: RequirementKind,
    /// Overrides for the required package's own options.
    pub options: BTreeMap<String, OptionValue>,
    /// Whether this entry may replace the options of an earlier entry for
    /// the same package and version.
    pub overriding: bool,
}

impl Requirement {
    /// A host requirement without inline options.
    #[must_use]
    pub fn host(reference: Reference) -> Self {
        Self {
            reference,
            kind: RequirementKind::Host,
            options: BTreeMap::new(),
            overriding: false,
        }
    }

    /// The required package name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.reference.name
    }
}

/// Descriptive fields that do not affect evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipeMetadata {
    pub license: Option<String>,
    pub author: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub topics: Vec<String>,
    pub build_policy: BuildPolicy,
}

/// Where the package's own sources come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SourceSpec {
    /// Sources are provided next to the recipe.
    #[default]
    Local,
    /// Checked out from version control (schema 1).
    Scm(ScmSource),
    /// A pinned archive or revision (schema 2).
    Pinned(PinnedSource),
}

/// One piece of a definition template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Option(String),
    Setting(SettingsAxis),
    SourceFolder,
    PackageName,
    PackageVersion,
    DependencyRoot(String),
}

/// A backend definition value: a literal boolean or a string template with
/// `{...}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Definition {
    Bool(bool),
    Template(Vec<Segment>),
}

/// A loaded, validated recipe.
#[derive(Debug, Clone)]
pub struct Recipe {
    schema: SchemaVersion,
    identity: PackageIdentity,
    metadata: RecipeMetadata,
    settings: Vec<SettingsAxis>,
    options: OptionSchema,
    dependency_options: OptionOverrides,
    requirements: Vec<Requirement>,
    generators: Vec<String>,
    definitions: BTreeMap<String, Definition>,
    imports: Vec<ImportRule>,
    find_mode: FindMode,
    properties: BTreeMap<String, String>,
    layout: Vec<LayoutCopy>,
    source: SourceSpec,
}

impl Recipe {
    /// Load a recipe from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the recipe is invalid.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RecipeError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a recipe from a TOML string.
    ///
    /// The schema version is checked first; an unknown version is rejected
    /// before anything else in the manifest is interpreted.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, the schema version is
    /// unsupported, or any declaration fails validation.
    pub fn parse(content: &str) -> Result<Self, RecipeError> {
        let value: toml::Table = toml::from_str(content)?;
        let schema = match value.get("schema") {
            None => return Err(RecipeError::MissingSchema),
            Some(toml::Value::Integer(n)) => SchemaVersion::from_number(*n)
                .ok_or_else(|| RecipeError::UnsupportedSchema(n.to_string()))?,
            Some(other) => return Err(RecipeError::UnsupportedSchema(other.to_string())),
        };

        let raw: RawManifest = toml::Value::Table(value).try_into()?;
        Self::from_raw(schema, raw)
    }

    fn from_raw(schema: SchemaVersion, raw: RawManifest) -> Result<Self, RecipeError> {
        let identity = validate_identity(&raw.package.name, &raw.package.version)?;

        let mut settings = Vec::new();
        for axis in &raw.settings {
            let axis: SettingsAxis = axis.parse()?;
            if !settings.contains(&axis) {
                settings.push(axis);
            }
        }

        // Options
        let mut root_defaults = BTreeMap::new();
        let mut dependency_options = OptionOverrides::new();
        match schema {
            SchemaVersion::V1 => {
                if !raw.dependency_options.is_empty() {
                    return Err(RecipeError::SchemaFeature {
                        feature: "dependency-options",
                        schema,
                    });
                }
                for (key, value) in raw.default_options {
                    match key.split_once(':') {
                        Some((package, option)) => {
                            dependency_options.set(package, option, value);
                        }
                        None => {
                            root_defaults.insert(key, value);
                        }
                    }
                }
            }
            SchemaVersion::V2 => {
                if !raw.default_options.is_empty() {
                    return Err(RecipeError::SchemaFeature {
                        feature: "default-options",
                        schema,
                    });
                }
                for (package, options) in raw.dependency_options {
                    for (option, value) in options {
                        dependency_options.set(package.clone(), option, value);
                    }
                }
            }
        }

        let mut options = OptionSchema::new();
        for (name, raw_option) in raw.options {
            let def = option_def(schema, &name, raw_option, root_defaults.remove(&name))?;
            options = options.with_option(name, def);
        }
        if let Some(name) = root_defaults.into_keys().next() {
            return Err(RecipeError::InvalidOption {
                option: name,
                reason: "default given for an undeclared option".to_string(),
            });
        }

        for raw_conditional in raw.conditional_defaults {
            let when = condition(&settings, &raw_conditional.when)?;
            let mut set = BTreeMap::new();
            for (name, value) in raw_conditional.set {
                let def = options.get(&name).ok_or_else(|| RecipeError::InvalidOption {
                    option: name.clone(),
                    reason: "conditional default for an undeclared option".to_string(),
                })?;
                let value = def
                    .domain
                    .coerce(&value)
                    .map_err(|reason| RecipeError::InvalidOption {
                        option: name.clone(),
                        reason,
                    })?;
                set.insert(name, value);
            }
            options = options.with_conditional(ConditionalDefault { when, set });
        }

        // Requirements
        let mut requirements: Vec<Requirement> = Vec::new();
        let specs = raw
            .requires
            .into_iter()
            .map(|spec| (spec, RequirementKind::Host))
            .chain(
                raw.build_requires
                    .into_iter()
                    .map(|spec| (spec, RequirementKind::Build)),
            );
        for (spec, kind) in specs {
            push_requirement(&mut requirements, parse_requirement(spec, kind)?)?;
        }

        // Generators and definitions
        let generators: Vec<String> = raw
            .generators
            .iter()
            .map(|name| name.trim().to_string())
            .collect();

        let mut definitions = BTreeMap::new();
        for (name, value) in raw.configure.definitions {
            let definition = match value {
                OptionValue::Bool(b) => Definition::Bool(b),
                OptionValue::Str(text) => Definition::Template(parse_template(
                    &name,
                    &text,
                    &settings,
                    &options,
                )?),
            };
            definitions.insert(name, definition);
        }

        let imports = raw
            .imports
            .into_iter()
            .map(|import| import_rule(&settings, import))
            .collect::<Result<Vec<_>, _>>()?;

        let mut layout = Vec::new();
        for copy in raw.layout.copy {
            layout.push(LayoutCopy {
                src: relative_path("layout copy src", &copy.src)?,
                pattern: relative_pattern("layout copy", copy.pattern)?,
                dst: relative_path("layout copy dst", &copy.dst)?,
            });
        }

        let source = match (schema, raw.scm, raw.source) {
            (_, None, None) => SourceSpec::Local,
            (SchemaVersion::V1, Some(scm), None) => SourceSpec::Scm(scm),
            (SchemaVersion::V2, None, Some(pinned)) => SourceSpec::Pinned(pinned),
            (SchemaVersion::V1, _, Some(_)) => {
                return Err(RecipeError::SchemaFeature {
                    feature: "source",
                    schema,
                })
            }
            (SchemaVersion::V2, Some(_), _) => {
                return Err(RecipeError::SchemaFeature {
                    feature: "scm",
                    schema,
                })
            }
        };

        Ok(Self {
            schema,
            identity,
            metadata: RecipeMetadata {
                license: raw.package.license,
                author: raw.package.author,
                url: raw.package.url,
                description: raw.package.description,
                topics: raw.package.topics,
                build_policy: raw.package.build_policy,
            },
            settings,
            options,
            dependency_options,
            requirements,
            generators,
            definitions,
            imports,
            find_mode: raw.layout.find_mode,
            properties: raw.layout.properties,
            layout,
            source,
        })
    }

    /// The manifest schema version this recipe was written against.
    #[must_use]
    pub fn schema(&self) -> SchemaVersion {
        self.schema
    }

    /// The package this recipe builds.
    #[must_use]
    pub fn identity(&self) -> &PackageIdentity {
        &self.identity
    }

    /// Descriptive metadata.
    #[must_use]
    pub fn metadata(&self) -> &RecipeMetadata {
        &self.metadata
    }

    /// Settings axes the recipe reads.
    #[must_use]
    pub fn settings(&self) -> &[SettingsAxis] {
        &self.settings
    }

    /// The option schema.
    #[must_use]
    pub fn options(&self) -> &OptionSchema {
        &self.options
    }

    /// Defaults the recipe sets on its dependencies' options.
    #[must_use]
    pub fn dependency_options(&self) -> &OptionOverrides {
        &self.dependency_options
    }

    /// All requirements, host first, in declaration order.
    #[must_use]
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Declared generator names, in order.
    #[must_use]
    pub fn generators(&self) -> &[String] {
        &self.generators
    }

    /// Declared import rules, before condition filtering.
    #[must_use]
    pub fn imports(&self) -> &[ImportRule] {
        &self.imports
    }

    /// Where the sources come from.
    #[must_use]
    pub fn source(&self) -> &SourceSpec {
        &self.source
    }

    /// The namespaced overrides this recipe contributes for its
    /// dependencies: `dependency-options` first, then inline requirement
    /// options on top.
    #[must_use]
    pub fn dependency_overrides(&self) -> OptionOverrides {
        let mut overrides = self.dependency_options.clone();
        for requirement in &self.requirements {
            for (option, value) in &requirement.options {
                overrides.set(requirement.name(), option.clone(), value.clone());
            }
        }
        overrides
    }

    /// Describe the backend definitions for one build.
    ///
    /// # Errors
    ///
    /// Returns an error if a template reads a setting that is not set.
    pub fn describe_configuration(
        &self,
        config: &ResolvedConfiguration,
        graph: &DependencyGraph,
        source_folder: &Path,
    ) -> Result<ConfigurationPlan, RecipeError> {
        let mut plan = ConfigurationPlan::default();

        for (name, definition) in &self.definitions {
            let value = match definition {
                Definition::Bool(b) => OptionValue::Bool(*b),
                Definition::Template(segments) => {
                    expand(name, segments, config, graph, source_folder)?
                }
            };
            plan.definitions.insert(name.clone(), value);
        }

        // A bool `shared` option maps onto BUILD_SHARED_LIBS unless defined explicitly
        if let Some(OptionDef {
            domain: OptionDomain::Bool,
            ..
        }) = self.options.get("shared")
        {
            if let Some(shared) = config.option("shared") {
                plan.definitions
                    .entry("BUILD_SHARED_LIBS".to_string())
                    .or_insert_with(|| shared.clone());
            }
        }

        Ok(plan)
    }

    /// Describe the imports that apply under the configuration's settings.
    #[must_use]
    pub fn describe_imports(
        &self,
        config: &ResolvedConfiguration,
        _graph: &DependencyGraph,
    ) -> Vec<ImportRule> {
        self.imports
            .iter()
            .filter(|rule| rule.when.matches(config.settings()))
            .cloned()
            .collect()
    }

    /// Describe the package layout and the metadata staged with it.
    ///
    /// Without explicit copy rules, everything the backend installed is
    /// packaged as-is.
    #[must_use]
    pub fn describe_package_layout(
        &self,
        config: &ResolvedConfiguration,
        graph: &DependencyGraph,
    ) -> PackageLayoutPlan {
        let copies = if self.layout.is_empty() {
            vec![LayoutCopy {
                src: PathBuf::new(),
                pattern: "**/*".to_string(),
                dst: PathBuf::new(),
            }]
        } else {
            self.layout.clone()
        };

        let requires = graph
            .root()
            .dependencies
            .iter()
            .filter(|edge| edge.kind == RequirementKind::Host)
            .map(|edge| graph.node(edge.target).identity.clone())
            .collect();

        PackageLayoutPlan {
            copies,
            metadata: PackageMetadata {
                package_id: config.package_id(),
                find_mode: self.find_mode,
                identity: config.identity().clone(),
                settings: config.settings().clone(),
                options: config.options().clone(),
                requires,
                properties: self.properties.clone(),
                files: Vec::new(),
            },
        }
    }
}

fn validate_identity(name: &str, version: &str) -> Result<PackageIdentity, RecipeError> {
    validate_package_name(name).map_err(|reason| RecipeError::InvalidName(name.to_string(), reason))?;

    if version.is_empty() {
        return Err(RecipeError::InvalidVersion(
            version.to_string(),
            "version cannot be empty",
        ));
    }
    if version.contains(['/', '@', '#', '[', ']']) || version.contains(char::is_whitespace) {
        return Err(RecipeError::InvalidVersion(
            version.to_string(),
            "version cannot contain '/', '@', '#', brackets or whitespace",
        ));
    }

    Ok(PackageIdentity::new(name, version))
}

fn option_def(
    schema: SchemaVersion,
    name: &str,
    raw: RawOption,
    listed_default: Option<OptionValue>,
) -> Result<OptionDef, RecipeError> {
    let invalid = |reason: &str| RecipeError::InvalidOption {
        option: name.to_string(),
        reason: reason.to_string(),
    };

    let (domain, default) = match (schema, raw) {
        (SchemaVersion::V1, RawOption::Values(values)) => {
            let default = listed_default.ok_or_else(|| invalid("missing default in default-options"))?;
            (domain_from_values(&values).map_err(invalid)?, default)
        }
        (SchemaVersion::V2, RawOption::Typed(typed)) => {
            let domain = match typed.kind {
                RawOptionType::Bool => OptionDomain::Bool,
                RawOptionType::String => OptionDomain::String,
                RawOptionType::Enum if typed.values.is_empty() => {
                    return Err(invalid("enum option needs at least one value"))
                }
                RawOptionType::Enum => OptionDomain::Enum(typed.values),
            };
            (domain, typed.default)
        }
        (SchemaVersion::V1, RawOption::Typed(_)) => {
            return Err(RecipeError::SchemaFeature {
                feature: "typed option tables",
                schema,
            })
        }
        (SchemaVersion::V2, RawOption::Values(_)) => {
            return Err(RecipeError::SchemaFeature {
                feature: "option value lists",
                schema,
            })
        }
    };

    // Defaults must be literal members of the domain; `"True"` strings are
    // only accepted from overrides.
    let default = match (&domain, default) {
        (OptionDomain::Bool, OptionValue::Str(_)) => {
            return Err(invalid("default of a bool option must be true or false"))
        }
        (domain, default) => domain.coerce(&default).map_err(|reason| RecipeError::InvalidOption {
            option: name.to_string(),
            reason,
        })?,
    };

    Ok(OptionDef { domain, default })
}

/// Schema 1 value lists: `[true, false]` is a bool, `["ANY"]` a free string,
/// other string lists an enum.
fn domain_from_values(values: &[OptionValue]) -> Result<OptionDomain, &'static str> {
    if values.is_empty() {
        return Err("value list cannot be empty");
    }
    if values.iter().all(|v| matches!(v, OptionValue::Bool(_))) {
        return Ok(OptionDomain::Bool);
    }
    let strings: Option<Vec<String>> = values
        .iter()
        .map(|v| match v {
            OptionValue::Str(s) => Some(s.clone()),
            OptionValue::Bool(_) => None,
        })
        .collect();
    match strings {
        Some(strings) if strings.iter().any(|s| s == "ANY") => Ok(OptionDomain::String),
        Some(strings) => Ok(OptionDomain::Enum(strings)),
        None => Err("value list mixes booleans and strings"),
    }
}

fn condition(
    declared: &[SettingsAxis],
    raw: &BTreeMap<String, String>,
) -> Result<Condition, RecipeError> {
    let mut condition = Condition::always();
    for (axis, value) in raw {
        let axis: SettingsAxis = axis.parse()?;
        if !declared.contains(&axis) {
            return Err(RecipeError::UndeclaredAxis(axis));
        }
        condition = condition.requiring(axis, axis.normalize(value)?);
    }
    Ok(condition)
}

fn parse_requirement(spec: RequirementSpec, kind: RequirementKind) -> Result<Requirement, RecipeError> {
    Ok(match spec {
        RequirementSpec::Simple(text) => Requirement {
            reference: Reference::parse(&text)?,
            kind,
            options: BTreeMap::new(),
            overriding: false,
        },
        RequirementSpec::Detailed(raw) => Requirement {
            reference: Reference::parse(&raw.reference)?,
            kind,
            options: raw.options,
            overriding: raw.overriding,
        },
    })
}

/// Add a requirement, folding duplicates of the same package and version.
///
/// Identical duplicates collapse. Duplicates with different inline options
/// need `override = true` on the later entry, whose options then win.
/// Duplicates with different versions are kept; the graph builder reports
/// them as a version conflict.
fn push_requirement(
    requirements: &mut Vec<Requirement>,
    requirement: Requirement,
) -> Result<(), RecipeError> {
    let existing = requirements.iter_mut().find(|r| {
        r.name() == requirement.name() && r.reference.constraint == requirement.reference.constraint
    });

    let Some(existing) = existing else {
        requirements.push(requirement);
        return Ok(());
    };

    if existing.options == requirement.options {
        return Ok(());
    }

    if !requirement.overriding {
        let option = requirement
            .options
            .keys()
            .chain(existing.options.keys())
            .find(|name| existing.options.get(*name) != requirement.options.get(*name))
            .cloned()
            .unwrap_or_default();
        return Err(OptionError::Conflict {
            package: requirement.name().to_string(),
            option,
            reason: format!(
                "'{}' is required twice with different options; mark the later entry `override = true`",
                requirement.reference
            ),
        }
        .into());
    }

    existing.options.extend(requirement.options);
    Ok(())
}

/// A build-tree or package relative path: not absolute, no `..`.
fn relative_path(context: &str, text: &str) -> Result<PathBuf, RecipeError> {
    let path = PathBuf::from(text);
    let invalid = |reason| RecipeError::InvalidPath {
        context: context.to_string(),
        path: text.to_string(),
        reason,
    };
    if path.is_absolute() || text.starts_with('/') || text.starts_with('\\') {
        return Err(invalid("path must be relative"));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err(invalid("path cannot contain '..'")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("path must be relative"))
            }
        }
    }
    Ok(path)
}

fn import_rule(declared: &[SettingsAxis], raw: RawImport) -> Result<ImportRule, RecipeError> {
    validate_package_name(&raw.package)
        .map_err(|reason| RecipeError::InvalidName(raw.package.clone(), reason))?;
    Ok(ImportRule {
        src: relative_path(&format!("import src from '{}'", raw.package), &raw.src)?,
        dst: relative_path(&format!("import dst from '{}'", raw.package), &raw.dst)?,
        when: condition(declared, &raw.when)?,
        pattern: relative_pattern(&format!("import from '{}'", raw.package), raw.pattern)?,
        package: raw.package,
    })
}

/// A glob pattern that can only match below the directory it is joined to.
fn relative_pattern(context: &str, pattern: String) -> Result<String, RecipeError> {
    if pattern.trim().is_empty() {
        return Err(RecipeError::InvalidPath {
            context: context.to_string(),
            path: pattern,
            reason: "pattern cannot be empty",
        });
    }
    relative_path(&format!("{context} pattern"), &pattern)?;
    if pattern.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(RecipeError::InvalidPath {
            context: format!("{context} pattern"),
            path: pattern,
            reason: "path cannot contain '..'",
        });
    }
    Ok(pattern)
}

fn parse_template(
    definition: &str,
    text: &str,
    settings: &[SettingsAxis],
    options: &OptionSchema,
) -> Result<Vec<Segment>, RecipeError> {
    let invalid = |reason: String| RecipeError::InvalidTemplate {
        definition: definition.to_string(),
        reason,
    };

    let mut segments = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| invalid("unterminated '{' placeholder".to_string()))?;
        let key = after[..end].trim();

        let segment = if let Some(option) = key.strip_prefix("options.") {
            if !options.contains(option) {
                return Err(invalid(format!("unknown option '{option}'")));
            }
            Segment::Option(option.to_string())
        } else if let Some(axis) = key.strip_prefix("settings.") {
            let axis: SettingsAxis = axis.parse()?;
            if !settings.contains(&axis) {
                return Err(RecipeError::UndeclaredAxis(axis));
            }
            Segment::Setting(axis)
        } else if let Some(dep) = key
            .strip_prefix("deps.")
            .and_then(|k| k.strip_suffix(".root"))
        {
            validate_package_name(dep).map_err(|r| invalid(r.to_string()))?;
            Segment::DependencyRoot(dep.to_string())
        } else {
            match key {
                "source_folder" => Segment::SourceFolder,
                "package.name" => Segment::PackageName,
                "package.version" => Segment::PackageVersion,
                other => return Err(invalid(format!("unknown placeholder '{{{other}}}'"))),
            }
        };
        segments.push(segment);
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

fn expand(
    definition: &str,
    segments: &[Segment],
    config: &ResolvedConfiguration,
    graph: &DependencyGraph,
    source_folder: &Path,
) -> Result<OptionValue, RecipeError> {
    // A lone option reference keeps its type, so booleans stay booleans
    if let [Segment::Option(name)] = segments {
        if let Some(value) = config.option(name) {
            return Ok(value.clone());
        }
    }

    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Option(name) => {
                if let Some(value) = config.option(name) {
                    out.push_str(&value.to_string());
                }
            }
            Segment::Setting(axis) => {
                let value = config
                    .settings()
                    .get(*axis)
                    .ok_or_else(|| RecipeError::UnsetSetting {
                        definition: definition.to_string(),
                        axis: *axis,
                    })?;
                out.push_str(value);
            }
            Segment::SourceFolder => out.push_str(&forward_slashes(source_folder)),
            Segment::PackageName => out.push_str(&config.identity().name),
            Segment::PackageVersion => out.push_str(&config.identity().version),
            Segment::DependencyRoot(name) => {
                if let Some(output) = graph.get(name).and_then(|node| node.output.as_deref()) {
                    out.push_str(&forward_slashes(output));
                }
            }
        }
    }
    Ok(OptionValue::Str(out))
}

/// Paths in generated files always use `/`, which CMake accepts everywhere.
pub(crate) fn forward_slashes(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    const V2_RECIPE: &str = r#"
schema = 2
settings = ["os", "compiler", "build_type", "arch"]
requires = ["glad/0.1.34", "math/local"]
build-requires = ["cmake_installer/[>=3.16]@conan/stable"]
generators = ["toolchain", "cache_variables", "find_package"]

[package]
name = "2d"
version = "0.1.0"
license = "The Unlicense"
author = "adnn"
description = "2D graphics with OpenGL"
topics = ["opengl", "graphics", "2D"]
build-policy = "missing"

[options.shared]
type = "bool"
default = false

[options.build_tests]
type = "bool"
default = false

[dependency-options.glad]
api_version = "4.1"
extensions = "GL_KHR_debug, GL_ARB_texture_storage"

[[conditional-defaults]]
when = { os = "windows" }
set = { shared = true }

[configure.definitions]
BUILD_tests = "{options.build_tests}"
CMAKE_PROJECT_2d_INCLUDE = "{source_folder}/cmake/conan/customconan.cmake"

[[imports]]
package = "glad"
src = "src"
pattern = "*.c"
dst = "glad_sources"
when = { os = "Linux" }

[layout]
find-mode = "none"
"#;

    const V1_RECIPE: &str = r#"
schema = 1
settings = ["os", "compiler", "build_type", "arch"]
requires = [
    "boost/1.71.0@conan/stable",
    "glad/0.1.29@bincrafters/stable",
    "glfw/3.3@bincrafters/stable",
    "jsonformoderncpp/3.7.0@vthiery/stable",
    "math/local",
]
build-requires = ["cmake_installer/[>=3.16]@conan/stable"]
generators = ["cmake_paths", "cmake"]

[package]
name = "2d"
version = "0.1.0"

[options]
shared = [true, false]
build_tests = [true, false]

[default-options]
shared = false
build_tests = false
"glad:api_version" = "4.1"
"glad:extensions" = "GL_KHR_debug, GL_ARB_texture_storage"

[scm]
type = "git"
url = "auto"
revision = "auto"
submodule = "recursive"
"#;

    #[test]
    fn parse_schema_2_recipe() {
        let recipe = Recipe::parse(V2_RECIPE).unwrap();
        assert_eq!(recipe.schema(), SchemaVersion::V2);
        assert_eq!(recipe.identity().to_string(), "2d/0.1.0");
        assert_eq!(recipe.settings().len(), 4);
        assert_eq!(recipe.requirements().len(), 3);
        assert_eq!(recipe.requirements()[2].kind, RequirementKind::Build);
        assert_eq!(recipe.generators(), ["toolchain", "cache_variables", "find_package"]);
        assert_eq!(
            recipe.dependency_options().get("glad", "api_version"),
            Some(&OptionValue::from("4.1"))
        );
        assert_eq!(recipe.options().conditionals().len(), 1);
        assert_eq!(recipe.imports().len(), 1);
        assert_eq!(recipe.metadata().topics.len(), 3);
        assert_eq!(recipe.source(), &SourceSpec::Local);
    }

    #[test]
    fn parse_schema_1_recipe() {
        let recipe = Recipe::parse(V1_RECIPE).unwrap();
        assert_eq!(recipe.schema(), SchemaVersion::V1);
        assert_eq!(recipe.requirements().len(), 6);
        assert_eq!(
            recipe.options().get("shared").map(|d| &d.domain),
            Some(&OptionDomain::Bool)
        );
        assert_eq!(
            recipe.dependency_options().get("glad", "extensions"),
            Some(&OptionValue::from("GL_KHR_debug, GL_ARB_texture_storage"))
        );
        assert!(matches!(recipe.source(), SourceSpec::Scm(scm) if scm.kind == "git"));
    }

    #[test]
    fn missing_schema_is_rejected() {
        let err = Recipe::parse("[package]\nname = \"a\"\nversion = \"1.0\"\n").unwrap_err();
        assert!(matches!(err, RecipeError::MissingSchema));
    }

    #[test]
    fn unknown_schema_is_rejected_before_anything_else() {
        // The rest of the manifest is garbage for every known schema
        let err = Recipe::parse("schema = 7\n[whatever]\nx = 1\n").unwrap_err();
        assert!(matches!(err, RecipeError::UnsupportedSchema(ref n) if n == "7"));

        let err = Recipe::parse("schema = \"2\"\n").unwrap_err();
        assert!(matches!(err, RecipeError::UnsupportedSchema(_)));
    }

    #[test]
    fn bool_option_with_string_default_is_rejected() {
        let toml = r#"
schema = 2
[package]
name = "a"
version = "1.0"
[options.shared]
type = "bool"
default = "yes"
"#;
        let err = Recipe::parse(toml).unwrap_err();
        assert!(matches!(err, RecipeError::InvalidOption { ref option, .. } if option == "shared"));
    }

    #[test]
    fn enum_default_outside_domain_is_rejected() {
        let toml = r#"
schema = 2
[package]
name = "a"
version = "1.0"
[options.profile]
type = "enum"
values = ["core", "compat"]
default = "es"
"#;
        assert!(matches!(
            Recipe::parse(toml).unwrap_err(),
            RecipeError::InvalidOption { .. }
        ));
    }

    #[test]
    fn schema_1_any_is_free_string() {
        let toml = r#"
schema = 1
[package]
name = "glad"
version = "0.1.34"
[options]
api_version = ["ANY"]
[default-options]
api_version = "3.3"
"#;
        let recipe = Recipe::parse(toml).unwrap();
        assert_eq!(
            recipe.options().get("api_version").map(|d| &d.domain),
            Some(&OptionDomain::String)
        );
    }

    #[test]
    fn schema_features_are_gated() {
        let scm_in_v2 = r#"
schema = 2
[package]
name = "a"
version = "1.0"
[scm]
type = "git"
url = "auto"
revision = "auto"
"#;
        assert!(matches!(
            Recipe::parse(scm_in_v2).unwrap_err(),
            RecipeError::SchemaFeature { feature: "scm", .. }
        ));

        let lists_in_v2 = r#"
schema = 2
[package]
name = "a"
version = "1.0"
[options]
shared = [true, false]
"#;
        assert!(matches!(
            Recipe::parse(lists_in_v2).unwrap_err(),
            RecipeError::SchemaFeature { .. }
        ));
    }

    #[test]
    fn conditional_on_unknown_axis_is_rejected() {
        let toml = r#"
schema = 2
settings = ["os"]
[package]
name = "a"
version = "1.0"
[options.shared]
type = "bool"
default = false
[[conditional-defaults]]
when = { libc = "musl" }
set = { shared = true }
"#;
        assert!(matches!(
            Recipe::parse(toml).unwrap_err(),
            RecipeError::Settings(SettingsError::UnknownAxis(_))
        ));
    }

    #[test]
    fn conditional_on_undeclared_axis_is_rejected() {
        let toml = r#"
schema = 2
settings = ["os"]
[package]
name = "a"
version = "1.0"
[options.shared]
type = "bool"
default = false
[[conditional-defaults]]
when = { build_type = "Debug" }
set = { shared = true }
"#;
        assert!(matches!(
            Recipe::parse(toml).unwrap_err(),
            RecipeError::UndeclaredAxis(SettingsAxis::BuildType)
        ));
    }

    #[test]
    fn duplicate_requirement_needs_override() {
        let conflicting = r#"
schema = 2
requires = [
    { ref = "glfw/3.3", options = { shared = true } },
    { ref = "glfw/3.3", options = { shared = false } },
]
[package]
name = "a"
version = "1.0"
"#;
        let err = Recipe::parse(conflicting).unwrap_err();
        assert!(matches!(
            err,
            RecipeError::Option(OptionError::Conflict { ref package, ref option, .. })
                if package == "glfw" && option == "shared"
        ));

        let overriding = conflicting.replace(
            "options = { shared = false } }",
            "options = { shared = false }, override = true }",
        );
        let recipe = Recipe::parse(&overriding).unwrap();
        assert_eq!(recipe.requirements().len(), 1);
        assert_eq!(
            recipe.dependency_overrides().get("glfw", "shared"),
            Some(&OptionValue::Bool(false))
        );
    }

    #[test]
    fn identical_duplicates_collapse() {
        let toml = r#"
schema = 2
requires = ["glfw/3.3", "glfw/3.3"]
[package]
name = "a"
version = "1.0"
"#;
        assert_eq!(Recipe::parse(toml).unwrap().requirements().len(), 1);
    }

    #[test]
    fn import_destination_must_stay_in_build_tree() {
        for dst in ["/abs/path", "../escape", "a/../../b"] {
            let toml = format!(
                "schema = 2\n[package]\nname = \"a\"\nversion = \"1.0\"\n[[imports]]\npackage = \"glad\"\npattern = \"*.c\"\ndst = \"{dst}\"\n"
            );
            assert!(
                matches!(Recipe::parse(&toml).unwrap_err(), RecipeError::InvalidPath { .. }),
                "{dst}"
            );
        }
    }

    #[test]
    fn template_validation() {
        let base = "schema = 2\nsettings = [\"os\"]\n[package]\nname = \"a\"\nversion = \"1.0\"\n[configure.definitions]\n";
        for bad in [
            "X = \"{options.nope}\"",
            "X = \"{settings.arch}\"",
            "X = \"{mystery}\"",
            "X = \"{source_folder\"",
        ] {
            assert!(Recipe::parse(&format!("{base}{bad}\n")).is_err(), "{bad}");
        }
        assert!(Recipe::parse(&format!("{base}X = \"{{settings.os}}-{{package.version}}\"\n")).is_ok());
    }

    #[test]
    fn self_requirement_parses() {
        let toml = "schema = 2\nrequires = [\"a/1.0\"]\n[package]\nname = \"a\"\nversion = \"1.0\"\n";
        let recipe = Recipe::parse(toml).unwrap();
        assert_eq!(recipe.requirements()[0].name(), "a");
    }

    #[test]
    fn patterns_must_stay_below_their_directory() {
        let import = "schema = 2\n[package]\nname = \"a\"\nversion = \"1.0\"\n[[imports]]\npackage = \"glad\"\ndst = \"vendor\"\npattern = ";
        let layout = "schema = 2\n[package]\nname = \"a\"\nversion = \"1.0\"\n[[layout.copy]]\nsrc = \"include\"\ndst = \"include\"\npattern = ";
        for pattern in ["\"../../secret/*.txt\"", "\"/etc/*\"", "\"include/../*.h\"", "'..\\*.h'"] {
            for base in [import, layout] {
                assert!(
                    matches!(
                        Recipe::parse(&format!("{base}{pattern}\n")).unwrap_err(),
                        RecipeError::InvalidPath { .. }
                    ),
                    "{base}{pattern}"
                );
            }
        }
        assert!(Recipe::parse(&format!("{import}\"**/*.c\"\n")).is_ok());
        assert!(Recipe::parse(&format!("{layout}\"./*.h\"\n")).is_ok());
    }
}
