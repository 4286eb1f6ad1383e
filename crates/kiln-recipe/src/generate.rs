//! Build configuration generators.
//!
//! Generators turn a resolved configuration and its dependency graph into
//! the files the CMake backend consumes. Which generator names a recipe may
//! use depends on its manifest schema.

use crate::graph::DependencyGraph;
use crate::manifest::SchemaVersion;
use crate::options::{OptionValue, ResolvedConfiguration};
use crate::recipe::forward_slashes;
use crate::settings::SettingsAxis;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while generating build configuration.
#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("unsupported generator '{name}' for schema {schema}, expected one of: {}", .expected.join(", "))]
    Unsupported {
        name: String,
        schema: SchemaVersion,
        expected: Vec<&'static str>,
    },

    #[error("definition '{name}' cannot be written to a cache-variables file: {reason}")]
    InvalidDefinition { name: String, reason: &'static str },

    #[error("malformed cache variable on line {line}: '{text}'")]
    MalformedCacheLine { line: usize, text: String },

    #[error("failed to write '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Backend variables a recipe asks for, as described by
/// [`crate::Recipe::describe_configuration`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationPlan {
    pub definitions: BTreeMap<String, OptionValue>,
}

/// The kind of file a generator produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeneratorKind {
    /// A CMake toolchain file carrying the settings.
    Toolchain,
    /// A flat `NAME=value` file of cache variables.
    CacheVariables,
    /// A CMake shim that makes dependencies findable.
    FindPackage,
}

impl GeneratorKind {
    /// The file this kind writes.
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Toolchain => "kiln_toolchain.cmake",
            Self::CacheVariables => "kiln_cache.txt",
            Self::FindPackage => "kiln_paths.cmake",
        }
    }

    fn renderer(self) -> &'static dyn Generator {
        match self {
            Self::Toolchain => &ToolchainGenerator,
            Self::CacheVariables => &CacheVariablesGenerator,
            Self::FindPackage => &FindPackageGenerator,
        }
    }
}

impl fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Toolchain => f.write_str("toolchain"),
            Self::CacheVariables => f.write_str("cache-variables"),
            Self::FindPackage => f.write_str("find-package"),
        }
    }
}

/// Generator names understood by each schema, and the kinds they expand to.
const SCHEMA_1_GENERATORS: &[(&str, &[GeneratorKind])] = &[
    (
        "cmake",
        &[GeneratorKind::Toolchain, GeneratorKind::CacheVariables],
    ),
    ("cmake_paths", &[GeneratorKind::FindPackage]),
];

const SCHEMA_2_GENERATORS: &[(&str, &[GeneratorKind])] = &[
    ("toolchain", &[GeneratorKind::Toolchain]),
    ("cache_variables", &[GeneratorKind::CacheVariables]),
    ("find_package", &[GeneratorKind::FindPackage]),
];

/// The kinds a generator name produces under a schema.
pub fn generator_kinds(
    schema: SchemaVersion,
    name: &str,
) -> Result<&'static [GeneratorKind], GenerateError> {
    let table = match schema {
        SchemaVersion::V1 => SCHEMA_1_GENERATORS,
        SchemaVersion::V2 => SCHEMA_2_GENERATORS,
    };
    table
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, kinds)| *kinds)
        .ok_or_else(|| GenerateError::Unsupported {
            name: name.to_string(),
            schema,
            expected: table.iter().map(|(known, _)| *known).collect(),
        })
}

/// One generated file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedArtifact {
    pub kind: GeneratorKind,
    pub file_name: String,
    pub contents: String,
}

/// Generated files in generator order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedArtifactSet {
    artifacts: Vec<GeneratedArtifact>,
}

impl GeneratedArtifactSet {
    /// Append an artifact.
    pub fn push(&mut self, artifact: GeneratedArtifact) {
        self.artifacts.push(artifact);
    }

    /// All artifacts, in the order they were generated.
    pub fn iter(&self) -> impl Iterator<Item = &GeneratedArtifact> {
        self.artifacts.iter()
    }

    /// The effective artifact for a file name: the last one generated.
    #[must_use]
    pub fn get(&self, file_name: &str) -> Option<&GeneratedArtifact> {
        self.artifacts.iter().rev().find(|a| a.file_name == file_name)
    }

    /// The effective artifact of a kind.
    #[must_use]
    pub fn of_kind(&self, kind: GeneratorKind) -> Option<&GeneratedArtifact> {
        self.artifacts.iter().rev().find(|a| a.kind == kind)
    }

    /// Number of artifacts, superseded ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Returns true if nothing was generated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Write the artifacts into `dir` in order, so later artifacts replace
    /// earlier ones with the same file name. Returns the written paths in
    /// first-write order.
    pub fn write_to(&self, dir: &Path) -> Result<Vec<PathBuf>, GenerateError> {
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| GenerateError::Io { path, source }
        };
        fs::create_dir_all(dir).map_err(io(dir))?;

        let mut written: Vec<PathBuf> = Vec::new();
        for artifact in &self.artifacts {
            let path = dir.join(&artifact.file_name);
            fs::write(&path, &artifact.contents).map_err(io(&path))?;
            debug!("Wrote {} ({})", path.display(), artifact.kind);
            if !written.contains(&path) {
                written.push(path);
            }
        }
        Ok(written)
    }
}

/// Everything a generator may read.
#[derive(Debug, Clone, Copy)]
pub struct GeneratorContext<'a> {
    pub config: &'a ResolvedConfiguration,
    pub graph: &'a DependencyGraph,
    pub plan: &'a ConfigurationPlan,
}

/// Renders one kind of artifact.
pub trait Generator: Sync {
    /// The kind of artifact produced.
    fn kind(&self) -> GeneratorKind;

    /// Render the artifact's contents.
    fn render(&self, ctx: &GeneratorContext<'_>) -> Result<String, GenerateError>;
}

/// Run the named generators in order.
///
/// Every name is checked before anything is rendered, so an unsupported
/// name never yields a partial artifact set.
pub fn generate(
    ctx: &GeneratorContext<'_>,
    schema: SchemaVersion,
    names: &[String],
) -> Result<GeneratedArtifactSet, GenerateError> {
    let kinds = names
        .iter()
        .map(|name| generator_kinds(schema, name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut set = GeneratedArtifactSet::default();
    for kind in kinds.into_iter().flatten() {
        let generator = kind.renderer();
        set.push(GeneratedArtifact {
            kind: generator.kind(),
            file_name: kind.file_name().to_string(),
            contents: generator.render(ctx)?,
        });
    }
    Ok(set)
}

fn header(out: &mut String, ctx: &GeneratorContext<'_>) {
    let _ = writeln!(
        out,
        "# Generated by kiln for {}. Do not edit.",
        ctx.config.identity()
    );
}

/// Quote a value for a CMake `set()` call.
fn cmake_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' | '$' => {
                quoted.push('\\');
                quoted.push(c);
            }
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

struct ToolchainGenerator;

impl ToolchainGenerator {
    fn system_name(os: &str) -> &str {
        match os {
            "Macos" => "Darwin",
            other => other,
        }
    }

    fn processor(arch: &str) -> &str {
        match arch {
            "armv8" => "aarch64",
            "armv7" => "armv7-a",
            "x86" => "i686",
            other => other,
        }
    }

    fn compilers(compiler: &str) -> Option<(&'static str, &'static str)> {
        match compiler {
            "gcc" => Some(("gcc", "g++")),
            "clang" | "apple-clang" => Some(("clang", "clang++")),
            "msvc" | "Visual Studio" => Some(("cl", "cl")),
            _ => None,
        }
    }
}

impl Generator for ToolchainGenerator {
    fn kind(&self) -> GeneratorKind {
        GeneratorKind::Toolchain
    }

    fn render(&self, ctx: &GeneratorContext<'_>) -> Result<String, GenerateError> {
        let settings = ctx.config.settings();
        let mut out = String::new();
        header(&mut out, ctx);

        if let Some(build_type) = settings.get(SettingsAxis::BuildType) {
            let _ = writeln!(
                out,
                "set(CMAKE_BUILD_TYPE {} CACHE STRING \"\" FORCE)",
                cmake_quote(build_type)
            );
        }
        if let Some(os) = settings.get(SettingsAxis::Os) {
            let _ = writeln!(
                out,
                "set(CMAKE_SYSTEM_NAME {})",
                cmake_quote(Self::system_name(os))
            );
        }
        if let Some(arch) = settings.get(SettingsAxis::Arch) {
            let _ = writeln!(
                out,
                "set(CMAKE_SYSTEM_PROCESSOR {})",
                cmake_quote(Self::processor(arch))
            );
        }
        if let Some(compiler) = settings.get(SettingsAxis::Compiler) {
            let _ = writeln!(out, "set(KILN_COMPILER {})", cmake_quote(compiler));
            if let Some((c, cxx)) = Self::compilers(compiler) {
                let _ = writeln!(out, "set(CMAKE_C_COMPILER {})", cmake_quote(c));
                let _ = writeln!(out, "set(CMAKE_CXX_COMPILER {})", cmake_quote(cxx));
            }
        }
        let _ = writeln!(
            out,
            "set(KILN_PACKAGE_ID {})",
            cmake_quote(&ctx.config.package_id())
        );
        Ok(out)
    }
}

struct CacheVariablesGenerator;

impl Generator for CacheVariablesGenerator {
    fn kind(&self) -> GeneratorKind {
        GeneratorKind::CacheVariables
    }

    fn render(&self, ctx: &GeneratorContext<'_>) -> Result<String, GenerateError> {
        let mut out = String::new();
        for (name, value) in &ctx.plan.definitions {
            if name.is_empty() || name.contains(['=', '\n', '\r']) || name.trim() != name {
                return Err(GenerateError::InvalidDefinition {
                    name: name.clone(),
                    reason: "names cannot be empty or contain '=', line breaks or surrounding spaces",
                });
            }
            let value = value.to_string();
            if value.contains(['\n', '\r']) {
                return Err(GenerateError::InvalidDefinition {
                    name: name.clone(),
                    reason: "values cannot contain line breaks",
                });
            }
            let _ = writeln!(out, "{name}={value}");
        }
        Ok(out)
    }
}

/// Read a cache-variables file back. `True` and `False` become booleans;
/// blank lines and `#` comments are skipped.
pub fn parse_cache_variables(text: &str) -> Result<BTreeMap<String, OptionValue>, GenerateError> {
    let mut variables = BTreeMap::new();
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, value) = line
            .split_once('=')
            .filter(|(name, _)| !name.is_empty())
            .ok_or_else(|| GenerateError::MalformedCacheLine {
                line: number + 1,
                text: line.to_string(),
            })?;
        let value = match value {
            "True" => OptionValue::Bool(true),
            "False" => OptionValue::Bool(false),
            other => OptionValue::Str(other.to_string()),
        };
        variables.insert(name.to_string(), value);
    }
    Ok(variables)
}

struct FindPackageGenerator;

impl FindPackageGenerator {
    fn variable_name(package: &str) -> String {
        let upper: String = package
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("KILN_{upper}_ROOT")
    }
}

impl Generator for FindPackageGenerator {
    fn kind(&self) -> GeneratorKind {
        GeneratorKind::FindPackage
    }

    fn render(&self, ctx: &GeneratorContext<'_>) -> Result<String, GenerateError> {
        let mut out = String::new();
        header(&mut out, ctx);

        let mut roots = Vec::new();
        for node in ctx.graph.dependencies() {
            let Some(output) = node.output.as_deref() else {
                let _ = writeln!(out, "# {} has no package output", node.identity);
                continue;
            };
            let root = forward_slashes(output);
            let _ = writeln!(
                out,
                "set({} {})",
                Self::variable_name(&node.identity.name),
                cmake_quote(&root)
            );
            roots.push(cmake_quote(&root));
        }

        if !roots.is_empty() {
            let joined = roots.join(" ");
            let _ = writeln!(
                out,
                "set(CMAKE_MODULE_PATH {joined} ${{CMAKE_MODULE_PATH}})"
            );
            let _ = writeln!(
                out,
                "set(CMAKE_PREFIX_PATH {joined} ${{CMAKE_PREFIX_PATH}})"
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{resolve, OptionOverrides, OptionSchema};
    use crate::reference::PackageIdentity;
    use crate::settings::Settings;

    fn config(name: &str, settings: &Settings) -> ResolvedConfiguration {
        resolve(
            &PackageIdentity::new(name, "1.0"),
            &OptionSchema::new(),
            &OptionOverrides::new(),
            settings,
        )
        .unwrap()
    }

    fn fixture() -> (ResolvedConfiguration, DependencyGraph, ConfigurationPlan) {
        let settings = Settings::new()
            .with(SettingsAxis::Os, "Macos")
            .unwrap()
            .with(SettingsAxis::BuildType, "Release")
            .unwrap()
            .with(SettingsAxis::Arch, "armv8")
            .unwrap()
            .with(SettingsAxis::Compiler, "clang")
            .unwrap();
        let root = config("2d", &settings);
        let mut graph = DependencyGraph::new(root.clone(), None);
        graph.add_node(
            config("glad", &settings),
            Some(PathBuf::from("/store/glad/package")),
            vec!["2d".into(), "glad".into()],
        );
        graph.add_node(
            config("math", &settings),
            Some(PathBuf::from("/store/math/package")),
            vec!["2d".into(), "math".into()],
        );
        let plan = ConfigurationPlan {
            definitions: BTreeMap::from([
                ("BUILD_tests".to_string(), OptionValue::Bool(false)),
                ("BUILD_SHARED_LIBS".to_string(), OptionValue::Bool(true)),
                (
                    "CMAKE_PROJECT_2d_INCLUDE".to_string(),
                    OptionValue::from("/src/cmake/conan/customconan.cmake"),
                ),
            ]),
        };
        (root, graph, plan)
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn toolchain_maps_settings() {
        let (config, graph, plan) = fixture();
        let ctx = GeneratorContext {
            config: &config,
            graph: &graph,
            plan: &plan,
        };
        let set = generate(&ctx, SchemaVersion::V2, &names(&["toolchain"])).unwrap();
        let toolchain = &set.of_kind(GeneratorKind::Toolchain).unwrap().contents;
        assert!(toolchain.contains("set(CMAKE_BUILD_TYPE \"Release\" CACHE STRING \"\" FORCE)"));
        assert!(toolchain.contains("set(CMAKE_SYSTEM_NAME \"Darwin\")"));
        assert!(toolchain.contains("set(CMAKE_SYSTEM_PROCESSOR \"aarch64\")"));
        assert!(toolchain.contains("set(CMAKE_CXX_COMPILER \"clang++\")"));
    }

    #[test]
    fn cache_variables_are_sorted_and_round_trip() {
        let (config, graph, plan) = fixture();
        let ctx = GeneratorContext {
            config: &config,
            graph: &graph,
            plan: &plan,
        };
        let set = generate(&ctx, SchemaVersion::V2, &names(&["cache_variables"])).unwrap();
        let text = &set.get("kiln_cache.txt").unwrap().contents;
        assert_eq!(
            text,
            "BUILD_SHARED_LIBS=True\nBUILD_tests=False\nCMAKE_PROJECT_2d_INCLUDE=/src/cmake/conan/customconan.cmake\n"
        );
        assert_eq!(parse_cache_variables(text).unwrap(), plan.definitions);
    }

    #[test]
    fn find_package_lists_dependencies_in_graph_order() {
        let (config, graph, plan) = fixture();
        let ctx = GeneratorContext {
            config: &config,
            graph: &graph,
            plan: &plan,
        };
        let set = generate(&ctx, SchemaVersion::V2, &names(&["find_package"])).unwrap();
        let shim = &set.of_kind(GeneratorKind::FindPackage).unwrap().contents;
        assert!(shim.contains("set(KILN_GLAD_ROOT \"/store/glad/package\")"));
        assert!(shim.contains(
            "set(CMAKE_PREFIX_PATH \"/store/glad/package\" \"/store/math/package\" ${CMAKE_PREFIX_PATH})"
        ));
    }

    #[test]
    fn schema_1_names() {
        let (config, graph, plan) = fixture();
        let ctx = GeneratorContext {
            config: &config,
            graph: &graph,
            plan: &plan,
        };
        let set = generate(&ctx, SchemaVersion::V1, &names(&["cmake_paths", "cmake"])).unwrap();
        let kinds: Vec<_> = set.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            [
                GeneratorKind::FindPackage,
                GeneratorKind::Toolchain,
                GeneratorKind::CacheVariables
            ]
        );
    }

    #[test]
    fn unknown_generator_fails_without_partial_output() {
        let (config, graph, plan) = fixture();
        let ctx = GeneratorContext {
            config: &config,
            graph: &graph,
            plan: &plan,
        };
        let err = generate(&ctx, SchemaVersion::V2, &names(&["toolchain", "cmake"])).unwrap_err();
        assert!(matches!(err, GenerateError::Unsupported { ref name, .. } if name == "cmake"));

        let err = generate(&ctx, SchemaVersion::V1, &names(&["premake"])).unwrap_err();
        assert!(err.to_string().contains("cmake_paths"));
    }

    #[test]
    fn later_artifact_overrides_earlier_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut set = GeneratedArtifactSet::default();
        for contents in ["first", "second"] {
            set.push(GeneratedArtifact {
                kind: GeneratorKind::CacheVariables,
                file_name: "kiln_cache.txt".to_string(),
                contents: contents.to_string(),
            });
        }

        let written = set.write_to(tmp.path()).unwrap();
        assert_eq!(written, vec![tmp.path().join("kiln_cache.txt")]);
        assert_eq!(
            fs::read_to_string(tmp.path().join("kiln_cache.txt")).unwrap(),
            "second"
        );
        assert_eq!(set.get("kiln_cache.txt").unwrap().contents, "second");
    }

    #[test]
    fn malformed_cache_line() {
        assert!(matches!(
            parse_cache_variables("A=1\nnot a variable\n").unwrap_err(),
            GenerateError::MalformedCacheLine { line: 2, .. }
        ));
    }

    #[test]
    fn generation_is_deterministic() {
        let (config, graph, plan) = fixture();
        let ctx = GeneratorContext {
            config: &config,
            graph: &graph,
            plan: &plan,
        };
        let all = names(&["toolchain", "cache_variables", "find_package"]);
        assert_eq!(
            generate(&ctx, SchemaVersion::V2, &all).unwrap(),
            generate(&ctx, SchemaVersion::V2, &all).unwrap()
        );
    }
}
