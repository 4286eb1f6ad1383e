//! Import staging and package layout staging.
//!
//! Both stages work from explicit plans: [`plan_imports`] turns import rules
//! into a list of copy operations before anything is written, and
//! [`stage_package`] builds the complete package in a temporary directory
//! beside the install root before swapping it into place.

use crate::cancel::{CancellationToken, Cancelled};
use crate::graph::DependencyGraph;
use crate::options::OptionValue;
use crate::recipe::forward_slashes;
use crate::reference::PackageIdentity;
use crate::settings::{Condition, Settings};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the metadata file written at the root of a staged package.
pub const METADATA_FILE: &str = "kiln_package.toml";

/// Errors that can occur while staging files.
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("cannot import '{pattern}' from '{package}': {reason}")]
    ImportSourceMissing {
        package: String,
        pattern: String,
        reason: String,
    },

    #[error("invalid file pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize package metadata: {0}")]
    MetadataWrite(#[from] toml::ser::Error),

    #[error("failed to parse package metadata: {0}")]
    MetadataRead(#[from] toml::de::Error),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> StagingError + '_ {
    move |source| StagingError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// How consumers of a package should locate it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindMode {
    /// Consumers use a generated config-style find script.
    #[default]
    Config,
    /// Consumers use a module-style find script.
    Module,
    /// The package ships its own integration; nothing is generated.
    None,
}

impl fmt::Display for FindMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => f.write_str("config"),
            Self::Module => f.write_str("module"),
            Self::None => f.write_str("none"),
        }
    }
}

/// Files to copy from a dependency's output into the build tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRule {
    /// The dependency to copy from.
    pub package: String,
    /// Directory inside the dependency's output.
    pub src: PathBuf,
    /// Glob pattern relative to `src`.
    pub pattern: String,
    /// Build-tree-relative destination directory.
    pub dst: PathBuf,
    /// Settings under which the rule applies.
    pub when: Condition,
}

/// Files to copy from the build output into the package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutCopy {
    pub src: PathBuf,
    pub pattern: String,
    pub dst: PathBuf,
}

/// A checksummed file inside a staged package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagedFile {
    /// Package-relative path, always with `/` separators.
    pub path: String,
    pub sha256: String,
}

/// Metadata shipped with a staged package for downstream consumers.
///
/// Field order keeps plain values ahead of tables so the TOML form is
/// stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageMetadata {
    pub package_id: String,
    #[serde(default)]
    pub find_mode: FindMode,
    pub identity: PackageIdentity,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub options: BTreeMap<String, OptionValue>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub requires: Vec<PackageIdentity>,
    #[serde(default)]
    pub files: Vec<StagedFile>,
}

impl PackageMetadata {
    /// Read metadata from a file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, StagingError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(io_at(path))?;
        Ok(toml::from_str(&content)?)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }
}

/// The package layout a recipe describes for one configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageLayoutPlan {
    pub copies: Vec<LayoutCopy>,
    /// Metadata to ship; `files` is filled in during staging.
    pub metadata: PackageMetadata,
}

/// One file copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOperation {
    pub package: String,
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// The copies needed to satisfy a set of import rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportPlan {
    operations: Vec<CopyOperation>,
}

impl ImportPlan {
    /// The planned copies, in rule order.
    #[must_use]
    pub fn operations(&self) -> &[CopyOperation] {
        &self.operations
    }

    /// Returns true if nothing needs copying.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Number of planned copies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Perform the copies.
    ///
    /// Copies to different destinations run in parallel; copies to the same
    /// destination run in plan order, so the last rule wins. Every file is
    /// written beside its destination and renamed into place. If any copy
    /// fails or the token fires, files this call created are removed again;
    /// files it overwrote keep their new contents.
    ///
    /// Returns the distinct destination paths, sorted.
    pub fn execute(&self, cancel: &CancellationToken) -> Result<Vec<PathBuf>, StagingError> {
        let mut groups: BTreeMap<&Path, Vec<&CopyOperation>> = BTreeMap::new();
        for operation in &self.operations {
            groups
                .entry(operation.destination.as_path())
                .or_default()
                .push(operation);
        }

        let created: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());
        let result = groups.par_iter().try_for_each(|(destination, operations)| {
            for operation in operations {
                cancel.check()?;
                let existed = destination.exists();
                copy_atomic(&operation.source, destination)?;
                if !existed {
                    created.lock().push(destination.to_path_buf());
                }
            }
            Ok::<(), StagingError>(())
        });

        if let Err(err) = result {
            let created = created.into_inner();
            warn!(
                "Import staging failed, removing {} new file(s): {}",
                created.len(),
                err
            );
            for path in created {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
            return Err(err);
        }

        info!("Imported {} file(s)", groups.len());
        Ok(groups.into_keys().map(Path::to_path_buf).collect())
    }
}

/// Plan the copies for a set of import rules.
///
/// Every rule must resolve: its package must be a graph node with an output
/// location, and its pattern must match at least one file there.
pub fn plan_imports(
    rules: &[ImportRule],
    graph: &DependencyGraph,
    build_root: &Path,
) -> Result<ImportPlan, StagingError> {
    let mut operations = Vec::new();

    for rule in rules {
        let missing = |reason: String| StagingError::ImportSourceMissing {
            package: rule.package.clone(),
            pattern: rule.pattern.clone(),
            reason,
        };

        let node = graph
            .get(&rule.package)
            .ok_or_else(|| missing("package is not in the dependency graph".to_string()))?;
        let output = node
            .output
            .as_deref()
            .ok_or_else(|| missing("package has no output location".to_string()))?;

        let base = output.join(&rule.src);
        let matches = glob_files(&base, &rule.pattern)?;
        if matches.is_empty() {
            return Err(missing(format!(
                "pattern matched no files under '{}'",
                base.display()
            )));
        }

        debug!(
            "Import rule {}:{} matched {} file(s)",
            rule.package,
            rule.pattern,
            matches.len()
        );
        let dst = build_root.join(&rule.dst);
        for relative in matches {
            operations.push(CopyOperation {
                package: rule.package.clone(),
                source: base.join(&relative),
                destination: dst.join(&relative),
            });
        }
    }

    Ok(ImportPlan { operations })
}

/// A package staged into its install root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPackage {
    pub root: PathBuf,
    pub metadata: PackageMetadata,
}

/// Stage a package from a build output directory into `install_root`.
///
/// The package is assembled in a temporary directory next to the install
/// root and renamed into place once complete, replacing any previous
/// contents. Identical inputs produce byte-identical trees. Copy rules that
/// match nothing are logged and skipped.
pub fn stage_package(
    plan: &PackageLayoutPlan,
    build_output: &Path,
    install_root: &Path,
    cancel: &CancellationToken,
) -> Result<StagedPackage, StagingError> {
    let parent = match install_root.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(io_at(&parent))?;
    let staging = tempfile::Builder::new()
        .prefix(".kiln-stage-")
        .tempdir_in(&parent)
        .map_err(io_at(&parent))?;

    let mut files: BTreeMap<String, String> = BTreeMap::new();
    for copy in &plan.copies {
        cancel.check()?;
        let base = build_output.join(&copy.src);
        let matches = glob_files(&base, &copy.pattern)?;
        if matches.is_empty() {
            warn!(
                "Layout pattern '{}' matched nothing under {}",
                copy.pattern,
                base.display()
            );
            continue;
        }

        for relative in matches {
            let package_path = copy.dst.join(&relative);
            let key = forward_slashes(&package_path);
            if key == METADATA_FILE {
                warn!("Skipping {}: the name is reserved for package metadata", key);
                continue;
            }

            let target = staging.path().join(&package_path);
            if let Some(dir) = target.parent() {
                fs::create_dir_all(dir).map_err(io_at(dir))?;
            }
            let source = base.join(&relative);
            fs::copy(&source, &target).map_err(io_at(&source))?;
            files.insert(key, file_sha256(&target)?);
        }
    }

    cancel.check()?;
    let mut metadata = plan.metadata.clone();
    metadata.files = files
        .into_iter()
        .map(|(path, sha256)| StagedFile { path, sha256 })
        .collect();
    let metadata_path = staging.path().join(METADATA_FILE);
    fs::write(&metadata_path, metadata.to_toml_string()?).map_err(io_at(&metadata_path))?;

    // Last point where dropping `staging` cleans up after us
    cancel.check()?;
    replace_dir(staging.path(), install_root, &parent, |from, to| fs::rename(from, to))?;

    info!(
        "Staged {} ({} file(s)) into {}",
        metadata.identity,
        metadata.files.len(),
        install_root.display()
    );
    Ok(StagedPackage {
        root: install_root.to_path_buf(),
        metadata,
    })
}

/// Move `staged` to `install_root`.
///
/// A previous install is first renamed aside into a temporary directory
/// next to it. If the new tree cannot be renamed in, the previous install is
/// renamed back; it is only deleted once the new tree is in place.
fn replace_dir<F>(
    staged: &Path,
    install_root: &Path,
    parent: &Path,
    rename: F,
) -> Result<(), StagingError>
where
    F: Fn(&Path, &Path) -> io::Result<()>,
{
    if !install_root.exists() {
        return rename(staged, install_root).map_err(io_at(install_root));
    }

    let backup_dir = tempfile::Builder::new()
        .prefix(".kiln-previous-")
        .tempdir_in(parent)
        .map_err(io_at(parent))?;
    let backup = backup_dir.path().join("package");
    rename(install_root, &backup).map_err(io_at(install_root))?;

    if let Err(err) = rename(staged, install_root) {
        if let Err(restore) = rename(&backup, install_root) {
            let kept = backup_dir.keep();
            warn!(
                "Failed to restore the previous package, it remains at {}: {}",
                kept.join("package").display(),
                restore
            );
        }
        return Err(io_at(install_root)(err));
    }

    if let Err(e) = backup_dir.close() {
        warn!("Failed to remove the previous package: {}", e);
    }
    Ok(())
}

/// Files under `base` matching `pattern`, relative to `base`, sorted.
fn glob_files(base: &Path, pattern: &str) -> Result<Vec<PathBuf>, StagingError> {
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&base.to_string_lossy()),
        pattern
    );
    let entries = glob::glob(&full).map_err(|e| StagingError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| StagingError::Io {
            path: e.path().to_path_buf(),
            source: e.into_error(),
        })?;
        if !path.is_file() {
            continue;
        }
        match path.strip_prefix(base) {
            Ok(relative)
                if relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_))) =>
            {
                files.push(relative.to_path_buf());
            }
            _ => warn!("Ignoring {}: not below {}", path.display(), base.display()),
        }
    }
    files.sort();
    Ok(files)
}

/// Copy one file by writing a temp file beside the destination and
/// renaming it over the destination.
fn copy_atomic(source: &Path, destination: &Path) -> Result<(), StagingError> {
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_at(parent))?;

    let mut input = File::open(source).map_err(io_at(source))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(io_at(parent))?;
    io::copy(&mut input, temp.as_file_mut()).map_err(io_at(destination))?;
    let permissions = input.metadata().map_err(io_at(source))?.permissions();
    fs::set_permissions(temp.path(), permissions).map_err(io_at(destination))?;

    temp.persist(destination)
        .map_err(|e| io_at(destination)(e.error))?;
    Ok(())
}

/// SHA-256 of a file's contents, hex encoded.
pub(crate) fn file_sha256(path: &Path) -> Result<String, StagingError> {
    let mut file = File::open(path).map_err(io_at(path))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(io_at(path))?;
    Ok(hex::encode(hasher.finalize()))
}
