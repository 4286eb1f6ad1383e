//! Package sources: where the graph builder finds dependencies.
//!
//! The builder only sees the [`PackageSource`] trait. [`LocalPackageSource`]
//! is the on-disk implementation, reading a store laid out as
//!
//! ```text
//! <root>/<name>/<version>/<user|_>/<channel|_>/kiln.toml
//! <root>/<name>/<version>/<user|_>/<channel|_>/package/
//! ```

use crate::cancel::{CancellationToken, Cancelled};
use crate::manifest::MANIFEST_FILE;
use crate::options::{OptionOverrides, OptionSchema};
use crate::recipe::{Recipe, Requirement};
use crate::reference::{lenient_version, Channel, PackageIdentity, Reference};
use crate::settings::SettingsAxis;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Placeholder directory name for a missing user or channel.
const NO_CHANNEL: &str = "_";

/// Errors a package source can report.
///
/// Cloneable so one failed lookup can be shared by every request that
/// waited on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("no package matches '{reference}'")]
    NotFound { reference: String },

    #[error("package '{package}' is invalid: {reason}")]
    Invalid { package: String, reason: String },

    #[error("failed to read package store at '{}': {reason}", path.display())]
    Io { path: PathBuf, reason: String },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// What a source returns for one resolved requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePackage {
    pub identity: PackageIdentity,
    /// Settings axes the package's configuration depends on.
    pub settings: Vec<SettingsAxis>,
    pub option_schema: OptionSchema,
    pub requirements: Vec<Requirement>,
    /// Overrides this package sets on its own dependencies.
    pub dependency_options: OptionOverrides,
    /// Where the package's files live, if it has been built.
    pub output: Option<PathBuf>,
}

impl SourcePackage {
    /// Describe a loaded recipe as a source package.
    #[must_use]
    pub fn from_recipe(recipe: &Recipe, output: Option<PathBuf>) -> Self {
        Self {
            identity: recipe.identity().clone(),
            settings: recipe.settings().to_vec(),
            option_schema: recipe.options().clone(),
            requirements: recipe.requirements().to_vec(),
            dependency_options: recipe.dependency_overrides(),
            output,
        }
    }
}

/// A provider of packages for the graph builder.
///
/// Implementations may be called concurrently for different references and
/// should return promptly once `cancel` fires.
pub trait PackageSource: Sync {
    /// Find the package that best satisfies `reference`.
    fn resolve(
        &self,
        reference: &Reference,
        cancel: &CancellationToken,
    ) -> Result<SourcePackage, SourceError>;
}

/// A package store on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalPackageSource {
    root: PathBuf,
}

impl LocalPackageSource {
    /// Open a store rooted at `root`. The directory need not exist yet.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory holding one package's recipe and `package/` output.
    #[must_use]
    pub fn package_dir(&self, identity: &PackageIdentity) -> PathBuf {
        let (user, channel) = match &identity.channel {
            Some(c) => (c.user.as_str(), c.channel.as_str()),
            None => (NO_CHANNEL, NO_CHANNEL),
        };
        self.root
            .join(&identity.name)
            .join(&identity.version)
            .join(user)
            .join(channel)
    }

    /// Copy a recipe into the store and return the directory its built
    /// package should be staged into.
    pub fn export(&self, recipe_path: &Path, identity: &PackageIdentity) -> Result<PathBuf, SourceError> {
        let dir = self.package_dir(identity);
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, &e))?;
        let target = dir.join(MANIFEST_FILE);
        fs::copy(recipe_path, &target).map_err(|e| io_error(recipe_path, &e))?;
        debug!("Exported {} to {}", identity, dir.display());
        Ok(dir.join("package"))
    }

    /// Versions present for a package, newest first. Numeric versions sort
    /// by semver; anything else sorts after them by name.
    fn versions(&self, name: &str) -> Result<Vec<String>, SourceError> {
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut versions = subdirectories(&dir)?;
        versions.sort_by(|a, b| match (lenient_version(a), lenient_version(b)) {
            (Some(va), Some(vb)) => vb.cmp(&va),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.cmp(b),
        });
        Ok(versions)
    }

    /// The channel directory to use for one version, if any.
    fn channel_dir(
        &self,
        version_dir: &Path,
        requested: Option<&Channel>,
    ) -> Result<Option<(PathBuf, Option<Channel>)>, SourceError> {
        if let Some(channel) = requested {
            let dir = version_dir.join(&channel.user).join(&channel.channel);
            return Ok(dir
                .join(MANIFEST_FILE)
                .is_file()
                .then(|| (dir, Some(channel.clone()))));
        }

        let plain = version_dir.join(NO_CHANNEL).join(NO_CHANNEL);
        if plain.join(MANIFEST_FILE).is_file() {
            return Ok(Some((plain, None)));
        }

        // Otherwise the first channel in name order
        for user in subdirectories(version_dir)? {
            for channel in subdirectories(&version_dir.join(&user))? {
                let dir = version_dir.join(&user).join(&channel);
                if dir.join(MANIFEST_FILE).is_file() {
                    let channel = (user != NO_CHANNEL && channel != NO_CHANNEL).then(|| Channel {
                        user: user.clone(),
                        channel,
                    });
                    return Ok(Some((dir, channel)));
                }
            }
        }
        Ok(None)
    }
}

impl PackageSource for LocalPackageSource {
    fn resolve(
        &self,
        reference: &Reference,
        cancel: &CancellationToken,
    ) -> Result<SourcePackage, SourceError> {
        cancel.check()?;

        let candidates = self
            .versions(&reference.name)?
            .into_iter()
            .filter(|version| reference.constraint.matches(version));

        for version in candidates {
            cancel.check()?;
            let version_dir = self.root.join(&reference.name).join(&version);
            let Some((dir, channel)) = self.channel_dir(&version_dir, reference.channel.as_ref())?
            else {
                continue;
            };

            let recipe = Recipe::from_path(dir.join(MANIFEST_FILE)).map_err(|e| SourceError::Invalid {
                package: format!("{}/{}", reference.name, version),
                reason: e.to_string(),
            })?;
            let declared = recipe.identity();
            if declared.name != reference.name || declared.version != version {
                return Err(SourceError::Invalid {
                    package: format!("{}/{}", reference.name, version),
                    reason: format!("recipe declares {declared}"),
                });
            }

            let output = dir.join("package");
            let output = output.is_dir().then_some(output);
            let mut package = SourcePackage::from_recipe(&recipe, output);
            package.identity = package.identity.with_channel(channel);
            debug!("Resolved {} to {}", reference, package.identity);
            return Ok(package);
        }

        Err(SourceError::NotFound {
            reference: reference.to_string(),
        })
    }
}

fn io_error(path: &Path, err: &std::io::Error) -> SourceError {
    SourceError::Io {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Names of the subdirectories of `dir`, sorted.
fn subdirectories(dir: &Path) -> Result<Vec<String>, SourceError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| io_error(dir, &e))? {
        let entry = entry.map_err(|e| io_error(dir, &e))?;
        if entry.path().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn add(store: &Path, name: &str, version: &str, channel: &str) {
        let dir = store.join(name).join(version).join(channel);
        fs::create_dir_all(dir.join("package")).unwrap();
        fs::write(
            dir.join(MANIFEST_FILE),
            format!("schema = 2\n[package]\nname = \"{name}\"\nversion = \"{version}\"\n"),
        )
        .unwrap();
    }

    fn resolve(source: &LocalPackageSource, reference: &str) -> Result<SourcePackage, SourceError> {
        source.resolve(&Reference::parse(reference).unwrap(), &CancellationToken::new())
    }

    #[test]
    fn exact_version() {
        let tmp = TempDir::new().unwrap();
        add(tmp.path(), "glad", "0.1.34", "_/_");
        let source = LocalPackageSource::new(tmp.path());

        let package = resolve(&source, "glad/0.1.34").unwrap();
        assert_eq!(package.identity, PackageIdentity::new("glad", "0.1.34"));
        assert_eq!(
            package.output,
            Some(tmp.path().join("glad/0.1.34/_/_/package"))
        );
    }

    #[test]
    fn range_picks_highest_match() {
        let tmp = TempDir::new().unwrap();
        for version in ["3.15.0", "3.16.2", "3.20", "4.0.0"] {
            add(tmp.path(), "cmake_installer", version, "_/_");
        }
        let source = LocalPackageSource::new(tmp.path());

        let package = resolve(&source, "cmake_installer/[>=3.16, <4]").unwrap();
        assert_eq!(package.identity.version, "3.20");
    }

    #[test]
    fn channel_is_honoured() {
        let tmp = TempDir::new().unwrap();
        add(tmp.path(), "glfw", "3.3", "bincrafters/stable");
        let source = LocalPackageSource::new(tmp.path());

        let package = resolve(&source, "glfw/3.3@bincrafters/stable").unwrap();
        assert_eq!(package.identity.to_string(), "glfw/3.3@bincrafters/stable");
        assert!(matches!(
            resolve(&source, "glfw/3.3@conan/stable"),
            Err(SourceError::NotFound { .. })
        ));
    }

    #[test]
    fn non_semver_versions_resolve_exactly() {
        let tmp = TempDir::new().unwrap();
        add(tmp.path(), "math", "local", "_/_");
        let source = LocalPackageSource::new(tmp.path());
        assert_eq!(resolve(&source, "math/local").unwrap().identity.version, "local");
    }

    #[test]
    fn missing_package_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let source = LocalPackageSource::new(tmp.path());
        assert_eq!(
            resolve(&source, "imgui/1.74").unwrap_err(),
            SourceError::NotFound {
                reference: "imgui/1.74".to_string()
            }
        );
    }

    #[test]
    fn mismatched_recipe_is_invalid() {
        let tmp = TempDir::new().unwrap();
        add(tmp.path(), "glad", "0.1.34", "_/_");
        fs::rename(tmp.path().join("glad/0.1.34"), tmp.path().join("glad/0.1.35")).unwrap();
        let source = LocalPackageSource::new(tmp.path());
        assert!(matches!(
            resolve(&source, "glad/0.1.35"),
            Err(SourceError::Invalid { .. })
        ));
    }

    #[test]
    fn cancelled_lookup() {
        let tmp = TempDir::new().unwrap();
        let source = LocalPackageSource::new(tmp.path());
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            source.resolve(&Reference::parse("glad/0.1.34").unwrap(), &token),
            Err(SourceError::Cancelled(_))
        ));
    }

    #[test]
    fn export_places_recipe() {
        let tmp = TempDir::new().unwrap();
        let recipe = tmp.path().join(MANIFEST_FILE);
        fs::write(&recipe, "schema = 2\n[package]\nname = \"2d\"\nversion = \"0.1.0\"\n").unwrap();
        let source = LocalPackageSource::new(tmp.path().join("store"));

        let output = source
            .export(&recipe, &PackageIdentity::new("2d", "0.1.0"))
            .unwrap();
        assert_eq!(output, tmp.path().join("store/2d/0.1.0/_/_/package"));
        assert!(tmp.path().join("store/2d/0.1.0/_/_").join(MANIFEST_FILE).is_file());
    }
}
