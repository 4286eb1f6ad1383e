//! Arguments shared by every command that evaluates a recipe.

use anyhow::{bail, Context, Result};
use clap::Args;
use kiln_recipe::{
    LocalPackageSource, OptionOverrides, Pipeline, Profile, Recipe, Settings, MANIFEST_FILE,
};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the package store.
pub const STORE_ENV: &str = "KILN_STORE";

/// Recipe location and the inputs it is evaluated under.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Recipe file, or a directory containing kiln.toml
    #[arg(default_value = ".")]
    pub recipe: PathBuf,

    /// Setting as AXIS=VALUE (repeatable)
    #[arg(short = 's', long = "setting", value_name = "AXIS=VALUE")]
    pub settings: Vec<String>,

    /// Option as [PACKAGE:]OPTION=VALUE (repeatable)
    #[arg(short = 'o', long = "option", value_name = "[PKG:]OPT=VALUE")]
    pub options: Vec<String>,

    /// Profile file with settings and options
    #[arg(long)]
    pub profile: Option<PathBuf>,

    /// Package store to resolve dependencies from
    #[arg(long, env = STORE_ENV)]
    pub store: Option<PathBuf>,
}

/// A loaded recipe together with everything needed to evaluate it.
#[derive(Debug)]
pub struct Invocation {
    pub recipe_path: PathBuf,
    pub source_folder: PathBuf,
    pub recipe: Recipe,
    pub settings: Settings,
    pub overrides: OptionOverrides,
    pub source: LocalPackageSource,
}

impl Invocation {
    /// A pipeline over this invocation's store, settings and overrides.
    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(&self.source, self.settings.clone()).with_overrides(self.overrides.clone())
    }
}

impl ConfigArgs {
    /// Load the recipe and profile and merge command line values on top.
    ///
    /// Precedence, highest first: command line, profile, recipe defaults.
    pub fn load(&self) -> Result<Invocation> {
        let recipe_path = recipe_file(&self.recipe)?;
        let recipe = Recipe::from_path(&recipe_path)
            .with_context(|| format!("Failed to load recipe {}", recipe_path.display()))?;
        let root = recipe.identity().name.clone();

        let mut profile = match &self.profile {
            Some(path) => Profile::from_path(path)
                .with_context(|| format!("Failed to load profile {}", path.display()))?,
            None => Profile::default(),
        };
        profile
            .apply_settings(&self.settings)
            .context("Invalid setting")?;

        let mut overrides = profile.overrides(&root).context("Invalid profile option")?;
        for assignment in &self.options {
            overrides
                .apply_assignment(assignment, &root)
                .with_context(|| format!("Invalid option '{assignment}'"))?;
        }

        let store = match self.store.clone().or(profile.store) {
            Some(store) => store,
            None => default_store()?,
        };
        debug!("Using package store {}", store.display());

        let source_folder = recipe_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        Ok(Invocation {
            recipe_path,
            source_folder,
            recipe,
            settings: profile.settings,
            overrides,
            source: LocalPackageSource::new(store),
        })
    }
}

/// Resolve a recipe argument to an absolute file path.
fn recipe_file(path: &Path) -> Result<PathBuf> {
    let path = if path.is_dir() {
        path.join(MANIFEST_FILE)
    } else {
        path.to_path_buf()
    };
    if !path.is_file() {
        bail!("No recipe found at {}", path.display());
    }
    path.canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))
}

/// The per-user store under the platform data directory.
fn default_store() -> Result<PathBuf> {
    let Some(data) = dirs::data_dir() else {
        bail!("Could not determine a data directory; pass --store or set {STORE_ENV}");
    };
    Ok(data.join("kiln").join("store"))
}
