//! End-to-end evaluation of a recipe.
//!
//! [`Pipeline::evaluate`] runs the pure part: resolve the root
//! configuration, build the dependency graph, describe the backend
//! configuration and render the generated artifacts. Nothing is written to
//! disk. [`Pipeline::stage_imports`], [`Pipeline::build`] and
//! [`Pipeline::stage`] perform the side effects afterwards.

use crate::backend::{BackendError, BuildBackend};
use crate::cancel::{CancellationToken, Cancelled};
use crate::generate::{generate, ConfigurationPlan, GenerateError, GeneratedArtifactSet, GeneratorContext};
use crate::graph::{DependencyGraph, GraphBuilder, GraphError};
use crate::options::{resolve, OptionError, OptionOverrides, ResolvedConfiguration};
use crate::recipe::{Recipe, RecipeError};
use crate::settings::Settings;
use crate::source::{PackageSource, SourcePackage};
use crate::staging::{
    plan_imports, stage_package, ImportPlan, ImportRule, PackageLayoutPlan, StagedPackage,
    StagingError,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Directory under the build tree that the backend installs into before
/// the package is staged.
const INSTALL_DIR: &str = "install";

/// Errors from any stage of the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Option(#[from] OptionError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// The result of evaluating one recipe under one set of inputs.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub config: ResolvedConfiguration,
    pub graph: DependencyGraph,
    pub plan: ConfigurationPlan,
    pub artifacts: GeneratedArtifactSet,
    pub imports: Vec<ImportRule>,
    pub layout: PackageLayoutPlan,
}

impl Evaluation {
    /// The root package's identifier.
    #[must_use]
    pub fn package_id(&self) -> String {
        self.config.package_id()
    }
}

/// Drives a recipe through evaluation, import staging, building and
/// packaging.
pub struct Pipeline<'a> {
    source: &'a dyn PackageSource,
    settings: Settings,
    overrides: OptionOverrides,
    cancel: CancellationToken,
}

impl<'a> Pipeline<'a> {
    /// A pipeline resolving dependencies from `source` under `settings`.
    #[must_use]
    pub fn new(source: &'a dyn PackageSource, settings: Settings) -> Self {
        Self {
            source,
            settings,
            overrides: OptionOverrides::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Caller option overrides, keyed by package name.
    #[must_use]
    pub fn with_overrides(mut self, overrides: OptionOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Token checked between stages and passed to every long-running step.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The token this pipeline observes.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Evaluate `recipe` whose sources live in `source_folder`.
    pub fn evaluate(&self, recipe: &Recipe, source_folder: &Path) -> Result<Evaluation, PipelineError> {
        self.cancel.check()?;
        let identity = recipe.identity();
        info!("Evaluating {}", identity);

        let root_settings = self.settings.restricted_to(recipe.settings());
        let config = resolve(identity, recipe.options(), &self.overrides, &root_settings)?;
        debug!("Root configuration: {}", config.canonical());

        let root = SourcePackage::from_recipe(recipe, None);
        let graph = GraphBuilder::new(self.source, self.settings.clone())
            .with_overrides(self.overrides.clone())
            .with_cancellation(self.cancel.clone())
            .build(&root, config.clone())?;

        self.cancel.check()?;
        let plan = recipe.describe_configuration(&config, &graph, source_folder)?;
        let ctx = GeneratorContext {
            config: &config,
            graph: &graph,
            plan: &plan,
        };
        let artifacts = generate(&ctx, recipe.schema(), recipe.generators())?;
        debug!("Generated {} artifact(s)", artifacts.len());

        let imports = recipe.describe_imports(&config, &graph);
        let layout = recipe.describe_package_layout(&config, &graph);

        Ok(Evaluation {
            config,
            graph,
            plan,
            artifacts,
            imports,
            layout,
        })
    }

    /// Plan the evaluation's imports into `build_root` without copying.
    pub fn plan_imports(&self, evaluation: &Evaluation, build_root: &Path) -> Result<ImportPlan, PipelineError> {
        Ok(plan_imports(&evaluation.imports, &evaluation.graph, build_root)?)
    }

    /// Copy the evaluation's imports into `build_root`.
    pub fn stage_imports(
        &self,
        evaluation: &Evaluation,
        build_root: &Path,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        let plan = self.plan_imports(evaluation, build_root)?;
        Ok(plan.execute(&self.cancel)?)
    }

    /// Stage imports, then configure, build and install with `backend`,
    /// then stage the installed files into `package_root`.
    pub fn build(
        &self,
        evaluation: &Evaluation,
        backend: &dyn BuildBackend,
        source_folder: &Path,
        build_dir: &Path,
        package_root: &Path,
    ) -> Result<StagedPackage, PipelineError> {
        self.stage_imports(evaluation, build_dir)?;

        self.cancel.check()?;
        let handle = backend.configure(&evaluation.artifacts, source_folder, build_dir, &self.cancel)?;
        backend.build(&handle, &self.cancel)?;

        let install_output = build_dir.join(INSTALL_DIR);
        backend.install(&handle, &install_output, &self.cancel)?;

        self.stage(evaluation, &install_output, package_root)
    }

    /// Stage already-installed files from `build_output` into `package_root`.
    pub fn stage(
        &self,
        evaluation: &Evaluation,
        build_output: &Path,
        package_root: &Path,
    ) -> Result<StagedPackage, PipelineError> {
        Ok(stage_package(
            &evaluation.layout,
            build_output,
            package_root,
            &self.cancel,
        )?)
    }
}
