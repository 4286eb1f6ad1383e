//! Implementation of the `kiln build` command.

use crate::context::ConfigArgs;
use anyhow::{Context, Result};
use kiln_recipe::{CMakeBackend, CancellationToken};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Options for the build command.
#[derive(Debug)]
pub struct BuildOptions {
    /// Build tree directory.
    pub build_dir: PathBuf,
    /// Where to stage the package; defaults to `<build_dir>/package`.
    pub package_dir: Option<PathBuf>,
    /// Stage into the package store and export the recipe alongside.
    pub export: bool,
    /// Abort the whole build after this many seconds.
    pub timeout: Option<u64>,
    /// The `cmake` executable.
    pub cmake: PathBuf,
    /// CMake generator name.
    pub generator: Option<String>,
    /// Parallel build jobs.
    pub jobs: Option<usize>,
}

/// Evaluate, build with CMake and stage the package.
pub fn build(args: &ConfigArgs, options: &BuildOptions) -> Result<()> {
    let invocation = args.load()?;
    let identity = invocation.recipe.identity().clone();

    let cancel = options
        .timeout
        .map(|secs| CancellationToken::with_timeout(Duration::from_secs(secs)))
        .unwrap_or_default();
    let pipeline = invocation.pipeline().with_cancellation(cancel);

    let evaluation = pipeline
        .evaluate(&invocation.recipe, &invocation.source_folder)
        .context("Failed to evaluate recipe")?;
    info!("Building {} ({})", identity, evaluation.package_id());

    let package_root = if options.export {
        invocation.source.package_dir(&identity).join("package")
    } else {
        options
            .package_dir
            .clone()
            .unwrap_or_else(|| options.build_dir.join("package"))
    };

    fs::create_dir_all(&options.build_dir)
        .with_context(|| format!("Failed to create {}", options.build_dir.display()))?;
    let build_dir = options
        .build_dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", options.build_dir.display()))?;

    let mut backend = CMakeBackend::new().with_program(&options.cmake);
    if let Some(generator) = &options.generator {
        backend = backend.with_generator(generator);
    }
    if let Some(jobs) = options.jobs {
        backend = backend.with_jobs(jobs);
    }

    let staged = pipeline
        .build(
            &evaluation,
            &backend,
            &invocation.source_folder,
            &build_dir,
            &package_root,
        )
        .with_context(|| format!("Failed to build {identity}"))?;

    if options.export {
        invocation
            .source
            .export(&invocation.recipe_path, &identity)
            .with_context(|| format!("Failed to export {identity}"))?;
        println!("Exported {} to {}", identity, invocation.source.root().display());
    }

    println!(
        "Built {} ({} file(s)) into {}",
        identity,
        staged.metadata.files.len(),
        staged.root.display()
    );
    Ok(())
}
