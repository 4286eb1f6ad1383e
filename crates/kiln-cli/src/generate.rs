//! Implementation of the `kiln generate` command.

use crate::context::ConfigArgs;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Evaluate the recipe and write its generated files to `output_dir`.
pub fn generate_files(args: &ConfigArgs, output_dir: &Path) -> Result<()> {
    let invocation = args.load()?;
    let evaluation = invocation
        .pipeline()
        .evaluate(&invocation.recipe, &invocation.source_folder)
        .context("Failed to evaluate recipe")?;

    if evaluation.artifacts.is_empty() {
        println!("Recipe declares no generators; nothing written.");
        return Ok(());
    }

    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let written = evaluation
        .artifacts
        .write_to(output_dir)
        .with_context(|| format!("Failed to write artifacts to {}", output_dir.display()))?;

    println!(
        "Generated {} file(s) for {} (package ID {})",
        written.len(),
        invocation.recipe.identity(),
        evaluation.package_id()
    );
    for path in written {
        println!("  {}", path.display());
    }
    Ok(())
}
