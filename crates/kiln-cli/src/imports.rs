//! Implementation of the `kiln imports` command.

use crate::context::ConfigArgs;
use anyhow::{Context, Result};
use std::path::Path;

/// Copy the recipe's imports into `build_dir`, or list them when `dry_run`.
pub fn stage_imports(args: &ConfigArgs, build_dir: &Path, dry_run: bool) -> Result<()> {
    let invocation = args.load()?;
    let pipeline = invocation.pipeline();
    let evaluation = pipeline
        .evaluate(&invocation.recipe, &invocation.source_folder)
        .context("Failed to evaluate recipe")?;

    if evaluation.imports.is_empty() {
        println!("No imports apply to this configuration.");
        return Ok(());
    }

    let plan = pipeline
        .plan_imports(&evaluation, build_dir)
        .context("Failed to plan imports")?;

    if dry_run {
        println!("Would import {} file(s):", plan.len());
        for op in plan.operations() {
            println!(
                "  [{}] {} -> {}",
                op.package,
                op.source.display(),
                op.destination.display()
            );
        }
        return Ok(());
    }

    let copied = plan
        .execute(pipeline.cancellation())
        .context("Failed to stage imports")?;
    println!("Imported {} file(s) into {}", copied.len(), build_dir.display());
    Ok(())
}
