//! Implementation of the `kiln inspect` command.

use crate::context::ConfigArgs;
use anyhow::{Context, Result};
use kiln_recipe::{resolve, SourceSpec};

/// Print a recipe's declarations and its resolved root configuration.
///
/// Dependencies are not resolved, so this works without a package store.
pub fn inspect(args: &ConfigArgs) -> Result<()> {
    let invocation = args.load()?;
    let recipe = &invocation.recipe;
    let meta = recipe.metadata();

    println!("{}", recipe.identity());
    println!("  schema: {}", recipe.schema().number());
    if let Some(description) = &meta.description {
        println!("  description: {description}");
    }
    if let Some(license) = &meta.license {
        println!("  license: {license}");
    }
    if let Some(author) = &meta.author {
        println!("  author: {author}");
    }
    if let Some(url) = &meta.url {
        println!("  url: {url}");
    }
    if !meta.topics.is_empty() {
        println!("  topics: {}", meta.topics.join(", "));
    }
    println!("  build policy: {}", meta.build_policy);
    match recipe.source() {
        SourceSpec::Local => {}
        SourceSpec::Scm(scm) => println!("  source: {} {} @ {}", scm.kind, scm.url, scm.revision),
        SourceSpec::Pinned(pinned) => match &pinned.revision {
            Some(revision) => println!("  source: {} @ {revision}", pinned.url),
            None => println!("  source: {}", pinned.url),
        },
    }

    if !recipe.settings().is_empty() {
        let axes: Vec<_> = recipe.settings().iter().map(ToString::to_string).collect();
        println!("  settings: {}", axes.join(", "));
    }
    if !recipe.generators().is_empty() {
        println!("  generators: {}", recipe.generators().join(", "));
    }

    if !recipe.requirements().is_empty() {
        println!("Requirements:");
        for requirement in recipe.requirements() {
            println!("  {} ({})", requirement.reference, requirement.kind);
        }
    }

    let root_settings = invocation.settings.restricted_to(recipe.settings());
    let config = resolve(
        recipe.identity(),
        recipe.options(),
        &invocation.overrides,
        &root_settings,
    )
    .context("Failed to resolve options")?;

    if !config.options().is_empty() {
        println!("Options:");
        for (name, value) in config.options() {
            println!("  {name} = {value}");
        }
    }
    println!("Package ID: {}", config.package_id());
    Ok(())
}
