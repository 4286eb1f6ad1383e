//! Implementation of the `kiln graph` command.

use crate::context::ConfigArgs;
use anyhow::{Context, Result};
use clap::ValueEnum;
use kiln_recipe::{DependencyGraph, RequirementKind};
use std::fmt::Write as _;

/// Output format for the dependency graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum GraphFormat {
    /// An indented tree
    #[default]
    Text,
    /// The full graph as JSON
    Json,
}

/// Resolve and print the dependency graph.
pub fn show_graph(args: &ConfigArgs, format: GraphFormat) -> Result<()> {
    let invocation = args.load()?;
    let evaluation = invocation
        .pipeline()
        .evaluate(&invocation.recipe, &invocation.source_folder)
        .context("Failed to resolve dependency graph")?;

    for (package, option) in evaluation.graph.unmatched_overrides(&invocation.overrides) {
        eprintln!("warning: option {package}:{option} matches no package in the graph");
    }

    match format {
        GraphFormat::Text => print!("{}", render_tree(&evaluation.graph)),
        GraphFormat::Json => println!("{}", serde_json::to_string_pretty(&evaluation.graph)?),
    }
    Ok(())
}

/// Render the graph as a tree. A node reached a second time is printed
/// once more without its children.
pub fn render_tree(graph: &DependencyGraph) -> String {
    let mut out = String::new();
    let mut seen = vec![false; graph.len()];
    write_node(graph, 0, 0, None, &mut seen, &mut out);
    out
}

fn write_node(
    graph: &DependencyGraph,
    index: usize,
    depth: usize,
    kind: Option<RequirementKind>,
    seen: &mut [bool],
    out: &mut String,
) {
    let node = graph.node(index);
    let indent = "  ".repeat(depth);
    let suffix = if kind == Some(RequirementKind::Build) {
        " (build)"
    } else {
        ""
    };
    let repeat = if seen[index] { " (*)" } else { "" };
    let _ = writeln!(out, "{indent}{}{suffix}{repeat}", node.identity);
    if seen[index] {
        return;
    }
    seen[index] = true;

    for edge in &node.dependencies {
        write_node(graph, edge.target, depth + 1, Some(edge.kind), seen, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_recipe::{LocalPackageSource, Pipeline, Recipe, Settings, MANIFEST_FILE};
    use std::fs;
    use tempfile::TempDir;

    fn publish(store: &std::path::Path, name: &str, text: &str) {
        let dir = store.join(name).join("1.0").join("_").join("_");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), text).unwrap();
    }

    #[test]
    fn test_shared_dependency_is_expanded_once() {
        let store = TempDir::new().unwrap();
        publish(
            store.path(),
            "zlib",
            "schema = 2\n[package]\nname = \"zlib\"\nversion = \"1.0\"\n",
        );
        publish(
            store.path(),
            "png",
            "schema = 2\nrequires = [\"zlib/1.0\"]\n[package]\nname = \"png\"\nversion = \"1.0\"\n",
        );
        publish(
            store.path(),
            "cmake",
            "schema = 2\n[package]\nname = \"cmake\"\nversion = \"1.0\"\n",
        );
        let recipe = Recipe::parse(
            "schema = 2\nrequires = [\"png/1.0\", \"zlib/1.0\"]\nbuild-requires = [\"cmake/1.0\"]\n\
             [package]\nname = \"app\"\nversion = \"2.0\"\n",
        )
        .unwrap();
        let source = LocalPackageSource::new(store.path());
        let evaluation = Pipeline::new(&source, Settings::new())
            .evaluate(&recipe, store.path())
            .unwrap();

        assert_eq!(
            render_tree(&evaluation.graph),
            "app/2.0\n  png/1.0\n    zlib/1.0\n  zlib/1.0 (*)\n  cmake/1.0 (build)\n"
        );
    }
}
