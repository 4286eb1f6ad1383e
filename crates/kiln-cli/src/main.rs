//! kiln CLI - evaluate, configure, build and package kiln recipes

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod build;
mod context;
mod generate;
mod graph;
mod imports;
mod inspect;

use context::ConfigArgs;
use graph::GraphFormat;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version)]
#[command(about = "Evaluate package recipes and drive CMake builds", long_about = None)]
struct Cli {
    /// More log output (-v for debug, -vv for trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a recipe's declarations and resolved options
    Inspect {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Resolve and print the dependency graph
    Graph {
        #[command(flatten)]
        config: ConfigArgs,

        /// Output format
        #[arg(long, value_enum, default_value_t = GraphFormat::Text)]
        format: GraphFormat,
    },

    /// Write the generated build-system files
    Generate {
        #[command(flatten)]
        config: ConfigArgs,

        /// Directory to write into
        #[arg(long, default_value = "build")]
        output_dir: PathBuf,
    },

    /// Copy files from dependencies into the build tree
    Imports {
        #[command(flatten)]
        config: ConfigArgs,

        /// Build tree directory
        #[arg(long, default_value = "build")]
        build_dir: PathBuf,

        /// List the copies without performing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Configure, build and install with CMake, then stage the package
    Build {
        #[command(flatten)]
        config: ConfigArgs,

        /// Build tree directory
        #[arg(long, default_value = "build")]
        build_dir: PathBuf,

        /// Where to stage the package (defaults to <build-dir>/package)
        #[arg(long, conflicts_with = "export")]
        package_dir: Option<PathBuf>,

        /// Stage into the package store and export the recipe
        #[arg(long)]
        export: bool,

        /// Abort after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// CMake executable
        #[arg(long, default_value = "cmake")]
        cmake: PathBuf,

        /// CMake generator
        #[arg(short = 'G', long)]
        generator: Option<String>,

        /// Parallel build jobs
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Copy a recipe into the package store without building it
    Export {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Inspect { config } => inspect::inspect(&config)?,

        Commands::Graph { config, format } => graph::show_graph(&config, format)?,

        Commands::Generate { config, output_dir } => {
            generate::generate_files(&config, &output_dir)?;
        }

        Commands::Imports {
            config,
            build_dir,
            dry_run,
        } => imports::stage_imports(&config, &build_dir, dry_run)?,

        Commands::Build {
            config,
            build_dir,
            package_dir,
            export,
            timeout,
            cmake,
            generator,
            jobs,
        } => {
            let options = build::BuildOptions {
                build_dir,
                package_dir,
                export,
                timeout,
                cmake,
                generator,
                jobs,
            };
            build::build(&config, &options)?;
        }

        Commands::Export { config } => {
            let invocation = config.load()?;
            let identity = invocation.recipe.identity();
            let dir = invocation
                .source
                .export(&invocation.recipe_path, identity)
                .with_context(|| format!("Failed to export {identity}"))?;
            println!("Exported {} to {}", identity, dir.display());
        }
    }

    Ok(())
}
