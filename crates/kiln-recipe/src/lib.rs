//! Package recipe evaluation for kiln.
//!
//! This crate provides:
//! - Parsing and validation of `kiln.toml` recipes (schemas 1 and 2)
//! - Settings, option schemas and deterministic option resolution
//! - Dependency graph construction against a package source
//! - Generation of CMake toolchain, cache and find-package files
//! - Import staging and atomic package staging with metadata
//! - A CMake build backend with timeouts and cancellation

mod backend;
mod cancel;
mod coalesce;
mod generate;
mod graph;
mod manifest;
mod options;
mod pipeline;
mod profile;
mod recipe;
mod reference;
mod settings;
mod source;
mod staging;

pub use backend::{BackendError, BuildBackend, BuildHandle, CMakeBackend};
pub use cancel::{CancelReason, CancellationToken, Cancelled};
pub use coalesce::ResolutionCache;
pub use generate::{
    generate, generator_kinds, parse_cache_variables, ConfigurationPlan, GenerateError,
    GeneratedArtifact, GeneratedArtifactSet, Generator, GeneratorContext, GeneratorKind,
};
pub use graph::{DependencyGraph, Edge, GraphBuilder, GraphError, GraphNode};
pub use manifest::{BuildPolicy, PinnedSource, SchemaVersion, ScmSource, MANIFEST_FILE};
pub use options::{
    resolve, ConditionalDefault, OptionDef, OptionDomain, OptionError, OptionOverrides,
    OptionSchema, OptionValue, ResolvedConfiguration,
};
pub use pipeline::{Evaluation, Pipeline, PipelineError};
pub use profile::{Profile, ProfileError};
pub use recipe::{
    Recipe, RecipeError, RecipeMetadata, Requirement, RequirementKind, SourceSpec,
};
pub use reference::{
    lenient_version, Channel, PackageIdentity, Reference, ReferenceError, VersionConstraint,
};
pub use settings::{Condition, Settings, SettingsAxis, SettingsError};
pub use source::{LocalPackageSource, PackageSource, SourceError, SourcePackage};
pub use staging::{
    plan_imports, stage_package, CopyOperation, FindMode, ImportPlan, ImportRule,
    LayoutCopy, PackageLayoutPlan, PackageMetadata, StagedFile, StagedPackage, StagingError,
    METADATA_FILE,
};
