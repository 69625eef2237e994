// Migration tool - pedantic lints relaxed for CLI ergonomics
#![allow(clippy::pedantic)]

//! # Content Migration Engine
//!
//! `content-migrate` is a CLI tool and library for moving content (users,
//! groups, projects, data sources, workbooks, ...) from a source endpoint to
//! a destination endpoint in dependency order.
//!
//! ## How a run works
//!
//! | Step | Component |
//! |------|-----------|
//! | Order content types so dependencies go first | [`PipelineDefinition`] |
//! | Run one action per content type, in order | [`ActionExecutor`] |
//! | Move each item through filter, mapping, transform and publish | [`ContentMigrator`] |
//! | Customize any of those steps | [`HookRegistry`] |
//! | Remember what was done, so a rerun resumes | [`Manifest`] |
//!
//! ## Quick Start
//!
//! ```bash
//! # Write an example configuration
//! content-migrate init --output migration.yaml
//!
//! # Start or resume
//! content-migrate run --config migration.yaml
//!
//! # Dry run (no publishing, no manifest writes)
//! content-migrate run --config migration.yaml --dry-run
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! source:
//!   type: json_dir
//!   path: ./export
//!
//! destination:
//!   type: json_dir
//!   path: ./import
//!
//! manifest: ./migration-manifest.json
//!
//! options:
//!   batch_size: 100
//!   workers: 4
//! ```

#![warn(missing_docs)]

pub mod action;
pub mod config;
pub mod content;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod files;
pub mod hooks;
pub mod manifest;
pub mod migrator;
pub mod pipeline;
pub mod retry;

pub use action::{
    ActionExecutor, MigrateContentAction, MigrationAction, MigrationActionResult,
    MigrationResult, MigrationStatus, MigratorRegistry,
};
pub use config::{EndpointConfig, MigrationConfig, MigrationOptions, RetryOptions};
pub use content::{
    ContentItem, ContentPage, ContentReference, ContentType, LinkedReference, PageRequest,
    PublishPayload,
};
pub use endpoint::{ContentEndpoint, JsonDirEndpoint, MemoryEndpoint};
pub use engine::{MigrationEngine, MigrationEngineBuilder};
pub use error::{Error, ErrorClass, ErrorScope, ItemError, Result};
pub use files::{
    ContentFile, ContentFileHandle, ContentFileStore, ContentFileStream, StagedFile,
    TemporaryDirectoryContentFileStore,
};
pub use hooks::{
    AsyncHook, FileContent, FileTransformer, FilterContext, Hook, HookError, HookKind,
    HookRegistry, HookRegistryBuilder, MappingContext, RegisteredHook, SyncHook,
};
pub use manifest::{EntryStatus, Manifest, ManifestEntry, StatusCounts};
pub use migrator::{ContentMigrator, MigrationContext, StageMigrator};
pub use pipeline::{PipelineDefinition, PipelineStageDefinition};
pub use retry::RetryConfig;
