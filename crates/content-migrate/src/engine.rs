//! Start and resume entry point.
//!
//! ```rust,no_run
//! # async fn demo() -> content_migrate::Result<()> {
//! use std::sync::Arc;
//! use content_migrate::{JsonDirEndpoint, MigrationEngine, PipelineDefinition};
//! use tokio_util::sync::CancellationToken;
//!
//! let engine = MigrationEngine::builder()
//!     .pipeline(PipelineDefinition::standard())
//!     .source(Arc::new(JsonDirEndpoint::new("./export")))
//!     .destination(Arc::new(JsonDirEndpoint::new("./import")))
//!     .manifest_path("./migration-manifest.json")
//!     .build()?;
//!
//! let result = engine.run(&CancellationToken::new()).await;
//! println!("{:?}", result.status);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::action::{
    ActionExecutor, MigrateContentAction, MigrationAction, MigrationResult, MigratorRegistry,
};
use crate::config::{MigrationConfig, MigrationOptions};
use crate::content::ContentType;
use crate::endpoint::ContentEndpoint;
use crate::error::{Error, Result};
use crate::files::{ContentFileStore, TemporaryDirectoryContentFileStore};
use crate::hooks::HookRegistry;
use crate::manifest::Manifest;
use crate::migrator::{MigrationContext, StageMigrator};
use crate::pipeline::PipelineDefinition;
use crate::retry::RetryConfig;

enum ManifestSource {
    Path(PathBuf),
    Shared(Arc<Manifest>),
}

/// Collects everything a run needs and validates it in [`build`](Self::build).
#[derive(Default)]
pub struct MigrationEngineBuilder {
    pipeline: Option<PipelineDefinition>,
    source: Option<Arc<dyn ContentEndpoint>>,
    destination: Option<Arc<dyn ContentEndpoint>>,
    manifest: Option<ManifestSource>,
    hooks: Option<HookRegistry>,
    options: MigrationOptions,
    retry: Option<RetryConfig>,
    file_store: Option<Arc<dyn ContentFileStore>>,
    migrators: MigratorRegistry,
}

impl MigrationEngineBuilder {
    /// Sets the stage declarations; the standard pipeline is used otherwise.
    #[must_use]
    pub fn pipeline(mut self, pipeline: PipelineDefinition) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Sets the endpoint content is read from.
    #[must_use]
    pub fn source(mut self, source: Arc<dyn ContentEndpoint>) -> Self {
        self.source = Some(source);
        self
    }

    /// Sets the endpoint content is published to.
    #[must_use]
    pub fn destination(mut self, destination: Arc<dyn ContentEndpoint>) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Loads (or starts) the manifest at `path`.
    #[must_use]
    pub fn manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest = Some(ManifestSource::Path(path.into()));
        self
    }

    /// Uses an already loaded manifest.
    #[must_use]
    pub fn manifest(mut self, manifest: Arc<Manifest>) -> Self {
        self.manifest = Some(ManifestSource::Shared(manifest));
        self
    }

    /// Sets the hook registry.
    #[must_use]
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Sets run options.
    #[must_use]
    pub fn options(mut self, options: MigrationOptions) -> Self {
        self.options = options;
        self
    }

    /// Overrides the retry policy derived from the options.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the staging store for binary payloads.
    #[must_use]
    pub fn file_store(mut self, file_store: Arc<dyn ContentFileStore>) -> Self {
        self.file_store = Some(file_store);
        self
    }

    /// Registers a custom migrator for `content_type`.
    #[must_use]
    pub fn migrator_factory<F>(mut self, content_type: impl Into<ContentType>, factory: F) -> Self
    where
        F: Fn(&ContentType, &MigrationContext) -> Result<Box<dyn StageMigrator>>
            + Send
            + Sync
            + 'static,
    {
        self.migrators.register(content_type, factory);
        self
    }

    /// Validates the setup and resolves the stage order.
    ///
    /// No endpoint is contacted here; configuration errors surface before
    /// any content operation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid pipeline, hooks or
    /// migrators targeting content types outside the pipeline, missing
    /// endpoints, invalid options, or an unreadable manifest.
    pub fn build(self) -> Result<MigrationEngine> {
        self.options.validate()?;

        let pipeline = self.pipeline.unwrap_or_else(PipelineDefinition::standard);
        if pipeline.is_empty() {
            return Err(Error::Config("pipeline has no stages".to_string()));
        }
        let order = pipeline.resolve()?;

        let hooks = self.hooks.unwrap_or_default();
        if let Some(stray) = hooks
            .content_types()
            .into_iter()
            .find(|content_type| !pipeline.contains(content_type))
        {
            return Err(Error::Config(format!(
                "hooks are registered for '{stray}', which is not a pipeline stage"
            )));
        }
        if let Some(stray) = self
            .migrators
            .custom_types()
            .find(|content_type| !pipeline.contains(content_type))
        {
            return Err(Error::Config(format!(
                "a migrator is registered for '{stray}', which is not a pipeline stage"
            )));
        }

        let source = self
            .source
            .ok_or_else(|| Error::Config("no source endpoint configured".to_string()))?;
        let destination = self
            .destination
            .ok_or_else(|| Error::Config("no destination endpoint configured".to_string()))?;

        let manifest = match self.manifest {
            Some(ManifestSource::Shared(manifest)) => manifest,
            Some(ManifestSource::Path(path)) => Arc::new(Manifest::load(path)?),
            None => {
                warn!("No manifest path configured, progress will not survive restarts");
                Arc::new(Manifest::in_memory())
            }
        };

        let file_store = match self.file_store {
            Some(store) => store,
            None => Arc::new(TemporaryDirectoryContentFileStore::new(
                self.options.file_store_dir.as_deref(),
            )?),
        };

        let retry = self
            .retry
            .unwrap_or_else(|| self.options.retry.to_retry_config());

        Ok(MigrationEngine {
            order,
            context: MigrationContext {
                source,
                destination,
                manifest,
                hooks: Arc::new(hooks),
                file_store,
                options: self.options,
                retry,
            },
            migrators: self.migrators,
        })
    }
}

/// A validated migration, ready to start or resume.
pub struct MigrationEngine {
    order: Vec<ContentType>,
    context: MigrationContext,
    migrators: MigratorRegistry,
}

impl MigrationEngine {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> MigrationEngineBuilder {
        MigrationEngineBuilder::default()
    }

    /// Builds an engine from a configuration file's contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn from_config(config: &MigrationConfig, hooks: HookRegistry) -> Result<Self> {
        config.validate()?;
        Self::builder()
            .pipeline(config.pipeline())
            .source(config.source.build("source"))
            .destination(config.destination.build("destination"))
            .manifest_path(config.manifest.clone())
            .hooks(hooks)
            .options(config.options.clone())
            .build()
    }

    /// Stage order the run will follow.
    #[must_use]
    pub fn order(&self) -> &[ContentType] {
        &self.order
    }

    /// The manifest used by the run.
    #[must_use]
    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.context.manifest
    }

    /// Runs every stage in order, skipping work the manifest records as
    /// done.
    pub async fn run(&self, cancel: &CancellationToken) -> MigrationResult {
        let mut actions: Vec<Box<dyn MigrationAction>> = Vec::with_capacity(self.order.len());
        for content_type in &self.order {
            match self.migrators.create(content_type, &self.context) {
                Ok(migrator) => actions.push(Box::new(MigrateContentAction::new(migrator))),
                Err(e) => return MigrationResult::failed_before_start(&e),
            }
        }

        info!(
            "Starting migration: {} stages, {} workers, batch size {}{}",
            self.order.len(),
            self.context.options.workers,
            self.context.options.batch_size,
            if self.context.options.dry_run { " (dry run)" } else { "" }
        );

        let mut executor = ActionExecutor::new(
            vec![
                Arc::clone(&self.context.source),
                Arc::clone(&self.context.destination),
            ],
            actions,
        );
        if !self.context.options.dry_run {
            executor = executor.with_manifest(Arc::clone(&self.context.manifest));
        }
        let result = executor.execute(cancel).await;

        if !self.context.options.dry_run {
            if let Err(e) = self.context.manifest.save() {
                warn!("Failed to save manifest after run: {}", e);
            }
        }

        info!(
            "Migration finished with status {:?}: {} migrated, {} failed in {:.2}s",
            result.status,
            result.total_migrated(),
            result.total_failed(),
            result.duration_secs
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::MemoryEndpoint;
    use crate::hooks::{FilterContext, Hook, RegisteredHook};

    fn endpoints() -> (Arc<MemoryEndpoint>, Arc<MemoryEndpoint>) {
        (
            Arc::new(MemoryEndpoint::new("src")),
            Arc::new(MemoryEndpoint::new("dst")),
        )
    }

    #[test]
    fn test_cycle_is_rejected_at_build() {
        let (source, destination) = endpoints();
        let result = MigrationEngine::builder()
            .pipeline(
                PipelineDefinition::new()
                    .stage("A", &["B"])
                    .stage("B", &["A"]),
            )
            .source(source.clone())
            .destination(destination.clone())
            .build();

        assert!(matches!(result, Err(Error::CyclicDependency { .. })));
        assert_eq!(source.calls().total(), 0);
        assert_eq!(destination.calls().total(), 0);
    }

    #[test]
    fn test_hook_for_unknown_stage_is_rejected() {
        let (source, destination) = endpoints();
        let hooks = HookRegistry::builder()
            .add_filter(
                "Flow",
                RegisteredHook::new("f", Hook::from_fn(|ctx: FilterContext| Ok(ctx))),
            )
            .build()
            .unwrap();

        let result = MigrationEngine::builder()
            .source(source)
            .destination(destination)
            .hooks(hooks)
            .build();

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_endpoint_is_rejected() {
        let (source, _) = endpoints();
        let result = MigrationEngine::builder().source(source).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_default_pipeline_order() {
        let (source, destination) = endpoints();
        let engine = MigrationEngine::builder()
            .source(source)
            .destination(destination)
            .build()
            .unwrap();

        let order: Vec<&str> = engine.order().iter().map(ContentType::as_str).collect();
        assert_eq!(order, vec!["Group", "User", "Project", "DataSource", "Workbook"]);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let (source, destination) = endpoints();
        let result = MigrationEngine::builder()
            .source(source)
            .destination(destination)
            .options(MigrationOptions {
                workers: 0,
                ..MigrationOptions::default()
            })
            .build();
        assert!(result.is_err());
    }
}
