//! Stage actions and their sequential executor.
//!
//! Every pipeline stage becomes a [`MigrationAction`]. The [`ActionExecutor`]
//! connects both endpoints, then runs the actions strictly in order. Item
//! failures never stop it; a stage-fatal error or cancellation does.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::content::ContentType;
use crate::endpoint::ContentEndpoint;
use crate::error::{Error, ErrorScope, ItemError, Result};
use crate::manifest::Manifest;
use crate::migrator::{ContentMigrator, MigrationContext, StageMigrator};

/// Outcome of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationActionResult {
    /// Content type of the stage.
    pub content_type: ContentType,
    /// Items returned by the source listing.
    pub listed: usize,
    /// Items published in this run.
    pub migrated: usize,
    /// Items excluded by a filter.
    pub skipped: usize,
    /// Items that failed in this run.
    pub failed: usize,
    /// Items left alone because an earlier run migrated them.
    pub already_migrated: usize,
    /// Items left alone because an earlier run failed them and
    /// `skip_failed` is set.
    pub previously_failed: usize,
    /// Listed items whose source id already appeared earlier in the same
    /// page; only the first occurrence is migrated.
    pub duplicates: usize,
    /// Publishes a dry run would have made.
    pub dry_run_publishes: usize,
    /// Per-item failures.
    pub errors: Vec<ItemError>,
    /// Whether the stage stopped because the run was cancelled.
    pub cancelled: bool,
    /// Error that aborted the stage.
    pub fatal_error: Option<ItemError>,
    /// Wall-clock duration.
    pub duration_secs: f64,
}

impl MigrationActionResult {
    /// Creates an empty result for `content_type`.
    #[must_use]
    pub fn new(content_type: ContentType) -> Self {
        Self {
            content_type,
            listed: 0,
            migrated: 0,
            skipped: 0,
            failed: 0,
            already_migrated: 0,
            previously_failed: 0,
            duplicates: 0,
            dry_run_publishes: 0,
            errors: Vec::new(),
            cancelled: false,
            fatal_error: None,
            duration_secs: 0.0,
        }
    }

    /// Whether the stage finished without a fatal error or cancellation.
    #[must_use]
    pub fn success(&self) -> bool {
        self.fatal_error.is_none() && !self.cancelled
    }

    /// Records an item failure.
    pub fn record_failure(&mut self, error: ItemError) {
        self.failed += 1;
        self.errors.push(error);
    }

    /// Records the error that aborted the stage; the first one wins.
    pub fn record_fatal(&mut self, error: ItemError) {
        if self.fatal_error.is_none() {
            self.fatal_error = Some(error);
        }
    }
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationStatus {
    /// Every stage finished and no item failed.
    Completed,
    /// Every stage finished; some items failed.
    CompletedWithErrors,
    /// A fatal error stopped the pipeline.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl MigrationStatus {
    /// Whether the CLI should exit successfully.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithErrors)
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    /// Overall status.
    pub status: MigrationStatus,
    /// Results of the stages that ran, in execution order.
    pub stages: Vec<MigrationActionResult>,
    /// Error that stopped the pipeline.
    pub fatal_error: Option<ItemError>,
    /// Wall-clock duration.
    pub duration_secs: f64,
}

impl MigrationResult {
    /// Result of a run that failed before any stage.
    #[must_use]
    pub fn failed_before_start(error: &Error) -> Self {
        let status = if matches!(error, Error::Cancelled) {
            MigrationStatus::Cancelled
        } else {
            MigrationStatus::Failed
        };
        Self {
            status,
            stages: Vec::new(),
            fatal_error: Some(ItemError::new("", "", error)),
            duration_secs: 0.0,
        }
    }

    /// Every item error across stages.
    pub fn errors(&self) -> impl Iterator<Item = &ItemError> {
        self.stages.iter().flat_map(|stage| stage.errors.iter())
    }

    /// Result of the stage for `content_type`.
    #[must_use]
    pub fn stage(&self, content_type: &str) -> Option<&MigrationActionResult> {
        self.stages
            .iter()
            .find(|stage| stage.content_type.as_str() == content_type)
    }

    /// Items migrated in this run across all stages.
    #[must_use]
    pub fn total_migrated(&self) -> usize {
        self.stages.iter().map(|stage| stage.migrated).sum()
    }

    /// Items failed in this run across all stages.
    #[must_use]
    pub fn total_failed(&self) -> usize {
        self.stages.iter().map(|stage| stage.failed).sum()
    }
}

/// A unit of work run by the executor.
#[async_trait]
pub trait MigrationAction: Send + Sync {
    /// Display name used in logs.
    fn name(&self) -> String;

    /// Runs the action.
    ///
    /// Item failures are reported inside the result. An `Err` is treated as
    /// fatal for the run.
    async fn execute(&self, cancel: &CancellationToken) -> Result<MigrationActionResult>;
}

/// Action migrating one content type.
pub struct MigrateContentAction {
    migrator: Box<dyn StageMigrator>,
}

impl MigrateContentAction {
    /// Wraps a stage migrator.
    #[must_use]
    pub fn new(migrator: Box<dyn StageMigrator>) -> Self {
        Self { migrator }
    }
}

#[async_trait]
impl MigrationAction for MigrateContentAction {
    fn name(&self) -> String {
        format!("migrate {}", self.migrator.content_type())
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<MigrationActionResult> {
        self.migrator.migrate(cancel).await
    }
}

/// Builds the migrator for a content type.
pub type MigratorFactory =
    Arc<dyn Fn(&ContentType, &MigrationContext) -> Result<Box<dyn StageMigrator>> + Send + Sync>;

/// Explicit mapping from content type to migrator factory.
///
/// Content types without a registration use [`ContentMigrator`].
#[derive(Default, Clone)]
pub struct MigratorRegistry {
    factories: HashMap<ContentType, MigratorFactory>,
}

impl MigratorRegistry {
    /// Creates a registry with no custom migrators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a custom migrator factory for `content_type`.
    pub fn register<F>(&mut self, content_type: impl Into<ContentType>, factory: F)
    where
        F: Fn(&ContentType, &MigrationContext) -> Result<Box<dyn StageMigrator>>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .insert(content_type.into(), Arc::new(factory));
    }

    /// Whether a custom factory is registered for `content_type`.
    #[must_use]
    pub fn has_custom(&self, content_type: &ContentType) -> bool {
        self.factories.contains_key(content_type)
    }

    /// Content types with a custom factory.
    pub fn custom_types(&self) -> impl Iterator<Item = &ContentType> {
        self.factories.keys()
    }

    /// Builds the migrator for `content_type`.
    ///
    /// # Errors
    ///
    /// Returns the error of a failing custom factory.
    pub fn create(
        &self,
        content_type: &ContentType,
        context: &MigrationContext,
    ) -> Result<Box<dyn StageMigrator>> {
        match self.factories.get(content_type) {
            Some(factory) => factory(content_type, context),
            None => Ok(Box::new(ContentMigrator::new(
                content_type.clone(),
                context.clone(),
            ))),
        }
    }
}

/// Runs actions sequentially.
pub struct ActionExecutor {
    endpoints: Vec<Arc<dyn ContentEndpoint>>,
    actions: Vec<Box<dyn MigrationAction>>,
    manifest: Option<Arc<Manifest>>,
}

impl ActionExecutor {
    /// Creates an executor that connects `endpoints` before running
    /// `actions` in order.
    #[must_use]
    pub fn new(
        endpoints: Vec<Arc<dyn ContentEndpoint>>,
        actions: Vec<Box<dyn MigrationAction>>,
    ) -> Self {
        Self {
            endpoints,
            actions,
            manifest: None,
        }
    }

    /// Records the error that stops a failed run in `manifest`.
    #[must_use]
    pub fn with_manifest(mut self, manifest: Arc<Manifest>) -> Self {
        self.manifest = Some(manifest);
        self
    }

    fn finish(&self, result: MigrationResult) -> MigrationResult {
        if let (Some(manifest), MigrationStatus::Failed, Some(fatal)) =
            (&self.manifest, result.status, &result.fatal_error)
        {
            manifest.add_errors([fatal.clone()]);
        }
        result
    }

    /// Runs every action until one fails fatally or `cancel` fires.
    pub async fn execute(&self, cancel: &CancellationToken) -> MigrationResult {
        let start = Instant::now();

        for endpoint in &self.endpoints {
            if let Err(e) = endpoint.connect(cancel).await {
                error!("Failed to connect to {} endpoint: {}", endpoint.endpoint_type(), e);
                let mut result = MigrationResult::failed_before_start(&e);
                result.duration_secs = start.elapsed().as_secs_f64();
                return self.finish(result);
            }
        }

        let mut stages = Vec::with_capacity(self.actions.len());
        let mut fatal_error = None;
        let mut cancelled = false;

        for action in &self.actions {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            info!("Running action: {}", action.name());
            match action.execute(cancel).await {
                Ok(result) => {
                    let stop = !result.success();
                    cancelled |= result.cancelled;
                    if let Some(fatal) = &result.fatal_error {
                        error!("{} aborted: {}", action.name(), fatal.message);
                        fatal_error = Some(fatal.clone());
                    }
                    stages.push(result);
                    if stop {
                        break;
                    }
                }
                Err(e) if e.scope() == ErrorScope::Cancelled => {
                    warn!("{} cancelled", action.name());
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    error!("{} failed: {}", action.name(), e);
                    fatal_error = Some(ItemError::new("", "", &e));
                    break;
                }
            }
        }

        let status = if cancelled {
            MigrationStatus::Cancelled
        } else if fatal_error.is_some() {
            MigrationStatus::Failed
        } else if stages.iter().any(|stage| stage.failed > 0) {
            MigrationStatus::CompletedWithErrors
        } else {
            MigrationStatus::Completed
        };

        self.finish(MigrationResult {
            status,
            stages,
            fatal_error,
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::MemoryEndpoint;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        outcome: fn(&'static str) -> Result<MigrationActionResult>,
    }

    #[async_trait]
    impl MigrationAction for Recorder {
        fn name(&self) -> String {
            self.name.to_string()
        }

        async fn execute(&self, _cancel: &CancellationToken) -> Result<MigrationActionResult> {
            self.log.lock().push(self.name);
            (self.outcome)(self.name)
        }
    }

    fn ok(name: &'static str) -> Result<MigrationActionResult> {
        Ok(MigrationActionResult::new(ContentType::new(name)))
    }

    fn with_item_failure(name: &'static str) -> Result<MigrationActionResult> {
        let mut result = MigrationActionResult::new(ContentType::new(name));
        result.record_failure(ItemError::new(name, "1", &Error::Validation("bad".to_string())));
        Ok(result)
    }

    fn fatal(name: &'static str) -> Result<MigrationActionResult> {
        let mut result = MigrationActionResult::new(ContentType::new(name));
        result.record_fatal(ItemError::new(
            name,
            "",
            &Error::Authentication("expired".to_string()),
        ));
        Ok(result)
    }

    fn executor(
        steps: &[(&'static str, fn(&'static str) -> Result<MigrationActionResult>)],
    ) -> (ActionExecutor, Arc<Mutex<Vec<&'static str>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let actions = steps
            .iter()
            .map(|(name, outcome)| {
                Box::new(Recorder {
                    name: *name,
                    log: Arc::clone(&log),
                    outcome: *outcome,
                }) as Box<dyn MigrationAction>
            })
            .collect();
        (ActionExecutor::new(Vec::new(), actions), log)
    }

    #[tokio::test]
    async fn test_actions_run_in_order() {
        let (executor, log) = executor(&[("Group", ok), ("User", ok)]);
        let result = executor.execute(&CancellationToken::new()).await;

        assert_eq!(result.status, MigrationStatus::Completed);
        assert_eq!(*log.lock(), vec!["Group", "User"]);
    }

    #[tokio::test]
    async fn test_item_failures_do_not_stop_pipeline() {
        let (executor, log) = executor(&[("Group", with_item_failure), ("User", ok)]);
        let result = executor.execute(&CancellationToken::new()).await;

        assert_eq!(result.status, MigrationStatus::CompletedWithErrors);
        assert_eq!(log.lock().len(), 2);
        assert_eq!(result.errors().count(), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_pipeline() {
        let (executor, log) = executor(&[("Group", fatal), ("User", ok)]);
        let result = executor.execute(&CancellationToken::new()).await;

        assert_eq!(result.status, MigrationStatus::Failed);
        assert_eq!(*log.lock(), vec!["Group"]);
        assert!(result.fatal_error.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (executor, log) = executor(&[("Group", ok)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor.execute(&cancel).await;
        assert_eq!(result.status, MigrationStatus::Cancelled);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_runs_no_stage() {
        let endpoint = Arc::new(MemoryEndpoint::new("dst"));
        endpoint.set_unreachable(true);
        let log = Arc::new(Mutex::new(Vec::new()));
        let action = Box::new(Recorder {
            name: "Group",
            log: Arc::clone(&log),
            outcome: ok,
        }) as Box<dyn MigrationAction>;
        let executor = ActionExecutor::new(vec![endpoint as Arc<dyn ContentEndpoint>], vec![action]);

        let result = executor.execute(&CancellationToken::new()).await;
        assert_eq!(result.status, MigrationStatus::Failed);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_error_is_recorded_in_manifest() {
        let manifest = Arc::new(Manifest::in_memory());
        let (executor, _) = executor(&[("Group", fatal), ("User", ok)]);
        let executor = executor.with_manifest(Arc::clone(&manifest));

        executor.execute(&CancellationToken::new()).await;

        let errors = manifest.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "MIG-013");
        assert_eq!(errors[0].content_type, "Group");
    }

    #[tokio::test]
    async fn test_connect_failure_is_recorded_in_manifest() {
        let endpoint = Arc::new(MemoryEndpoint::new("dst"));
        endpoint.set_unreachable(true);
        let manifest = Arc::new(Manifest::in_memory());
        let executor = ActionExecutor::new(vec![endpoint as Arc<dyn ContentEndpoint>], Vec::new())
            .with_manifest(Arc::clone(&manifest));

        executor.execute(&CancellationToken::new()).await;
        assert_eq!(manifest.errors()[0].code, "MIG-014");
    }

    #[tokio::test]
    async fn test_item_failures_are_not_run_errors() {
        let manifest = Arc::new(Manifest::in_memory());
        let (executor, _) = executor(&[("Group", with_item_failure)]);
        let executor = executor.with_manifest(Arc::clone(&manifest));

        executor.execute(&CancellationToken::new()).await;
        assert!(manifest.errors().is_empty());
    }

    #[test]
    fn test_status_success() {
        assert!(MigrationStatus::CompletedWithErrors.is_success());
        assert!(!MigrationStatus::Cancelled.is_success());
    }
}
