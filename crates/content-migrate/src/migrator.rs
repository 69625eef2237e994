//! Per-stage content migration.
//!
//! [`ContentMigrator`] pages through the source listing of one content type
//! and moves every item through
//! `Pending -> Filter -> Mapping -> Transform -> Publish`, recording each
//! outcome in the manifest. Items run with bounded concurrency within a
//! batch; one item's failure never stops its siblings.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::MigrationActionResult;
use crate::config::MigrationOptions;
use crate::content::{
    ContentItem, ContentPage, ContentReference, ContentType, LinkedReference, PageRequest,
    PublishPayload,
};
use crate::endpoint::ContentEndpoint;
use crate::error::{Error, ErrorScope, ItemError, Result};
use crate::files::{ContentFileStore, StagedFile};
use crate::hooks::{HookRegistry, MappingContext};
use crate::manifest::{EntryStatus, Manifest, ManifestEntry};
use crate::retry::{with_retry, RetryConfig};

/// Everything a stage migrator needs, shared by all stages of a run.
#[derive(Clone)]
pub struct MigrationContext {
    /// Endpoint content is read from.
    pub source: Arc<dyn ContentEndpoint>,
    /// Endpoint content is published to.
    pub destination: Arc<dyn ContentEndpoint>,
    /// Progress ledger.
    pub manifest: Arc<Manifest>,
    /// Hook chains.
    pub hooks: Arc<HookRegistry>,
    /// Staging store for binary payloads.
    pub file_store: Arc<dyn ContentFileStore>,
    /// Run options.
    pub options: MigrationOptions,
    /// Retry policy for endpoint calls.
    pub retry: RetryConfig,
}

/// Migrates every item of one content type.
#[async_trait]
pub trait StageMigrator: Send + Sync {
    /// Content type handled by this migrator.
    fn content_type(&self) -> &ContentType;

    /// Runs the stage.
    ///
    /// Item failures and stage-fatal errors are reported in the result; an
    /// `Err` means the stage could not run at all.
    async fn migrate(&self, cancel: &CancellationToken) -> Result<MigrationActionResult>;
}

/// Final state of one item in this run.
#[derive(Debug)]
enum ItemOutcome {
    Migrated,
    Skipped,
    DryRun,
    Failed(ItemError),
    Cancelled,
    Fatal(ItemError),
}

/// Result of the processing steps before the outcome is recorded.
enum Processed {
    Published(ContentReference),
    Excluded,
    DryRun,
}

/// Default stage migrator.
pub struct ContentMigrator {
    content_type: ContentType,
    context: MigrationContext,
}

impl ContentMigrator {
    /// Creates a migrator for `content_type`.
    #[must_use]
    pub fn new(content_type: ContentType, context: MigrationContext) -> Self {
        Self {
            content_type,
            context,
        }
    }

    fn dry_run(&self) -> bool {
        self.context.options.dry_run
    }

    /// Lists page `page`, retrying transient failures.
    async fn list_page(
        &self,
        page: usize,
        cancel: &CancellationToken,
    ) -> Result<ContentPage> {
        let source = self.context.source.as_ref();
        let content_type = &self.content_type;
        let request = PageRequest {
            page,
            size: self.context.options.batch_size,
        };
        with_retry(&self.context.retry, "list", cancel, move || {
            source.list(content_type, request, cancel)
        })
        .await
    }

    /// Marks every listed item that still needs work as pending.
    ///
    /// Returns the items to process together with their entries.
    fn register_batch(
        &self,
        items: Vec<ContentItem>,
        result: &mut MigrationActionResult,
        progress: &ProgressBar,
    ) -> Result<Vec<(ContentItem, ManifestEntry)>> {
        let manifest = &self.context.manifest;
        let mut work = Vec::with_capacity(items.len());
        let mut seen = HashSet::with_capacity(items.len());

        for item in items {
            if !seen.insert(item.reference.id.clone()) {
                warn!(
                    content_type = %self.content_type,
                    source_id = %item.reference.id,
                    "Source listed the same item twice in one page, ignoring repeat"
                );
                result.duplicates += 1;
                progress.inc(1);
                continue;
            }
            let existing = manifest.find_by_source(&self.content_type, &item.reference);
            match existing.as_ref().map(|entry| entry.status) {
                Some(EntryStatus::Migrated) => {
                    result.already_migrated += 1;
                    progress.inc(1);
                    continue;
                }
                Some(EntryStatus::Failed) if self.context.options.skip_failed => {
                    result.previously_failed += 1;
                    progress.inc(1);
                    continue;
                }
                _ => {}
            }

            let mut entry = existing
                .unwrap_or_else(|| ManifestEntry::pending(item.reference.clone()))
                .restart();
            entry.source = item.reference.clone();
            if !self.dry_run() {
                manifest.upsert(&self.content_type, entry.clone())?;
            }
            work.push((item, entry));
        }

        Ok(work)
    }

    /// Runs one item to completion and records its outcome.
    async fn migrate_item(
        &self,
        listed: ContentItem,
        entry: ManifestEntry,
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        if cancel.is_cancelled() {
            return ItemOutcome::Cancelled;
        }
        let source_id = listed.reference.id.clone();

        let processed = self.process(&listed, &entry, cancel).await;
        let (entry, outcome) = match processed {
            Ok(Processed::Published(destination)) => {
                debug!(
                    content_type = %self.content_type,
                    source_id = %source_id,
                    destination_id = %destination.id,
                    "Item migrated"
                );
                (Some(entry.migrated(destination)), ItemOutcome::Migrated)
            }
            Ok(Processed::Excluded) => (Some(entry.skipped()), ItemOutcome::Skipped),
            Ok(Processed::DryRun) => (None, ItemOutcome::DryRun),
            Err(e) => {
                let record = ItemError::new(self.content_type.as_str(), &source_id, &e);
                match e.scope() {
                    ErrorScope::Cancelled => (None, ItemOutcome::Cancelled),
                    ErrorScope::Item => {
                        warn!(
                            content_type = %self.content_type,
                            source_id = %source_id,
                            "Item failed: {}", e
                        );
                        (Some(entry.failed(record.clone())), ItemOutcome::Failed(record))
                    }
                    ErrorScope::Stage => {
                        (Some(entry.failed(record.clone())), ItemOutcome::Fatal(record))
                    }
                }
            }
        };

        if let (Some(entry), false) = (entry, self.dry_run()) {
            if let Err(e) = self.context.manifest.upsert(&self.content_type, entry) {
                return ItemOutcome::Fatal(ItemError::new(
                    self.content_type.as_str(),
                    &source_id,
                    &e,
                ));
            }
        }
        outcome
    }

    async fn process(
        &self,
        listed: &ContentItem,
        entry: &ManifestEntry,
        cancel: &CancellationToken,
    ) -> Result<Processed> {
        let content_type = &self.content_type;
        let source = self.context.source.as_ref();
        let destination = self.context.destination.as_ref();
        let retry = &self.context.retry;
        let hooks = &self.context.hooks;

        let reference = &listed.reference;
        let item = with_retry(retry, "get", cancel, move || {
            source.get(content_type, reference, cancel)
        })
        .await?;
        let item = Arc::new(item);

        if !hooks
            .run_filters(content_type, Arc::clone(&item), cancel)
            .await?
        {
            return Ok(Processed::Excluded);
        }

        let references = self.map_references(&item, cancel).await?;

        let staged = if item.has_file {
            Some(self.stage_file(&item.reference, cancel).await?)
        } else {
            None
        };

        let mut payload = PublishPayload::from_item(content_type.clone(), &item);
        payload.references = references;
        payload.file = staged.as_ref().map(StagedFile::content_file);
        let payload = hooks.run_transformers(payload, cancel).await?;
        hooks.run_file_transformers(&payload, cancel).await?;

        if self.dry_run() {
            debug!(
                content_type = %content_type,
                source_id = %item.reference.id,
                "Dry run, not publishing"
            );
            return Ok(Processed::DryRun);
        }

        let payload = &payload;
        let known = match &entry.destination {
            Some(known) => Some(known.clone()),
            None => {
                with_retry(retry, "find", cancel, move || {
                    destination.find(content_type, &payload.location, &payload.name, cancel)
                })
                .await?
            }
        };
        let published = match &known {
            Some(known) => {
                with_retry(retry, "update", cancel, move || {
                    destination.update(known, payload, cancel)
                })
                .await?
            }
            None => {
                with_retry(retry, "create", cancel, move || {
                    destination.create(payload, cancel)
                })
                .await?
            }
        };

        drop(staged);
        Ok(Processed::Published(published))
    }

    /// Resolves every cross-reference to its destination identity.
    ///
    /// Mapping hooks are consulted first, then the manifest. Unresolved
    /// optional references are dropped.
    async fn map_references(
        &self,
        item: &ContentItem,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, LinkedReference>> {
        let mut resolved = BTreeMap::new();

        for (field, link) in &item.references {
            let context = MappingContext {
                content_type: self.content_type.clone(),
                field: field.clone(),
                referenced_type: link.content_type.clone(),
                source: link.reference.clone(),
                destination: None,
            };
            let mapped = match self.context.hooks.resolve_mapping(context, cancel).await? {
                Some(destination) => Some(destination),
                None => self
                    .context
                    .manifest
                    .destination_for(&link.content_type, &link.reference.id),
            };

            match mapped {
                Some(destination) => {
                    resolved.insert(
                        field.clone(),
                        LinkedReference {
                            content_type: link.content_type.clone(),
                            reference: destination,
                            required: link.required,
                        },
                    );
                }
                None if link.required => {
                    return Err(Error::MissingReference {
                        field: field.clone(),
                        content_type: link.content_type.to_string(),
                        source_id: link.reference.id.clone(),
                    });
                }
                None => {
                    debug!(
                        content_type = %self.content_type,
                        source_id = %item.reference.id,
                        field = %field,
                        "Dropping unresolved optional reference"
                    );
                }
            }
        }

        Ok(resolved)
    }

    /// Downloads the binary payload of an item into a staged file.
    async fn stage_file(
        &self,
        reference: &ContentReference,
        cancel: &CancellationToken,
    ) -> Result<StagedFile> {
        let staged = StagedFile::create(
            Arc::clone(&self.context.file_store),
            reference,
            &reference.name,
        )?;
        let source = self.context.source.as_ref();
        let content_type = &self.content_type;
        let target = &staged;

        let written = with_retry(&self.context.retry, "download", cancel, move || async move {
            let mut stream = target.open_write().await?;
            let written = source
                .download_file(content_type, reference, &mut stream, cancel)
                .await?;
            stream.shutdown().await?;
            Ok::<u64, Error>(written)
        })
        .await?;

        debug!(
            content_type = %content_type,
            source_id = %reference.id,
            bytes = written,
            "Staged content file"
        );
        Ok(staged)
    }

    fn checkpoint(&self, result: &mut MigrationActionResult, stage_cancel: &CancellationToken) {
        if self.dry_run() {
            return;
        }
        if let Err(e) = self
            .context
            .manifest
            .checkpoint(self.context.options.checkpoint_interval)
        {
            result.record_fatal(ItemError::new(self.content_type.as_str(), "", &e));
            stage_cancel.cancel();
        }
    }

    fn save(&self, result: &mut MigrationActionResult) {
        if self.dry_run() {
            return;
        }
        if let Err(e) = self.context.manifest.save() {
            result.record_fatal(ItemError::new(self.content_type.as_str(), "", &e));
        }
    }
}

#[async_trait]
impl StageMigrator for ContentMigrator {
    fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    async fn migrate(&self, cancel: &CancellationToken) -> Result<MigrationActionResult> {
        let start = Instant::now();
        let mut result = MigrationActionResult::new(self.content_type.clone());
        let progress = create_progress_bar(&self.content_type, self.context.options.show_progress);
        let stage_cancel = cancel.child_token();
        let workers = self.context.options.workers.max(1);

        info!("Migrating {}", self.content_type);

        let mut page = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let listed = match self.list_page(page, cancel).await {
                Ok(listed) => listed,
                Err(Error::Cancelled) => break,
                Err(e) => {
                    result.record_fatal(ItemError::new(self.content_type.as_str(), "", &e));
                    break;
                }
            };
            result.listed += listed.items.len();

            let work = match self.register_batch(listed.items, &mut result, &progress) {
                Ok(work) => work,
                Err(e) => {
                    result.record_fatal(ItemError::new(self.content_type.as_str(), "", &e));
                    break;
                }
            };

            let pending: Vec<_> = work
                .into_iter()
                .map(|(item, entry)| self.migrate_item(item, entry, &stage_cancel))
                .collect();
            let mut outcomes = stream::iter(pending).buffer_unordered(workers);

            while let Some(outcome) = outcomes.next().await {
                progress.inc(1);
                match outcome {
                    ItemOutcome::Migrated => result.migrated += 1,
                    ItemOutcome::Skipped => result.skipped += 1,
                    ItemOutcome::DryRun => result.dry_run_publishes += 1,
                    ItemOutcome::Failed(error) => result.record_failure(error),
                    ItemOutcome::Cancelled => {}
                    ItemOutcome::Fatal(error) => {
                        result.record_fatal(error);
                        stage_cancel.cancel();
                    }
                }
                self.checkpoint(&mut result, &stage_cancel);
            }
            drop(outcomes);

            self.save(&mut result);
            if result.fatal_error.is_some() || cancel.is_cancelled() || !listed.has_more {
                break;
            }
            page += 1;
        }

        result.cancelled = cancel.is_cancelled() && result.fatal_error.is_none();
        result.duration_secs = start.elapsed().as_secs_f64();
        progress.finish_and_clear();

        if result.cancelled {
            warn!(
                "{} cancelled: {} migrated before cancellation",
                self.content_type, result.migrated
            );
        } else {
            info!(
                "{} done: {} migrated, {} skipped, {} failed, {} already migrated in {:.2}s",
                self.content_type,
                result.migrated,
                result.skipped,
                result.failed,
                result.already_migrated,
                result.duration_secs
            );
        }

        Ok(result)
    }
}

fn create_progress_bar(content_type: &ContentType, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}: {pos} items ({per_sec})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(content_type.to_string());
    pb
}

#[cfg(test)]
#[path = "migrator_tests.rs"]
mod tests;
