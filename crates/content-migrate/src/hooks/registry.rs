//! Typed hook registry.
//!
//! Hooks are registered per content type and kind with
//! [`HookRegistryBuilder`]; factories run once in [`HookRegistryBuilder::build`].
//! The resulting [`HookRegistry`] is immutable and shared by all item workers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    FileContent, FilterContext, Hook, HookKind, HookResult, MappingContext, PublishPayload,
};
use crate::content::{ContentItem, ContentReference, ContentType};
use crate::error::{Error, Result};

/// A hook with the metadata the engine needs to report and classify failures.
#[derive(Debug, Clone)]
pub struct RegisteredHook<C> {
    name: String,
    hook: Hook<C>,
    fatal: bool,
}

impl<C: Send + 'static> RegisteredHook<C> {
    /// Creates a registration whose failures only fail the current item.
    pub fn new(name: impl Into<String>, hook: Hook<C>) -> Self {
        Self {
            name: name.into(),
            hook,
            fatal: false,
        }
    }

    /// Makes failures of this hook abort the stage.
    #[must_use]
    pub fn fatal_on_error(mut self) -> Self {
        self.fatal = true;
        self
    }

    /// Hook name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes the hook, racing it against cancellation and classifying
    /// failures.
    async fn invoke(&self, context: C, cancel: &CancellationToken) -> Result<C> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let outcome = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = self.hook.invoke(context, cancel) => outcome,
        };
        outcome.map_err(|e| Error::Hook {
            hook: self.name.clone(),
            message: e.0,
            fatal: self.fatal,
        })
    }
}

type NeedsTransform = Arc<dyn Fn(&PublishPayload) -> bool + Send + Sync>;

/// A hook over the staged file of an item, with a check deciding whether the
/// file needs it.
///
/// The file is only read when at least one registered check passes.
pub struct FileTransformer {
    hook: RegisteredHook<FileContent>,
    needs_transform: NeedsTransform,
}

impl FileTransformer {
    /// Wraps a hook that runs for every item carrying a file.
    pub fn new(hook: RegisteredHook<FileContent>) -> Self {
        Self {
            hook,
            needs_transform: Arc::new(|_| true),
        }
    }

    /// Restricts the hook to payloads for which `check` returns true.
    #[must_use]
    pub fn when<F>(mut self, check: F) -> Self
    where
        F: Fn(&PublishPayload) -> bool + Send + Sync + 'static,
    {
        self.needs_transform = Arc::new(check);
        self
    }

    /// Hook name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.hook.name()
    }
}

type HookFactory<C> = Box<dyn FnOnce(&ContentType) -> HookResult<Hook<C>> + Send>;

enum Registration<C> {
    Instance(RegisteredHook<C>),
    Factory {
        name: String,
        fatal: bool,
        factory: HookFactory<C>,
    },
}

impl<C: Send + 'static> Registration<C> {
    fn resolve(self, content_type: &ContentType, kind: HookKind) -> Result<RegisteredHook<C>> {
        match self {
            Self::Instance(hook) => Ok(hook),
            Self::Factory {
                name,
                fatal,
                factory,
            } => {
                let hook = factory(content_type).map_err(|e| Error::HookFactory {
                    content_type: content_type.to_string(),
                    kind: kind.to_string(),
                    message: format!("{name}: {e}"),
                })?;
                Ok(RegisteredHook { name, hook, fatal })
            }
        }
    }
}

type Chains<C> = HashMap<ContentType, Vec<RegisteredHook<C>>>;

/// Builder collecting hook registrations before a run.
#[derive(Default)]
pub struct HookRegistryBuilder {
    filters: Vec<(ContentType, Registration<FilterContext>)>,
    mappings: Vec<(ContentType, Registration<MappingContext>)>,
    transformers: Vec<(ContentType, Registration<PublishPayload>)>,
    file_transformers: Vec<(ContentType, FileTransformer)>,
    required: Vec<(ContentType, HookKind)>,
}

impl HookRegistryBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a filter hook for `content_type`.
    #[must_use]
    pub fn add_filter(
        mut self,
        content_type: impl Into<ContentType>,
        hook: RegisteredHook<FilterContext>,
    ) -> Self {
        self.filters
            .push((content_type.into(), Registration::Instance(hook)));
        self
    }

    /// Appends a filter built by `factory` when the registry is built.
    ///
    /// With `fatal_on_error`, failures of the built hook abort the stage.
    #[must_use]
    pub fn add_filter_factory<F>(
        mut self,
        content_type: impl Into<ContentType>,
        name: impl Into<String>,
        fatal_on_error: bool,
        factory: F,
    ) -> Self
    where
        F: FnOnce(&ContentType) -> HookResult<Hook<FilterContext>> + Send + 'static,
    {
        self.filters.push((
            content_type.into(),
            Registration::Factory {
                name: name.into(),
                fatal: fatal_on_error,
                factory: Box::new(factory),
            },
        ));
        self
    }

    /// Appends a mapping hook for `content_type`.
    #[must_use]
    pub fn add_mapping(
        mut self,
        content_type: impl Into<ContentType>,
        hook: RegisteredHook<MappingContext>,
    ) -> Self {
        self.mappings
            .push((content_type.into(), Registration::Instance(hook)));
        self
    }

    /// Appends a mapping built by `factory` when the registry is built.
    ///
    /// With `fatal_on_error`, failures of the built hook abort the stage.
    #[must_use]
    pub fn add_mapping_factory<F>(
        mut self,
        content_type: impl Into<ContentType>,
        name: impl Into<String>,
        fatal_on_error: bool,
        factory: F,
    ) -> Self
    where
        F: FnOnce(&ContentType) -> HookResult<Hook<MappingContext>> + Send + 'static,
    {
        self.mappings.push((
            content_type.into(),
            Registration::Factory {
                name: name.into(),
                fatal: fatal_on_error,
                factory: Box::new(factory),
            },
        ));
        self
    }

    /// Appends a transformer hook for `content_type`.
    #[must_use]
    pub fn add_transformer(
        mut self,
        content_type: impl Into<ContentType>,
        hook: RegisteredHook<PublishPayload>,
    ) -> Self {
        self.transformers
            .push((content_type.into(), Registration::Instance(hook)));
        self
    }

    /// Appends a transformer built by `factory` when the registry is built.
    ///
    /// With `fatal_on_error`, failures of the built hook abort the stage.
    #[must_use]
    pub fn add_transformer_factory<F>(
        mut self,
        content_type: impl Into<ContentType>,
        name: impl Into<String>,
        fatal_on_error: bool,
        factory: F,
    ) -> Self
    where
        F: FnOnce(&ContentType) -> HookResult<Hook<PublishPayload>> + Send + 'static,
    {
        self.transformers.push((
            content_type.into(),
            Registration::Factory {
                name: name.into(),
                fatal: fatal_on_error,
                factory: Box::new(factory),
            },
        ));
        self
    }

    /// Appends a file transformer for `content_type`.
    #[must_use]
    pub fn add_file_transformer(
        mut self,
        content_type: impl Into<ContentType>,
        transformer: FileTransformer,
    ) -> Self {
        self.file_transformers
            .push((content_type.into(), transformer));
        self
    }

    /// Requires at least one hook of `kind` for `content_type`.
    #[must_use]
    pub fn require(mut self, content_type: impl Into<ContentType>, kind: HookKind) -> Self {
        self.required.push((content_type.into(), kind));
        self
    }

    /// Resolves factories and freezes the registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HookFactory`] if a factory fails, or
    /// [`Error::MissingHook`] if a required hook kind has no registration.
    pub fn build(self) -> Result<HookRegistry> {
        let mut registry = HookRegistry {
            filters: resolve_chains(self.filters, HookKind::Filter)?,
            mappings: resolve_chains(self.mappings, HookKind::Mapping)?,
            transformers: resolve_chains(self.transformers, HookKind::Transformer)?,
            file_transformers: HashMap::new(),
        };
        for (content_type, transformer) in self.file_transformers {
            debug!(
                content_type = %content_type,
                hook = %transformer.name(),
                kind = %HookKind::FileTransformer,
                "Registered hook"
            );
            registry
                .file_transformers
                .entry(content_type)
                .or_default()
                .push(transformer);
        }

        for (content_type, kind) in &self.required {
            if registry.count(content_type, *kind) == 0 {
                return Err(Error::MissingHook {
                    content_type: content_type.to_string(),
                    kind: kind.to_string(),
                });
            }
        }

        Ok(registry)
    }
}

fn resolve_chains<C: Send + 'static>(
    registrations: Vec<(ContentType, Registration<C>)>,
    kind: HookKind,
) -> Result<Chains<C>> {
    let mut chains: Chains<C> = HashMap::new();
    for (content_type, registration) in registrations {
        let hook = registration.resolve(&content_type, kind)?;
        debug!(content_type = %content_type, hook = %hook.name, %kind, "Registered hook");
        chains.entry(content_type).or_default().push(hook);
    }
    Ok(chains)
}

/// Immutable hook chains per content type.
#[derive(Default)]
pub struct HookRegistry {
    filters: Chains<FilterContext>,
    mappings: Chains<MappingContext>,
    transformers: Chains<PublishPayload>,
    file_transformers: HashMap<ContentType, Vec<FileTransformer>>,
}

impl HookRegistry {
    /// Registry without any hooks.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder() -> HookRegistryBuilder {
        HookRegistryBuilder::new()
    }

    /// Number of hooks of `kind` registered for `content_type`.
    #[must_use]
    pub fn count(&self, content_type: &ContentType, kind: HookKind) -> usize {
        match kind {
            HookKind::Filter => self.filters.get(content_type).map_or(0, Vec::len),
            HookKind::Mapping => self.mappings.get(content_type).map_or(0, Vec::len),
            HookKind::Transformer => self.transformers.get(content_type).map_or(0, Vec::len),
            HookKind::FileTransformer => {
                self.file_transformers.get(content_type).map_or(0, Vec::len)
            }
        }
    }

    /// Every content type with at least one hook.
    #[must_use]
    pub fn content_types(&self) -> BTreeSet<ContentType> {
        self.filters
            .keys()
            .chain(self.mappings.keys())
            .chain(self.transformers.keys())
            .chain(self.file_transformers.keys())
            .cloned()
            .collect()
    }

    /// Runs the filter chain; returns whether the item should be migrated.
    ///
    /// # Errors
    ///
    /// Returns the first hook failure, or [`Error::Cancelled`].
    pub async fn run_filters(
        &self,
        content_type: &ContentType,
        item: Arc<ContentItem>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut context = FilterContext {
            content_type: content_type.clone(),
            item,
            include: true,
        };
        for hook in self.filters.get(content_type).into_iter().flatten() {
            context = hook.invoke(context, cancel).await?;
            if !context.include {
                debug!(
                    content_type = %content_type,
                    source_id = %context.item.reference.id,
                    hook = %hook.name,
                    "Item excluded by filter"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Runs the mapping chain for one cross-reference; the first hook that
    /// supplies a destination wins.
    ///
    /// # Errors
    ///
    /// Returns the first hook failure, or [`Error::Cancelled`].
    pub async fn resolve_mapping(
        &self,
        context: MappingContext,
        cancel: &CancellationToken,
    ) -> Result<Option<ContentReference>> {
        let content_type = context.content_type.clone();
        let mut context = context;
        for hook in self.mappings.get(&content_type).into_iter().flatten() {
            context = hook.invoke(context, cancel).await?;
            if context.destination.is_some() {
                return Ok(context.destination);
            }
        }
        Ok(None)
    }

    /// Runs every transformer in order over the payload.
    ///
    /// # Errors
    ///
    /// Returns the first hook failure, or [`Error::Cancelled`].
    pub async fn run_transformers(
        &self,
        payload: PublishPayload,
        cancel: &CancellationToken,
    ) -> Result<PublishPayload> {
        let content_type = payload.content_type.clone();
        let mut payload = payload;
        for hook in self.transformers.get(&content_type).into_iter().flatten() {
            payload = hook.invoke(payload, cancel).await?;
        }
        Ok(payload)
    }

    /// Runs the file transformers whose check accepts `payload` over its
    /// staged file, then writes the result back.
    ///
    /// Returns whether the file was rewritten. Payloads without a file, or
    /// with no interested transformer, cause no file IO.
    ///
    /// # Errors
    ///
    /// Returns the first hook failure, an IO error, or [`Error::Cancelled`].
    pub async fn run_file_transformers(
        &self,
        payload: &PublishPayload,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let Some(file) = &payload.file else {
            return Ok(false);
        };
        let interested: Vec<&FileTransformer> = self
            .file_transformers
            .get(&payload.content_type)
            .into_iter()
            .flatten()
            .filter(|transformer| (transformer.needs_transform)(payload))
            .collect();
        if interested.is_empty() {
            return Ok(false);
        }

        let mut content = FileContent {
            content_type: payload.content_type.clone(),
            source: payload.source.clone(),
            file_name: file.handle().original_name.clone(),
            bytes: file.read_all().await?,
        };
        for transformer in interested {
            content = transformer.hook.invoke(content, cancel).await?;
        }
        file.write_all(&content.bytes).await?;

        debug!(
            content_type = %payload.content_type,
            source_id = %payload.source.id,
            bytes = content.bytes.len(),
            "Rewrote staged file"
        );
        Ok(true)
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
