//! Pluggable hooks invoked while migrating each item.
//!
//! Three extension points exist per content type:
//!
//! | Kind | Context | Chain semantics |
//! |------|---------|-----------------|
//! | Filter | [`FilterContext`] | first exclusion wins, item is skipped |
//! | Mapping | [`MappingContext`] | first destination reference wins |
//! | Transformer | [`PublishPayload`] | every hook sees the previous output |
//! | File transformer | [`FileContent`] | runs only when its check wants the file; the result is written back |
//!
//! A hook is either synchronous ([`SyncHook`]) or asynchronous
//! ([`AsyncHook`]). Both are wrapped in [`Hook`], and the registry calls them
//! through one async entry point; synchronous hooks run inline.

mod registry;

pub use registry::{FileTransformer, HookRegistry, HookRegistryBuilder, RegisteredHook};

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::content::{ContentItem, ContentReference, ContentType};

pub use crate::content::PublishPayload;

/// Error returned by a hook implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    /// Creates a hook error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result type for hook implementations.
pub type HookResult<T> = std::result::Result<T, HookError>;

/// The extension point a hook is registered at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookKind {
    /// Decides whether an item is migrated.
    Filter,
    /// Resolves destination identities for cross-references.
    Mapping,
    /// Rewrites the publish payload.
    Transformer,
    /// Rewrites the staged binary file.
    FileTransformer,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Filter => "filter",
            Self::Mapping => "mapping",
            Self::Transformer => "transformer",
            Self::FileTransformer => "file transformer",
        };
        f.write_str(name)
    }
}

/// Input and output of a filter hook.
#[derive(Debug, Clone)]
pub struct FilterContext {
    /// Content type of the item.
    pub content_type: ContentType,
    /// Item being considered.
    pub item: Arc<ContentItem>,
    /// Whether the item should be migrated.
    pub include: bool,
}

impl FilterContext {
    /// Marks the item as excluded.
    #[must_use]
    pub fn exclude(mut self) -> Self {
        self.include = false;
        self
    }
}

/// Input and output of a mapping hook.
#[derive(Debug, Clone)]
pub struct MappingContext {
    /// Content type of the item holding the reference.
    pub content_type: ContentType,
    /// Field holding the reference (`owner`, `project`, ...).
    pub field: String,
    /// Content type of the referenced item.
    pub referenced_type: ContentType,
    /// Source-side reference.
    pub source: ContentReference,
    /// Destination reference, once a hook supplies one.
    pub destination: Option<ContentReference>,
}

impl MappingContext {
    /// Supplies the destination reference.
    #[must_use]
    pub fn map_to(mut self, destination: ContentReference) -> Self {
        self.destination = Some(destination);
        self
    }
}

/// Input and output of a file transformer: the staged file of one item.
#[derive(Debug, Clone)]
pub struct FileContent {
    /// Content type of the item.
    pub content_type: ContentType,
    /// Source identity of the item.
    pub source: ContentReference,
    /// File name reported by the source.
    pub file_name: String,
    /// File content; written back to the staged file after the chain.
    pub bytes: Vec<u8>,
}

/// A hook that completes without suspending.
pub trait SyncHook<C>: Send + Sync {
    /// Runs the hook, returning the (possibly updated) context.
    fn execute(&self, context: C) -> HookResult<C>;
}

/// A hook that performs asynchronous work.
#[async_trait]
pub trait AsyncHook<C>: Send + Sync {
    /// Runs the hook, returning the (possibly updated) context.
    async fn execute(&self, context: C, cancel: &CancellationToken) -> HookResult<C>;
}

/// A hook implementation of either style.
pub enum Hook<C> {
    /// Synchronous implementation, run inline.
    Sync(Arc<dyn SyncHook<C>>),
    /// Asynchronous implementation.
    Async(Arc<dyn AsyncHook<C>>),
}

impl<C> Clone for Hook<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(hook) => Self::Sync(Arc::clone(hook)),
            Self::Async(hook) => Self::Async(Arc::clone(hook)),
        }
    }
}

impl<C> fmt::Debug for Hook<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Hook::Sync"),
            Self::Async(_) => f.write_str("Hook::Async"),
        }
    }
}

impl<C: Send + 'static> Hook<C> {
    /// Wraps a synchronous hook.
    pub fn sync(hook: impl SyncHook<C> + 'static) -> Self {
        Self::Sync(Arc::new(hook))
    }

    /// Wraps an asynchronous hook.
    pub fn asynchronous(hook: impl AsyncHook<C> + 'static) -> Self {
        Self::Async(Arc::new(hook))
    }

    /// Wraps a synchronous callback.
    pub fn from_fn<F>(callback: F) -> Self
    where
        F: Fn(C) -> HookResult<C> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(FnHook(callback)))
    }

    /// Wraps an asynchronous callback.
    pub fn from_async_fn<F, Fut>(callback: F) -> Self
    where
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult<C>> + Send + 'static,
    {
        Self::Async(Arc::new(AsyncFnHook(move |context: C| -> BoxFuture<'static, HookResult<C>> {
            Box::pin(callback(context))
        })))
    }

    /// Runs the hook through the single async contract.
    pub async fn invoke(&self, context: C, cancel: &CancellationToken) -> HookResult<C> {
        match self {
            Self::Sync(hook) => hook.execute(context),
            Self::Async(hook) => hook.execute(context, cancel).await,
        }
    }
}

struct FnHook<F>(F);

impl<C, F> SyncHook<C> for FnHook<F>
where
    F: Fn(C) -> HookResult<C> + Send + Sync,
{
    fn execute(&self, context: C) -> HookResult<C> {
        (self.0)(context)
    }
}

struct AsyncFnHook<F>(F);

#[async_trait]
impl<C, F> AsyncHook<C> for AsyncFnHook<F>
where
    C: Send + 'static,
    F: Fn(C) -> BoxFuture<'static, HookResult<C>> + Send + Sync,
{
    async fn execute(&self, context: C, _cancel: &CancellationToken) -> HookResult<C> {
        (self.0)(context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Uppercase;

    impl SyncHook<String> for Uppercase {
        fn execute(&self, context: String) -> HookResult<String> {
            Ok(context.to_uppercase())
        }
    }

    struct Suffix(&'static str);

    #[async_trait]
    impl AsyncHook<String> for Suffix {
        async fn execute(&self, context: String, _cancel: &CancellationToken) -> HookResult<String> {
            tokio::task::yield_now().await;
            Ok(format!("{context}{}", self.0))
        }
    }

    #[tokio::test]
    async fn test_sync_and_async_hooks_share_one_contract() {
        let cancel = CancellationToken::new();
        let hooks = vec![Hook::sync(Uppercase), Hook::asynchronous(Suffix("!"))];

        let mut value = "hello".to_string();
        for hook in &hooks {
            value = hook.invoke(value, &cancel).await.unwrap();
        }
        assert_eq!(value, "HELLO!");
    }

    #[tokio::test]
    async fn test_callbacks() {
        let cancel = CancellationToken::new();
        let sync = Hook::from_fn(|s: String| Ok(s.repeat(2)));
        let asynchronous = Hook::from_async_fn(|s: String| async move { Ok(format!("<{s}>")) });

        let value = sync.invoke("ab".to_string(), &cancel).await.unwrap();
        let value = asynchronous.invoke(value, &cancel).await.unwrap();
        assert_eq!(value, "<abab>");
    }

    #[tokio::test]
    async fn test_hook_error_propagates() {
        let cancel = CancellationToken::new();
        let failing: Hook<String> = Hook::from_fn(|_| Err(HookError::new("nope")));

        let err = failing.invoke(String::new(), &cancel).await.unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[test]
    fn test_filter_context_exclude() {
        let item = Arc::new(ContentItem::new(ContentReference::new("1", "a", "")));
        let context = FilterContext {
            content_type: ContentType::new("User"),
            item,
            include: true,
        };
        assert!(!context.exclude().include);
    }

    #[test]
    fn test_hook_kind_display() {
        assert_eq!(HookKind::Transformer.to_string(), "transformer");
        assert_eq!(HookKind::FileTransformer.to_string(), "file transformer");
    }
}
