//! Source and destination endpoints.
//!
//! An endpoint is anything content can be listed from or published to: a
//! remote server, a directory of JSON exports, or an in-memory store in
//! tests. Implement [`ContentEndpoint`] to add a new one.

pub mod json_dir;
pub mod memory;

pub use json_dir::JsonDirEndpoint;
pub use memory::{EndpointCalls, Fault, MemoryEndpoint, Operation};

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::content::{ContentItem, ContentPage, ContentReference, ContentType, PageRequest, PublishPayload};
use crate::error::{Error, Result};

/// Byte sink a file download is written to.
pub type FileSink<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

/// Trait for migration endpoints.
///
/// Every call receives the migration's cancellation token; long operations
/// should stop early once it fires.
#[async_trait]
pub trait ContentEndpoint: Send + Sync {
    /// Returns the endpoint type name.
    fn endpoint_type(&self) -> &'static str;

    /// Verifies the endpoint is reachable before the first stage runs.
    async fn connect(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Lists one page of items of `content_type`.
    async fn list(
        &self,
        content_type: &ContentType,
        page: PageRequest,
        cancel: &CancellationToken,
    ) -> Result<ContentPage>;

    /// Pulls the full item for a listed reference.
    async fn get(
        &self,
        content_type: &ContentType,
        reference: &ContentReference,
        cancel: &CancellationToken,
    ) -> Result<ContentItem>;

    /// Publishes a new item and returns its destination reference.
    async fn create(
        &self,
        payload: &PublishPayload,
        cancel: &CancellationToken,
    ) -> Result<ContentReference>;

    /// Finds an existing item of `content_type` by location and name.
    ///
    /// The migrator asks before every `create`, so an item published by an
    /// interrupted run is updated rather than duplicated. Endpoints that
    /// cannot search return `None`.
    async fn find(
        &self,
        _content_type: &ContentType,
        _location: &str,
        _name: &str,
        _cancel: &CancellationToken,
    ) -> Result<Option<ContentReference>> {
        Ok(None)
    }

    /// Overwrites an item published earlier.
    async fn update(
        &self,
        destination: &ContentReference,
        payload: &PublishPayload,
        cancel: &CancellationToken,
    ) -> Result<ContentReference>;

    /// Removes an item.
    async fn delete(
        &self,
        content_type: &ContentType,
        reference: &ContentReference,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Streams the binary payload of an item into `sink` and returns the
    /// number of bytes written.
    async fn download_file(
        &self,
        content_type: &ContentType,
        reference: &ContentReference,
        _sink: FileSink<'_>,
        _cancel: &CancellationToken,
    ) -> Result<u64> {
        Err(Error::Validation(format!(
            "{} endpoint has no file for {content_type} '{}'",
            self.endpoint_type(),
            reference.id
        )))
    }
}
