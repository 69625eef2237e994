//! Staging storage for binary content payloads.
//!
//! Items such as workbooks and data sources carry a file next to their
//! metadata. The migrator stages that file in a [`ContentFileStore`] between
//! download and publish; streams and staged files are released on drop so no
//! exit path leaks them.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, warn};

use crate::content::ContentReference;
use crate::error::Result;

/// Handle to a file held by a content file store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFileHandle {
    /// Path of the staged file.
    pub path: PathBuf,
    /// Original file name reported by the source.
    pub original_name: String,
}

/// Storage for staged content files.
#[async_trait]
pub trait ContentFileStore: Send + Sync {
    /// Reserves a new file for an item.
    fn create(&self, reference: &ContentReference, original_name: &str) -> Result<ContentFileHandle>;

    /// Opens a staged file for reading.
    async fn open_read(&self, handle: &ContentFileHandle) -> Result<ContentFileStream>;

    /// Opens a staged file for writing, truncating existing content.
    async fn open_write(&self, handle: &ContentFileHandle) -> Result<ContentFileStream>;

    /// Removes a staged file. Missing files are not an error.
    fn delete(&self, handle: &ContentFileHandle) -> Result<()>;
}

/// An open stream over a staged file.
///
/// The store's open-stream count is released when the stream is dropped.
/// Call `flush` or `shutdown` after writing to make sure buffered bytes reach
/// the file.
#[derive(Debug)]
pub struct ContentFileStream {
    file: tokio::fs::File,
    open: Arc<AtomicUsize>,
}

impl ContentFileStream {
    fn new(file: tokio::fs::File, open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self { file, open }
    }
}

impl Drop for ContentFileStream {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AsyncRead for ContentFileStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

impl AsyncWrite for ContentFileStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

/// File store backed by a random sub-directory that is removed on drop.
pub struct TemporaryDirectoryContentFileStore {
    dir: tempfile::TempDir,
    open: Arc<AtomicUsize>,
}

impl TemporaryDirectoryContentFileStore {
    /// Creates a store in a random sub-directory of `root`, or of the system
    /// temporary directory when `root` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(root: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("content-migrate-");
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        debug!(path = %dir.path().display(), "Created content file store");
        Ok(Self {
            dir,
            open: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Directory holding the staged files.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Number of streams currently open.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "content".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl ContentFileStore for TemporaryDirectoryContentFileStore {
    fn create(&self, reference: &ContentReference, original_name: &str) -> Result<ContentFileHandle> {
        let file_name = format!(
            "{}-{}",
            uuid::Uuid::new_v4().simple(),
            sanitize_file_name(original_name)
        );
        let path = self.dir.path().join(file_name);
        debug!(item = %reference.id, path = %path.display(), "Reserved content file");
        Ok(ContentFileHandle {
            path,
            original_name: original_name.to_string(),
        })
    }

    async fn open_read(&self, handle: &ContentFileHandle) -> Result<ContentFileStream> {
        let file = tokio::fs::File::open(&handle.path).await?;
        Ok(ContentFileStream::new(file, Arc::clone(&self.open)))
    }

    async fn open_write(&self, handle: &ContentFileHandle) -> Result<ContentFileStream> {
        let file = tokio::fs::File::create(&handle.path).await?;
        Ok(ContentFileStream::new(file, Arc::clone(&self.open)))
    }

    fn delete(&self, handle: &ContentFileHandle) -> Result<()> {
        match std::fs::remove_file(&handle.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// A staged file as seen by the endpoint that publishes it.
#[derive(Clone)]
pub struct ContentFile {
    handle: ContentFileHandle,
    store: Arc<dyn ContentFileStore>,
}

impl ContentFile {
    /// Handle of the staged file.
    #[must_use]
    pub fn handle(&self) -> &ContentFileHandle {
        &self.handle
    }

    /// Opens the staged file for reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open_read(&self) -> Result<ContentFileStream> {
        self.store.open_read(&self.handle).await
    }

    /// Opens the staged file for writing, truncating it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open_write(&self) -> Result<ContentFileStream> {
        self.store.open_write(&self.handle).await
    }

    /// Reads the whole staged file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub async fn read_all(&self) -> Result<Vec<u8>> {
        let mut stream = self.open_read().await?;
        let mut content = Vec::new();
        stream.read_to_end(&mut content).await?;
        Ok(content)
    }

    /// Replaces the staged file's content.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn write_all(&self, content: &[u8]) -> Result<()> {
        let mut stream = self.open_write().await?;
        stream.write_all(content).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for ContentFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentFile")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// A staged file that is deleted from its store when dropped.
pub struct StagedFile {
    store: Arc<dyn ContentFileStore>,
    handle: ContentFileHandle,
}

impl StagedFile {
    /// Reserves a file in `store` for `reference`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot reserve the file.
    pub fn create(
        store: Arc<dyn ContentFileStore>,
        reference: &ContentReference,
        original_name: &str,
    ) -> Result<Self> {
        let handle = store.create(reference, original_name)?;
        Ok(Self { store, handle })
    }

    /// Handle of the staged file.
    #[must_use]
    pub fn handle(&self) -> &ContentFileHandle {
        &self.handle
    }

    /// Opens the staged file for writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open_write(&self) -> Result<ContentFileStream> {
        self.store.open_write(&self.handle).await
    }

    /// Shareable view of the file for publishing.
    #[must_use]
    pub fn content_file(&self) -> ContentFile {
        ContentFile {
            handle: self.handle.clone(),
            store: Arc::clone(&self.store),
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Err(e) = self.store.delete(&self.handle) {
            warn!(path = %self.handle.path.display(), "Failed to remove staged file: {}", e);
        }
    }
}
