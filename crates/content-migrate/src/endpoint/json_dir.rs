//! Directory-of-JSON endpoint.
//!
//! Layout:
//!
//! ```text
//! <root>/
//!   User.json          # JSON array of content items
//!   Workbook.json
//!   files/<item id>    # binary payloads
//! ```
//!
//! Works as a source (exports from another system) and as a destination.
//! Missing type files read as empty.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ContentEndpoint, FileSink};
use crate::content::{
    ContentItem, ContentPage, ContentReference, ContentType, PageRequest, PublishPayload,
};
use crate::error::{Error, Result};

const FILES_DIR: &str = "files";

/// Endpoint reading and writing one JSON file per content type.
pub struct JsonDirEndpoint {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonDirEndpoint {
    /// Creates an endpoint rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn type_path(&self, content_type: &ContentType) -> Result<PathBuf> {
        let name = content_type.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(Error::Validation(format!(
                "content type '{name}' cannot be used as a file name"
            )));
        }
        Ok(self.root.join(format!("{name}.json")))
    }

    fn file_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(Error::Validation(format!(
                "item id '{id}' cannot be used as a file name"
            )));
        }
        Ok(self.root.join(FILES_DIR).join(id))
    }

    /// Reads every item of `content_type`.
    ///
    /// # Errors
    ///
    /// Returns an error if the type file exists but cannot be parsed.
    pub fn read_items(&self, content_type: &ContentType) -> Result<Vec<ContentItem>> {
        let path = self.type_path(content_type)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::Validation(format!("Failed to parse '{}': {}", path.display(), e))
        })
    }

    fn write_items(&self, content_type: &ContentType, items: &[ContentItem]) -> Result<()> {
        let path = self.type_path(content_type)?;
        let tmp = path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, items)?;
            writer.flush()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Applies `change` to the items of `content_type` under the write lock.
    fn modify<T>(
        &self,
        content_type: &ContentType,
        change: impl FnOnce(&mut Vec<ContentItem>) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.write_lock.lock();
        let mut items = self.read_items(content_type)?;
        let value = change(&mut items)?;
        self.write_items(content_type, &items)?;
        Ok(value)
    }

    async fn store_file(&self, id: &str, payload: &PublishPayload) -> Result<()> {
        let Some(file) = &payload.file else {
            return Ok(());
        };
        let path = self.file_path(id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, file.read_all().await?).await?;
        Ok(())
    }
}

fn to_item(id: String, payload: &PublishPayload) -> ContentItem {
    ContentItem {
        reference: ContentReference::new(id, payload.name.clone(), payload.location.clone()),
        references: payload.references.clone(),
        payload: payload.payload.clone(),
        has_file: payload.file.is_some(),
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

#[async_trait]
impl ContentEndpoint for JsonDirEndpoint {
    fn endpoint_type(&self) -> &'static str {
        "json_dir"
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        ensure_active(cancel)?;
        if !self.root.is_dir() {
            return Err(Error::Unreachable(format!(
                "'{}' is not a directory",
                self.root.display()
            )));
        }
        debug!(root = %self.root.display(), "Connected to JSON directory");
        Ok(())
    }

    async fn list(
        &self,
        content_type: &ContentType,
        page: PageRequest,
        cancel: &CancellationToken,
    ) -> Result<ContentPage> {
        ensure_active(cancel)?;
        let items = self.read_items(content_type)?;
        let total = items.len();
        let start = page.page.saturating_mul(page.size).min(total);
        let end = start.saturating_add(page.size).min(total);
        Ok(ContentPage {
            items: items.into_iter().skip(start).take(end - start).collect(),
            has_more: end < total,
        })
    }

    async fn get(
        &self,
        content_type: &ContentType,
        reference: &ContentReference,
        cancel: &CancellationToken,
    ) -> Result<ContentItem> {
        ensure_active(cancel)?;
        self.read_items(content_type)?
            .into_iter()
            .find(|item| item.reference.id == reference.id)
            .ok_or_else(|| Error::NotFound(format!("{content_type} '{}'", reference.id)))
    }

    async fn find(
        &self,
        content_type: &ContentType,
        location: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ContentReference>> {
        ensure_active(cancel)?;
        Ok(self
            .read_items(content_type)?
            .into_iter()
            .find(|item| item.reference.location == location && item.reference.name == name)
            .map(|item| item.reference))
    }

    async fn create(
        &self,
        payload: &PublishPayload,
        cancel: &CancellationToken,
    ) -> Result<ContentReference> {
        ensure_active(cancel)?;
        let id = uuid::Uuid::new_v4().to_string();
        self.store_file(&id, payload).await?;
        let item = to_item(id, payload);
        let reference = item.reference.clone();
        self.modify(&payload.content_type, |items| {
            items.push(item);
            Ok(())
        })?;
        Ok(reference)
    }

    async fn update(
        &self,
        destination: &ContentReference,
        payload: &PublishPayload,
        cancel: &CancellationToken,
    ) -> Result<ContentReference> {
        ensure_active(cancel)?;
        self.store_file(&destination.id, payload).await?;
        let item = to_item(destination.id.clone(), payload);
        let reference = item.reference.clone();
        self.modify(&payload.content_type, |items| {
            let existing = items
                .iter_mut()
                .find(|existing| existing.reference.id == destination.id)
                .ok_or_else(|| {
                    Error::NotFound(format!("{} '{}'", payload.content_type, destination.id))
                })?;
            *existing = item;
            Ok(())
        })?;
        Ok(reference)
    }

    async fn delete(
        &self,
        content_type: &ContentType,
        reference: &ContentReference,
        cancel: &CancellationToken,
    ) -> Result<()> {
        ensure_active(cancel)?;
        self.modify(content_type, |items| {
            let before = items.len();
            items.retain(|item| item.reference.id != reference.id);
            if items.len() == before {
                return Err(Error::NotFound(format!("{content_type} '{}'", reference.id)));
            }
            Ok(())
        })?;
        match std::fs::remove_file(self.file_path(&reference.id)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn download_file(
        &self,
        content_type: &ContentType,
        reference: &ContentReference,
        sink: FileSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        ensure_active(cancel)?;
        let path = self.file_path(&reference.id)?;
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("file for {content_type} '{}'", reference.id))
            } else {
                e.into()
            }
        })?;
        let written = tokio::io::copy(&mut file, &mut *sink).await?;
        sink.flush().await?;
        Ok(written)
    }
}

#[cfg(test)]
#[path = "json_dir_tests.rs"]
mod tests;
