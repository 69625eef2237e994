//! In-memory endpoint.
//!
//! Holds content in process memory and records every call, which makes it
//! the endpoint of choice for tests, benchmarks and dry runs. Faults can be
//! injected per operation and item to exercise retry and failure paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::{ContentEndpoint, FileSink};
use crate::content::{
    ContentItem, ContentPage, ContentReference, ContentType, PageRequest, PublishPayload,
};
use crate::error::{Error, Result};

/// Endpoint operation a fault is injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `list`; faults are keyed by content type name.
    List,
    /// `get`; keyed by item id.
    Get,
    /// `find`; keyed by item name.
    Find,
    /// `create`; keyed by the source id of the payload.
    Create,
    /// `update`; keyed by the source id of the payload.
    Update,
    /// `delete`; keyed by item id.
    Delete,
    /// `download_file`; keyed by item id.
    Download,
}

/// A failure the endpoint produces instead of serving a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Timeout-like failure.
    Transient,
    /// Rate limiting with a retry-after hint in seconds.
    RateLimited(u64),
    /// Remote 5xx.
    ServerError,
    /// Credentials rejected.
    Unauthorized,
    /// Remote 4xx with a message.
    Rejected(String),
}

impl Fault {
    fn to_error(&self, key: &str) -> Error {
        match self {
            Self::Transient => Error::Transient(format!("timeout while handling '{key}'")),
            Self::RateLimited(seconds) => Error::RateLimit(*seconds),
            Self::ServerError => Error::Remote {
                status: 503,
                message: format!("service unavailable for '{key}'"),
            },
            Self::Unauthorized => Error::Authentication(format!("token rejected for '{key}'")),
            Self::Rejected(message) => Error::Remote {
                status: 400,
                message: message.clone(),
            },
        }
    }
}

/// Number of calls received per operation, failed attempts included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointCalls {
    /// `list` calls.
    pub list: usize,
    /// `get` calls.
    pub get: usize,
    /// `find` calls.
    pub find: usize,
    /// `create` calls.
    pub create: usize,
    /// `update` calls.
    pub update: usize,
    /// `delete` calls.
    pub delete: usize,
    /// `download_file` calls.
    pub download: usize,
}

impl EndpointCalls {
    /// Calls that modify the endpoint.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.create + self.update + self.delete
    }

    /// Every call.
    #[must_use]
    pub fn total(&self) -> usize {
        self.list + self.get + self.find + self.writes() + self.download
    }
}

struct FaultRule {
    fault: Fault,
    remaining: Option<u32>,
}

#[derive(Default)]
struct MemoryState {
    items: BTreeMap<ContentType, Vec<ContentItem>>,
    files: HashMap<String, Vec<u8>>,
    calls: EndpointCalls,
    faults: HashMap<(Operation, String), FaultRule>,
    unreachable: bool,
    next_id: u64,
}

impl MemoryState {
    fn record(&mut self, operation: Operation, key: &str) -> Result<()> {
        let counter = match operation {
            Operation::List => &mut self.calls.list,
            Operation::Get => &mut self.calls.get,
            Operation::Find => &mut self.calls.find,
            Operation::Create => &mut self.calls.create,
            Operation::Update => &mut self.calls.update,
            Operation::Delete => &mut self.calls.delete,
            Operation::Download => &mut self.calls.download,
        };
        *counter += 1;

        if self.unreachable {
            return Err(Error::Unreachable("memory endpoint is offline".to_string()));
        }

        let rule_key = (operation, key.to_string());
        let Some(rule) = self.faults.get_mut(&rule_key) else {
            return Ok(());
        };
        let error = rule.fault.to_error(key);
        let exhausted = match rule.remaining.as_mut() {
            None => false,
            Some(remaining) => {
                *remaining -= 1;
                *remaining == 0
            }
        };
        if exhausted {
            self.faults.remove(&rule_key);
        }
        Err(error)
    }

    fn find_mut(&mut self, content_type: &ContentType, id: &str) -> Option<&mut ContentItem> {
        self.items
            .get_mut(content_type)
            .and_then(|items| items.iter_mut().find(|item| item.reference.id == id))
    }
}

/// Decrements the in-flight counter when a call finishes.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Endpoint backed by process memory.
pub struct MemoryEndpoint {
    id_prefix: String,
    latency: Duration,
    state: Mutex<MemoryState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryEndpoint {
    /// Creates an empty endpoint; created items get ids `<id_prefix>-<n>`.
    pub fn new(id_prefix: impl Into<String>) -> Self {
        Self {
            id_prefix: id_prefix.into(),
            latency: Duration::ZERO,
            state: Mutex::new(MemoryState::default()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delays every item-level call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Adds an item.
    #[must_use]
    pub fn with_item(self, content_type: impl Into<ContentType>, item: ContentItem) -> Self {
        self.insert(content_type, item);
        self
    }

    /// Adds an item to an existing endpoint.
    pub fn insert(&self, content_type: impl Into<ContentType>, item: ContentItem) {
        self.state
            .lock()
            .items
            .entry(content_type.into())
            .or_default()
            .push(item);
    }

    /// Stores the binary payload of item `id`.
    pub fn insert_file(&self, id: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.state.lock().files.insert(id.into(), bytes.into());
    }

    /// Items of `content_type` in insertion order.
    #[must_use]
    pub fn items(&self, content_type: &ContentType) -> Vec<ContentItem> {
        self.state
            .lock()
            .items
            .get(content_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Binary payload of item `id`.
    #[must_use]
    pub fn file(&self, id: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(id).cloned()
    }

    /// Snapshot of the call counters.
    #[must_use]
    pub fn calls(&self) -> EndpointCalls {
        self.state.lock().calls
    }

    /// Resets the call counters.
    pub fn reset_calls(&self) {
        self.state.lock().calls = EndpointCalls::default();
    }

    /// Highest number of item-level calls that were running at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Fails the next `times` calls of `operation` for `key`.
    pub fn fail(&self, operation: Operation, key: impl Into<String>, fault: Fault, times: u32) {
        if times == 0 {
            return;
        }
        self.state.lock().faults.insert(
            (operation, key.into()),
            FaultRule {
                fault,
                remaining: Some(times),
            },
        );
    }

    /// Fails every call of `operation` for `key`.
    pub fn fail_always(&self, operation: Operation, key: impl Into<String>, fault: Fault) {
        self.state.lock().faults.insert(
            (operation, key.into()),
            FaultRule {
                fault,
                remaining: None,
            },
        );
    }

    /// Makes every call fail as unreachable.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    async fn simulate_latency(&self, cancel: &CancellationToken) -> Result<InFlight<'_>> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        if !self.latency.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(self.latency) => {}
            }
        }
        Ok(guard)
    }

    fn build_item(&self, id: String, payload: &PublishPayload) -> ContentItem {
        ContentItem {
            reference: ContentReference::new(id, payload.name.clone(), payload.location.clone()),
            references: payload.references.clone(),
            payload: payload.payload.clone(),
            has_file: payload.file.is_some(),
        }
    }
}

async fn read_staged(payload: &PublishPayload) -> Result<Option<Vec<u8>>> {
    match &payload.file {
        Some(file) => Ok(Some(file.read_all().await?)),
        None => Ok(None),
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
impl ContentEndpoint for MemoryEndpoint {
    fn endpoint_type(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        ensure_active(cancel)?;
        if self.state.lock().unreachable {
            return Err(Error::Unreachable("memory endpoint is offline".to_string()));
        }
        Ok(())
    }

    async fn list(
        &self,
        content_type: &ContentType,
        page: PageRequest,
        cancel: &CancellationToken,
    ) -> Result<ContentPage> {
        ensure_active(cancel)?;
        let mut state = self.state.lock();
        state.record(Operation::List, content_type.as_str())?;
        let items = state.items.get(content_type).map_or(&[][..], Vec::as_slice);
        let start = page.page.saturating_mul(page.size).min(items.len());
        let end = start.saturating_add(page.size).min(items.len());
        Ok(ContentPage {
            items: items[start..end].to_vec(),
            has_more: end < items.len(),
        })
    }

    async fn get(
        &self,
        content_type: &ContentType,
        reference: &ContentReference,
        cancel: &CancellationToken,
    ) -> Result<ContentItem> {
        ensure_active(cancel)?;
        let _guard = self.simulate_latency(cancel).await?;
        let mut state = self.state.lock();
        state.record(Operation::Get, &reference.id)?;
        state
            .find_mut(content_type, &reference.id)
            .cloned()
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
        let mut state = self.state.lock();
        state.record(Operation::Find, name)?;
        Ok(state.items.get(content_type).and_then(|items| {
            items
                .iter()
                .find(|item| item.reference.location == location && item.reference.name == name)
                .map(|item| item.reference.clone())
        }))
    }

    async fn create(
        &self,
        payload: &PublishPayload,
        cancel: &CancellationToken,
    ) -> Result<ContentReference> {
        ensure_active(cancel)?;
        let _guard = self.simulate_latency(cancel).await?;
        let bytes = read_staged(payload).await?;

        let mut state = self.state.lock();
        state.record(Operation::Create, &payload.source.id)?;
        state.next_id += 1;
        let id = format!("{}-{}", self.id_prefix, state.next_id);
        let item = self.build_item(id.clone(), payload);
        let reference = item.reference.clone();
        state
            .items
            .entry(payload.content_type.clone())
            .or_default()
            .push(item);
        if let Some(bytes) = bytes {
            state.files.insert(id, bytes);
        }
        Ok(reference)
    }

    async fn update(
        &self,
        destination: &ContentReference,
        payload: &PublishPayload,
        cancel: &CancellationToken,
    ) -> Result<ContentReference> {
        ensure_active(cancel)?;
        let _guard = self.simulate_latency(cancel).await?;
        let bytes = read_staged(payload).await?;

        let mut state = self.state.lock();
        state.record(Operation::Update, &payload.source.id)?;
        let updated = self.build_item(destination.id.clone(), payload);
        let reference = updated.reference.clone();
        let existing = state
            .find_mut(&payload.content_type, &destination.id)
            .ok_or_else(|| {
                Error::NotFound(format!("{} '{}'", payload.content_type, destination.id))
            })?;
        *existing = updated;
        if let Some(bytes) = bytes {
            state.files.insert(destination.id.clone(), bytes);
        }
        Ok(reference)
    }

    async fn delete(
        &self,
        content_type: &ContentType,
        reference: &ContentReference,
        cancel: &CancellationToken,
    ) -> Result<()> {
        ensure_active(cancel)?;
        let mut state = self.state.lock();
        state.record(Operation::Delete, &reference.id)?;
        let items = state
            .items
            .get_mut(content_type)
            .ok_or_else(|| Error::NotFound(format!("{content_type} '{}'", reference.id)))?;
        let before = items.len();
        items.retain(|item| item.reference.id != reference.id);
        if items.len() == before {
            return Err(Error::NotFound(format!("{content_type} '{}'", reference.id)));
        }
        state.files.remove(&reference.id);
        Ok(())
    }

    async fn download_file(
        &self,
        content_type: &ContentType,
        reference: &ContentReference,
        sink: FileSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        ensure_active(cancel)?;
        let bytes = {
            let mut state = self.state.lock();
            state.record(Operation::Download, &reference.id)?;
            state.files.get(&reference.id).cloned().ok_or_else(|| {
                Error::NotFound(format!("file for {content_type} '{}'", reference.id))
            })?
        };
        sink.write_all(&bytes).await?;
        sink.flush().await?;
        Ok(bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> ContentType {
        ContentType::new("User")
    }

    fn seeded(count: usize) -> MemoryEndpoint {
        let endpoint = MemoryEndpoint::new("src");
        for i in 0..count {
            endpoint.insert(
                "User",
                ContentItem::new(ContentReference::new(format!("u{i}"), format!("user{i}"), "")),
            );
        }
        endpoint
    }

    #[tokio::test]
    async fn test_list_pages() {
        let endpoint = seeded(5);
        let cancel = CancellationToken::new();

        let first = endpoint
            .list(&user(), PageRequest { page: 0, size: 2 }, &cancel)
            .await
            .unwrap();
        let last = endpoint
            .list(&user(), PageRequest { page: 2, size: 2 }, &cancel)
            .await
            .unwrap();
        let beyond = endpoint
            .list(&user(), PageRequest { page: 7, size: 2 }, &cancel)
            .await
            .unwrap();

        assert_eq!(first.items.len(), 2);
        assert!(first.has_more);
        assert_eq!(last.items.len(), 1);
        assert!(!last.has_more);
        assert!(beyond.items.is_empty());
        assert_eq!(endpoint.calls().list, 3);
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let endpoint = MemoryEndpoint::new("dst");
        let cancel = CancellationToken::new();
        let source = ContentItem::new(ContentReference::new("u1", "alice", "Sales"));
        let mut payload = PublishPayload::from_item(user(), &source);

        let created = endpoint.create(&payload, &cancel).await.unwrap();
        assert_eq!(created.id, "dst-1");

        payload.name = "alice.b".to_string();
        let updated = endpoint.update(&created, &payload, &cancel).await.unwrap();

        assert_eq!(updated.id, "dst-1");
        let items = endpoint.items(&user());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].reference.name, "alice.b");
        assert_eq!(endpoint.calls().writes(), 2);
    }

    #[tokio::test]
    async fn test_find_by_location_and_name() {
        let endpoint = seeded(2);
        let cancel = CancellationToken::new();

        let found = endpoint.find(&user(), "", "user1", &cancel).await.unwrap();
        let missing = endpoint.find(&user(), "Sales", "user1", &cancel).await.unwrap();

        assert_eq!(found.map(|r| r.id), Some("u1".to_string()));
        assert!(missing.is_none());
        assert_eq!(endpoint.calls().find, 2);
        assert_eq!(endpoint.calls().writes(), 0);
    }

    #[tokio::test]
    async fn test_fault_injection_counts_down() {
        let endpoint = seeded(1);
        let cancel = CancellationToken::new();
        let reference = ContentReference::new("u0", "user0", "");
        endpoint.fail(Operation::Get, "u0", Fault::Transient, 2);

        assert!(endpoint.get(&user(), &reference, &cancel).await.unwrap_err().is_transient());
        assert!(endpoint.get(&user(), &reference, &cancel).await.is_err());
        assert!(endpoint.get(&user(), &reference, &cancel).await.is_ok());
        assert_eq!(endpoint.calls().get, 3);
    }

    #[tokio::test]
    async fn test_permanent_fault() {
        let endpoint = MemoryEndpoint::new("dst");
        let cancel = CancellationToken::new();
        endpoint.fail_always(Operation::Create, "u1", Fault::Rejected("bad name".to_string()));
        let payload = PublishPayload::from_item(
            user(),
            &ContentItem::new(ContentReference::new("u1", "x", "")),
        );

        for _ in 0..3 {
            let err = endpoint.create(&payload, &cancel).await.unwrap_err();
            assert!(!err.is_transient());
        }
        assert!(endpoint.items(&user()).is_empty());
    }

    #[tokio::test]
    async fn test_unreachable() {
        let endpoint = seeded(1);
        endpoint.set_unreachable(true);
        let cancel = CancellationToken::new();

        let err = endpoint.connect(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_download_file() {
        let endpoint = seeded(1);
        endpoint.insert_file("u0", b"avatar".to_vec());
        let cancel = CancellationToken::new();

        let mut sink: Vec<u8> = Vec::new();
        let written = endpoint
            .download_file(&user(), &ContentReference::new("u0", "", ""), &mut sink, &cancel)
            .await
            .unwrap();

        assert_eq!(written, 6);
        assert_eq!(sink, b"avatar");
    }

    #[tokio::test]
    async fn test_cancelled_call_is_not_served() {
        let endpoint = seeded(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = endpoint
            .list(&user(), PageRequest { page: 0, size: 10 }, &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(endpoint.calls().total(), 0);
    }
}
