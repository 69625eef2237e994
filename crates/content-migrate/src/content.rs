//! Content identity and item types shared by every engine component.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::files::ContentFile;

/// A kind of migratable content (`User`, `Group`, `Workbook`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentType(String);

impl ContentType {
    /// Creates a content type from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the content type name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ContentType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Stable identity of an item on either the source or destination side.
///
/// Equality only considers `id`: renamed or moved items are the same item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentReference {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Location path (e.g. `Finance/Reports/Q1`).
    #[serde(default)]
    pub location: String,
}

impl ContentReference {
    /// Creates a reference.
    pub fn new(id: impl Into<String>, name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            location: location.into(),
        }
    }
}

impl PartialEq for ContentReference {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ContentReference {}

impl std::hash::Hash for ContentReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ContentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// A cross-reference from one item to another item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedReference {
    /// Content type of the referenced item.
    pub content_type: ContentType,
    /// Reference to the item on the side it was read from.
    pub reference: ContentReference,
    /// Whether the item cannot be published without this reference.
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

/// A content item read from an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    /// Identity of the item.
    pub reference: ContentReference,
    /// Cross-references keyed by field name (`owner`, `project`, ...).
    #[serde(default)]
    pub references: BTreeMap<String, LinkedReference>,
    /// Item properties.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Whether the item has an associated binary payload.
    #[serde(default)]
    pub has_file: bool,
}

impl ContentItem {
    /// Creates an item with an empty payload and no references.
    pub fn new(reference: ContentReference) -> Self {
        Self {
            reference,
            references: BTreeMap::new(),
            payload: serde_json::Value::Object(serde_json::Map::new()),
            has_file: false,
        }
    }

    /// Adds a required cross-reference.
    #[must_use]
    pub fn with_reference(
        mut self,
        field: impl Into<String>,
        content_type: impl Into<ContentType>,
        reference: ContentReference,
    ) -> Self {
        self.references.insert(
            field.into(),
            LinkedReference {
                content_type: content_type.into(),
                reference,
                required: true,
            },
        );
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A page request for listing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Zero-based page number.
    pub page: usize,
    /// Maximum number of items in the page.
    pub size: usize,
}

/// One page of listed content.
#[derive(Debug, Clone, Default)]
pub struct ContentPage {
    /// Items in this page.
    pub items: Vec<ContentItem>,
    /// Whether more pages follow.
    pub has_more: bool,
}

/// The fully-resolved payload sent to the destination.
#[derive(Debug, Clone)]
pub struct PublishPayload {
    /// Content type being published.
    pub content_type: ContentType,
    /// Source identity of the item.
    pub source: ContentReference,
    /// Destination location; transformers may rewrite it.
    pub location: String,
    /// Destination display name.
    pub name: String,
    /// Item properties.
    pub payload: serde_json::Value,
    /// Cross-references resolved to destination identities.
    pub references: BTreeMap<String, LinkedReference>,
    /// Staged binary payload, if the item has one.
    pub file: Option<ContentFile>,
}

impl PublishPayload {
    /// Builds an initial payload from a source item.
    #[must_use]
    pub fn from_item(content_type: ContentType, item: &ContentItem) -> Self {
        Self {
            content_type,
            source: item.reference.clone(),
            location: item.reference.location.clone(),
            name: item.reference.name.clone(),
            payload: item.payload.clone(),
            references: BTreeMap::new(),
            file: None,
        }
    }
}
