//! Error types for content-migrate.
//!
//! Every error carries a classification used by the engine to decide how far
//! it propagates: item-scoped errors are recorded in the manifest and the
//! stage moves on, stage-scoped errors stop the remaining pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a migration.
///
/// Error codes follow the pattern `MIG-0XX`.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration (MIG-001).
    #[error("[MIG-001] Configuration error: {0}")]
    Config(String),

    /// The pipeline dependency graph has a cycle (MIG-002).
    #[error("[MIG-002] Cyclic dependency between stages: {}", stages.join(", "))]
    CyclicDependency {
        /// Stages that could not be ordered.
        stages: Vec<String>,
    },

    /// A stage depends on a stage that was never declared (MIG-003).
    #[error("[MIG-003] Stage '{stage}' depends on undeclared stage '{dependency}'")]
    MissingDependency {
        /// Declaring stage.
        stage: String,
        /// Missing dependency.
        dependency: String,
    },

    /// The same content type was declared twice (MIG-004).
    #[error("[MIG-004] Stage '{0}' is declared more than once")]
    DuplicateStage(String),

    /// A required hook kind has no registration (MIG-005).
    #[error("[MIG-005] No {kind} hook registered for '{content_type}'")]
    MissingHook {
        /// Content type the hook was required for.
        content_type: String,
        /// Hook kind name.
        kind: String,
    },

    /// A hook factory could not construct its hook (MIG-006).
    #[error("[MIG-006] Failed to build {kind} hook for '{content_type}': {message}")]
    HookFactory {
        /// Content type of the registration.
        content_type: String,
        /// Hook kind name.
        kind: String,
        /// Factory failure message.
        message: String,
    },

    /// A hook failed while processing an item (MIG-007).
    #[error("[MIG-007] Hook '{hook}' failed: {message}")]
    Hook {
        /// Hook name.
        hook: String,
        /// Failure message.
        message: String,
        /// Whether the failure aborts the stage.
        fatal: bool,
    },

    /// A required cross-reference has no destination equivalent (MIG-008).
    #[error("[MIG-008] Missing destination reference for {field} ({content_type} '{source_id}')")]
    MissingReference {
        /// Field on the migrated item holding the reference.
        field: String,
        /// Content type of the referenced item.
        content_type: String,
        /// Source id of the referenced item.
        source_id: String,
    },

    /// The item payload is malformed (MIG-009).
    #[error("[MIG-009] Validation error: {0}")]
    Validation(String),

    /// Transient remote failure such as a timeout (MIG-010).
    #[error("[MIG-010] Transient error: {0}")]
    Transient(String),

    /// Remote rate limiting, with the suggested wait in seconds (MIG-011).
    #[error("[MIG-011] Rate limited, retry after {0}s")]
    RateLimit(u64),

    /// Remote API returned an error status (MIG-012).
    #[error("[MIG-012] Remote error {status}: {message}")]
    Remote {
        /// HTTP-equivalent status code.
        status: u16,
        /// Error message from the remote side.
        message: String,
    },

    /// Authentication or authorization failure (MIG-013).
    #[error("[MIG-013] Authentication failed: {0}")]
    Authentication(String),

    /// The endpoint cannot be reached at all (MIG-014).
    #[error("[MIG-014] Endpoint unreachable: {0}")]
    Unreachable(String),

    /// Item does not exist on the endpoint (MIG-015).
    #[error("[MIG-015] Content not found: {0}")]
    NotFound(String),

    /// Manifest could not be loaded, saved or updated (MIG-016).
    #[error("[MIG-016] Manifest error: {0}")]
    Manifest(String),

    /// The operation was cancelled (MIG-017).
    #[error("[MIG-017] Operation cancelled")]
    Cancelled,

    /// IO error (MIG-018).
    #[error("[MIG-018] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (MIG-019).
    #[error("[MIG-019] Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error (MIG-020).
    #[error("[MIG-020] YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// How far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Fails a single item; siblings continue.
    Item,
    /// Aborts the current stage and the remaining pipeline.
    Stage,
    /// Cancellation, reported separately from failures.
    Cancelled,
}

/// Error classification reported to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retryable remote failure.
    Transient,
    /// Malformed or rejected content.
    Validation,
    /// Unresolvable cross-reference.
    MissingReference,
    /// Hook failure.
    Hook,
    /// Non-retryable remote failure.
    Remote,
    /// Configuration or environment failure.
    Configuration,
    /// Manifest persistence failure.
    Manifest,
    /// Cancellation.
    Cancelled,
}

impl Error {
    /// Returns the error code (e.g., "MIG-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "MIG-001",
            Self::CyclicDependency { .. } => "MIG-002",
            Self::MissingDependency { .. } => "MIG-003",
            Self::DuplicateStage(_) => "MIG-004",
            Self::MissingHook { .. } => "MIG-005",
            Self::HookFactory { .. } => "MIG-006",
            Self::Hook { .. } => "MIG-007",
            Self::MissingReference { .. } => "MIG-008",
            Self::Validation(_) => "MIG-009",
            Self::Transient(_) => "MIG-010",
            Self::RateLimit(_) => "MIG-011",
            Self::Remote { .. } => "MIG-012",
            Self::Authentication(_) => "MIG-013",
            Self::Unreachable(_) => "MIG-014",
            Self::NotFound(_) => "MIG-015",
            Self::Manifest(_) => "MIG-016",
            Self::Cancelled => "MIG-017",
            Self::Io(_) => "MIG-018",
            Self::Serialization(_) => "MIG-019",
            Self::Yaml(_) => "MIG-020",
        }
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) | Self::RateLimit(_) | Self::Io(_) => true,
            Self::Remote { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// Returns how far this error propagates.
    #[must_use]
    pub fn scope(&self) -> ErrorScope {
        match self {
            Self::Cancelled => ErrorScope::Cancelled,
            Self::Hook { fatal, .. } => {
                if *fatal {
                    ErrorScope::Stage
                } else {
                    ErrorScope::Item
                }
            }
            Self::Config(_)
            | Self::CyclicDependency { .. }
            | Self::MissingDependency { .. }
            | Self::DuplicateStage(_)
            | Self::MissingHook { .. }
            | Self::HookFactory { .. }
            | Self::Authentication(_)
            | Self::Unreachable(_)
            | Self::Manifest(_)
            | Self::Yaml(_) => ErrorScope::Stage,
            _ => ErrorScope::Item,
        }
    }

    /// Returns the user-facing classification.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        if self.is_transient() {
            return ErrorClass::Transient;
        }
        match self {
            Self::Cancelled => ErrorClass::Cancelled,
            Self::Hook { .. } => ErrorClass::Hook,
            Self::MissingReference { .. } => ErrorClass::MissingReference,
            Self::Validation(_) | Self::Serialization(_) | Self::NotFound(_) => {
                ErrorClass::Validation
            }
            Self::Remote { .. } => ErrorClass::Remote,
            Self::Manifest(_) => ErrorClass::Manifest,
            _ => ErrorClass::Configuration,
        }
    }
}

/// A per-item error record kept in results and in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Content type of the failed item.
    pub content_type: String,
    /// Source id of the failed item (empty for stage-level errors).
    pub source_id: String,
    /// Error classification.
    pub class: ErrorClass,
    /// Error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ItemError {
    /// Builds a record from an error.
    #[must_use]
    pub fn new(content_type: impl Into<String>, source_id: impl Into<String>, error: &Error) -> Self {
        Self {
            content_type: content_type.into(),
            source_id: source_id.into(),
            class: error.class(),
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} '{}' ({:?}): {}",
            self.content_type, self.source_id, self.class, self.message
        )
    }
}
