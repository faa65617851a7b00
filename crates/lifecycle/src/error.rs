//! Error taxonomy for the check-in lifecycle.

use thiserror::Error;

use crate::schema::Collection;

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Failures reported by a [`crate::store::DocumentStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient write or read failure.  Safe to retry: every write in this
    /// crate is either transactional or idempotent.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend cannot serve an ordered query on this field.
    #[error("no index for ordered query on {collection}.{field}")]
    MissingIndex { collection: Collection, field: String },

    #[error("precondition failed for {collection}/{id}: {detail}")]
    PreconditionFailed {
        collection: Collection,
        id: String,
        detail: String,
    },

    #[error("batch of {len} operations exceeds the store limit of {max}")]
    BatchTooLarge { len: usize, max: usize },

    #[error("corrupt document {collection}/{id}: {detail}")]
    Corrupt {
        collection: Collection,
        id: String,
        detail: String,
    },

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Malformed schedule or request parameters; rejected before any write.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no slot found for {0}")]
    SlotNotFound(String),

    #[error("{count} pending slots match {target}; refusing to pick one")]
    AmbiguousMatch { target: String, count: usize },

    #[error("slot {slot_id} is already completed by response {linked_response_id}")]
    AlreadyCompleted {
        slot_id: String,
        linked_response_id: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LifecycleError {
    /// Only transient storage failures are retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_retryable())
    }

    /// Stable machine-readable code used in structured payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::SlotNotFound(_) => "slot_not_found",
            Self::AmbiguousMatch { .. } => "ambiguous_match",
            Self::AlreadyCompleted { .. } => "already_completed",
            Self::Store(_) => "write_error",
        }
    }
}
