use opal_index::IndexError;
use opal_storage::StorageError;
use std::path::PathBuf;

/// Errors surfaced by the orchestration core.
///
/// The taxonomy a presentation layer maps to its own outcomes:
/// `UnknownResource` becomes a not-found response, everything else a generic
/// failure with the diagnostic attached. Policy rejection and idempotent
/// re-submission are *not* errors; they are
/// [`opal_types::StoreStatus`] values.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The identifier does not name an existing resource, or names a resource
    /// of an unexpected level.
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    /// The submitted payload could not be parsed as a well-formed instance.
    #[error("malformed instance payload: {0}")]
    MalformedInstance(String),
    /// Blob I/O failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Metadata transaction failure.
    #[error("index error: {0}")]
    Index(IndexError),
    /// A policy or notification hook failed.
    #[error("hook {name} failed: {detail}")]
    Hook { name: String, detail: String },
    /// An outbound association could not be opened or used.
    #[error("association to {destination} failed: {detail}")]
    Association {
        destination: String,
        detail: String,
    },
    /// The platform loader could not open a module.
    #[error("failed to load module {path}: {detail}", path = path.display())]
    ModuleLoad { path: PathBuf, detail: String },
    /// A loaded module does not export the requested entry point.
    #[error("module does not export function \"{0}\"")]
    SymbolNotFound(String),
    /// Invariant violation inside the core itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<IndexError> for CoreError {
    fn from(err: IndexError) -> Self {
        match err {
            // Identifier problems keep their not-found character across the
            // boundary so presentation layers can map them uniformly.
            IndexError::UnknownResource(_)
            | IndexError::TypeMismatch { .. }
            | IndexError::UnknownAttachment { .. } => CoreError::UnknownResource(err.to_string()),
            other => CoreError::Index(other),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
