//! Metadata index boundary for the Opal imaging store.
//!
//! The index is the durable record of the patient / study / series / instance
//! hierarchy, the attachments hanging off each resource, and the append-only
//! change feed. The orchestration core talks to it exclusively through the
//! [`ResourceIndex`] trait, whose mutation methods are each a single
//! commit/rollback unit: either the whole compound operation is applied, or
//! none of it is, and no caller ever observes a partially applied mutation.
//!
//! A SQL-backed implementation belongs to the embedding server; this crate
//! ships [`MemoryIndex`], the reference implementation used by the core's
//! test-suite and by embedders that do not bring their own database.

mod memory;

pub use memory::MemoryIndex;

use chrono::{DateTime, Utc};
use opal_storage::StoredBlob;
use opal_types::{ChangeEvent, ChangeType, ContentType, PublicId, ResourceType};

/// Errors raised by index implementations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The identifier does not name a known resource.
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    /// The identifier names a resource of a different level than expected.
    #[error("resource {id} is a {actual}, not a {expected}")]
    TypeMismatch {
        id: String,
        expected: ResourceType,
        actual: ResourceType,
    },
    /// The resource exists but carries no attachment of the requested kind.
    #[error("no {content_type} attachment on resource {id}")]
    UnknownAttachment {
        id: String,
        content_type: ContentType,
    },
    /// The transaction could not be committed.
    #[error("index transaction failed: {0}")]
    Transaction(String),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Index-side record of one attachment: where its blob lives and how to
/// verify it, plus when it was stored.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AttachmentInfo {
    pub content_type: ContentType,
    pub blob: StoredBlob,
    pub stored_at: DateTime<Utc>,
}

impl AttachmentInfo {
    pub fn new(content_type: ContentType, blob: StoredBlob) -> Self {
        Self {
            content_type,
            blob,
            stored_at: Utc::now(),
        }
    }
}

/// Identifiers of one full hierarchy path, public and DICOM-native.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyIds {
    pub patient: PublicId,
    pub study: PublicId,
    pub series: PublicId,
    pub instance: PublicId,
    pub patient_uid: String,
    pub study_uid: String,
    pub series_uid: String,
    pub instance_uid: String,
}

impl HierarchyIds {
    /// The (public id, DICOM uid, level) triples in hierarchy order.
    pub fn levels(&self) -> [(&PublicId, &str, ResourceType); 4] {
        [
            (&self.patient, &self.patient_uid, ResourceType::Patient),
            (&self.study, &self.study_uid, ResourceType::Study),
            (&self.series, &self.series_uid, ResourceType::Series),
            (&self.instance, &self.instance_uid, ResourceType::Instance),
        ]
    }
}

/// Request to register a stored instance and its attachments.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub hierarchy: HierarchyIds,
    pub attachments: Vec<AttachmentInfo>,
}

/// Outcome of a committed [`ResourceIndex::register_instance`].
#[derive(Debug, Clone)]
pub struct InstanceRegistration {
    /// Resources newly created by this registration, parents first.
    pub created: Vec<(PublicId, ResourceType)>,
    /// Attachments replaced on an already-known instance; their blobs are no
    /// longer referenced and should be reclaimed by the caller.
    pub replaced: Vec<AttachmentInfo>,
    /// Change events committed with the registration, in sequence order.
    pub events: Vec<ChangeEvent>,
}

/// Outcome of a committed attachment replacement.
#[derive(Debug, Clone)]
pub struct AttachmentUpdate {
    /// The previous attachment of the same kind, if one existed. Its blob is
    /// no longer referenced by the index.
    pub replaced: Option<AttachmentInfo>,
    pub event: ChangeEvent,
}

/// Outcome of a committed resource deletion.
#[derive(Debug, Clone)]
pub struct DeletionOutcome {
    /// Every resource removed: the target, its descendants, and any ancestors
    /// left childless by the cascade.
    pub resources: Vec<(PublicId, ResourceType)>,
    /// Attachments whose metadata rows were removed; their blobs are now
    /// unreferenced and must be reclaimed by the caller.
    pub attachments: Vec<AttachmentInfo>,
    /// One `Deleted` event per removed resource, in sequence order.
    pub events: Vec<ChangeEvent>,
}

/// Transactional store of resource metadata, attachments and change events.
///
/// Implementations must be safe for concurrent use; every mutation method is
/// atomic with respect to every other call.
pub trait ResourceIndex: Send + Sync {
    /// Returns the level of the resource named by `id`, or `None` if the
    /// identifier is unknown.
    fn lookup(&self, id: &PublicId) -> IndexResult<Option<ResourceType>>;

    /// Registers an instance, creating any missing hierarchy levels, setting
    /// the instance's attachments, and recording one change event per created
    /// resource (or an `UpdatedAttachment` event if the instance already
    /// existed), all in one transaction.
    fn register_instance(&self, request: NewInstance) -> IndexResult<InstanceRegistration>;

    /// Looks up the attachment of the given kind on a resource.
    fn attachment(&self, id: &PublicId, content_type: ContentType) -> IndexResult<AttachmentInfo>;

    /// Returns the recorded content digest of an attachment, or `None` when
    /// the resource or attachment does not exist (or no digest was recorded).
    /// This is the lookup used for idempotent-store detection, so absence is
    /// not an error here.
    fn attachment_digest(
        &self,
        id: &PublicId,
        content_type: ContentType,
    ) -> IndexResult<Option<String>>;

    /// Adds or replaces an attachment on an existing resource and records an
    /// `UpdatedAttachment` event, in one transaction.
    fn add_attachment(&self, id: &PublicId, info: AttachmentInfo) -> IndexResult<AttachmentUpdate>;

    /// Removes an attachment's metadata row and records an
    /// `UpdatedAttachment` event, in one transaction. Returns the removed
    /// record so the caller can reclaim its blob after the commit.
    fn remove_attachment(
        &self,
        id: &PublicId,
        content_type: ContentType,
    ) -> IndexResult<(AttachmentInfo, ChangeEvent)>;

    /// Deletes a resource, all its descendants, and any ancestors the cascade
    /// leaves childless, recording one `Deleted` event per removed resource,
    /// in one transaction.
    fn delete_resource(&self, id: &PublicId) -> IndexResult<DeletionOutcome>;

    /// Appends a change event for an existing resource.
    fn record_change(
        &self,
        id: &PublicId,
        resource_type: ResourceType,
        change_type: ChangeType,
    ) -> IndexResult<ChangeEvent>;

    /// Returns up to `limit` events with sequence numbers strictly greater
    /// than `since`, in sequence order. This is the resumable-polling surface
    /// change-feed consumers use.
    fn changes_since(&self, since: u64, limit: usize) -> IndexResult<Vec<ChangeEvent>>;
}
