//! Shared identifier and enumeration types for the Opal imaging store.
//!
//! Every crate in the workspace speaks in terms of these types: resource
//! identifiers, the four-level resource hierarchy, attachment content kinds,
//! change-feed records and store outcomes. Keeping them in a leaf crate avoids
//! circular dependencies between the storage, index and orchestration layers.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Number of lowercase hex characters in a canonical public identifier.
pub const PUBLIC_ID_LEN: usize = 44;

/// Errors that can occur when constructing validated types.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    /// The input was not a canonical public identifier.
    #[error("invalid public identifier: {0}")]
    InvalidPublicId(String),
    /// The input did not name a known resource level.
    #[error("unknown resource type: {0}")]
    InvalidResourceType(String),
}

/// Server-assigned, caller-facing identifier of a resource.
///
/// Public identifiers are derived deterministically from the DICOM unique
/// identifiers of the resource's hierarchy path (see [`PublicId::derive`]),
/// so re-submitting the same instance always maps to the same identifier.
/// Once constructed, the wrapper guarantees canonical form: exactly
/// [`PUBLIC_ID_LEN`] lowercase hex characters.
///
/// # Construction
/// - [`PublicId::derive`] computes the identifier for a hierarchy path.
/// - [`PublicId::parse`] validates an externally supplied identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicId(String);

impl PublicId {
    /// Derives the canonical identifier for a resource from the DICOM unique
    /// identifiers leading to it, in hierarchy order (patient id first).
    ///
    /// The segments are joined with `|` and hashed with SHA-256; the digest is
    /// hex-encoded and truncated to [`PUBLIC_ID_LEN`] characters.
    pub fn derive(segments: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                hasher.update(b"|");
            }
            hasher.update(segment.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        Self(digest[..PUBLIC_ID_LEN].to_owned())
    }

    /// Validates an externally supplied identifier (API input, job payloads).
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::InvalidPublicId`] if the input is not exactly
    /// [`PUBLIC_ID_LEN`] lowercase hex characters.
    pub fn parse(input: &str) -> Result<Self, TypeError> {
        let ok = input.len() == PUBLIC_ID_LEN
            && input
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if ok {
            Ok(Self(input.to_owned()))
        } else {
            Err(TypeError::InvalidPublicId(input.to_owned()))
        }
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PublicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for PublicId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for PublicId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PublicId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PublicId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Level of a resource in the patient / study / series / instance hierarchy.
///
/// The hierarchy is fixed: every level except `Patient` has exactly one
/// parent level, and every level except `Instance` has exactly one child
/// level. Parent-of relationships are assigned at creation and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ResourceType {
    Patient,
    Study,
    Series,
    Instance,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Patient => "Patient",
            ResourceType::Study => "Study",
            ResourceType::Series => "Series",
            ResourceType::Instance => "Instance",
        }
    }

    /// The level above this one, or `None` for `Patient`.
    pub fn parent(&self) -> Option<ResourceType> {
        match self {
            ResourceType::Patient => None,
            ResourceType::Study => Some(ResourceType::Patient),
            ResourceType::Series => Some(ResourceType::Study),
            ResourceType::Instance => Some(ResourceType::Series),
        }
    }

    /// The level below this one, or `None` for `Instance`.
    pub fn child(&self) -> Option<ResourceType> {
        match self {
            ResourceType::Patient => Some(ResourceType::Study),
            ResourceType::Study => Some(ResourceType::Series),
            ResourceType::Series => Some(ResourceType::Instance),
            ResourceType::Instance => None,
        }
    }

    /// Parses a case-sensitive level name.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::InvalidResourceType`] for any other input.
    pub fn parse(input: &str) -> Result<Self, TypeError> {
        match input {
            "Patient" => Ok(ResourceType::Patient),
            "Study" => Ok(ResourceType::Study),
            "Series" => Ok(ResourceType::Series),
            "Instance" => Ok(ResourceType::Instance),
            other => Err(TypeError::InvalidResourceType(other.to_owned())),
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of binary payload attached to a resource.
///
/// The pair (resource id, content type) is unique: a resource holds at most
/// one attachment of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ContentType {
    /// The raw instance bytes exactly as received.
    Dicom,
    /// The parsed dataset serialized as JSON, persisted alongside the raw
    /// bytes so metadata reads do not re-parse the primary payload.
    DicomAsJson,
    /// A rendered preview derived from the primary payload.
    Preview,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Dicom => "dicom",
            ContentType::DicomAsJson => "dicom-as-json",
            ContentType::Preview => "preview",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle transition recorded in the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChangeType {
    NewPatient,
    NewStudy,
    NewSeries,
    NewInstance,
    UpdatedAttachment,
    Deleted,
}

impl ChangeType {
    /// The change recorded when a resource of the given level is created.
    pub fn new_resource(level: ResourceType) -> Self {
        match level {
            ResourceType::Patient => ChangeType::NewPatient,
            ResourceType::Study => ChangeType::NewStudy,
            ResourceType::Series => ChangeType::NewSeries,
            ResourceType::Instance => ChangeType::NewInstance,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::NewPatient => "NewPatient",
            ChangeType::NewStudy => "NewStudy",
            ChangeType::NewSeries => "NewSeries",
            ChangeType::NewInstance => "NewInstance",
            ChangeType::UpdatedAttachment => "UpdatedAttachment",
            ChangeType::Deleted => "Deleted",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable, append-only record of a resource lifecycle transition.
///
/// Sequence numbers are assigned by the index under the same transaction that
/// commits the underlying metadata change, and are strictly increasing, so a
/// consumer reading the feed in sequence order never observes an event for
/// state that is not yet committed.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChangeEvent {
    /// Monotonically increasing position in the change feed.
    pub seq: u64,
    pub change_type: ChangeType,
    pub resource_type: ResourceType,
    pub public_id: PublicId,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of submitting an instance for storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StoreStatus {
    /// The instance was parsed, persisted and indexed.
    Success,
    /// An identical payload was already stored for this instance; nothing was
    /// written and no change event was recorded.
    AlreadyStored,
    /// A policy hook rejected the instance before persistence. Terminal but
    /// not an error.
    FilteredOut,
    /// Storage or index failure. Used by presentation layers when mapping an
    /// error into a response body.
    Failure,
}

impl StoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreStatus::Success => "Success",
            StoreStatus::AlreadyStored => "AlreadyStored",
            StoreStatus::FilteredOut => "FilteredOut",
            StoreStatus::Failure => "Failure",
        }
    }
}

impl std::fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a remote peer that outbound associations are opened towards.
///
/// Two destinations are the same association target only if the whole tuple
/// matches; a change to any field forces the connection pool to tear down the
/// held association and open a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RemoteDestination {
    /// Application entity title announced by the remote peer.
    pub aet: String,
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for RemoteDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.aet, self.host, self.port)
    }
}

/// Where a request entered the system. Handed to policy hooks so they can
/// filter on provenance.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Origin {
    pub channel: OriginChannel,
    /// Remote application entity title, when the request arrived over the
    /// imaging protocol.
    pub remote_aet: Option<String>,
}

impl Origin {
    pub fn internal() -> Self {
        Self {
            channel: OriginChannel::Internal,
            remote_aet: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OriginChannel {
    RestApi,
    DicomProtocol,
    Plugin,
    Internal,
}
