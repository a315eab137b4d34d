//! # Opal Core
//!
//! Orchestration core of the Opal imaging store. The central type is
//! [`ServerContext`], which composes the blob storage area, the metadata
//! index, the parsed-instance cache, the outbound association pool, the job
//! scheduler and the hook registry, and keeps the persisted index and the
//! persisted blobs mutually consistent under concurrent access.
//!
//! **No API concerns**: HTTP routing, protocol framing and process bootstrap
//! belong to the embedding server. Presentation layers call into
//! [`ServerContext`] and translate its results into their own response
//! formats.

mod archive;
mod cache;
mod config;
mod context;
mod dataset;
mod error;
mod hooks;
mod jobs;
mod modules;
mod pool;

pub use archive::{ArchiveHandle, SharedArchive};
pub use cache::{CacheLocker, InstanceCache};
pub use config::ContextConfig;
pub use context::{ServerContext, StoreOutcome};
pub use dataset::{InstanceDataset, InstanceIdentity};
pub use error::{CoreError, CoreResult};
pub use hooks::{
    ChangeListener, HookRegistry, InstanceModifier, OnStoredHook, ReceivedInstanceFilter,
    SimplifiedTags,
};
pub use jobs::{Job, JobId, JobStatus, Scheduler};
pub use modules::{ModuleFunction, ModuleRegistry, SharedModule};
pub use pool::{Association, AssociationOpener, ReusableAssociation};
