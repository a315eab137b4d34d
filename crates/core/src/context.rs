//! The context orchestrator.
//!
//! [`ServerContext`] is the only component allowed to mutate both the blob
//! storage area and the metadata index, and it is responsible for keeping
//! them mutually consistent: every multi-step write goes blob-first, then
//! index transaction, and a failed index commit triggers a compensating
//! delete of the just-written blobs so no orphan blob stays observable after
//! a failed operation. Deletion is ordered the other way around — metadata
//! rows are removed in the index transaction first, and blobs only after the
//! commit — so an aborted transaction never loses a still-referenced blob.
//!
//! Locking discipline: each collaborator guards itself (cache lock, hook
//! lock, association slot lock, index transaction) and no operation here
//! holds two of those locks at once. Scheduler jobs may therefore re-enter
//! `store`/`read_*` without deadlocking.

use crate::hooks::SimplifiedTags;
use crate::{
    ArchiveHandle, CacheLocker, ContextConfig, CoreError, CoreResult, HookRegistry, InstanceCache,
    InstanceDataset, Job, ReusableAssociation, Scheduler, SharedArchive,
};
use opal_index::{AttachmentInfo, NewInstance, ResourceIndex};
use opal_storage::{StorageAccessor, StorageArea};
use opal_types::{
    ChangeEvent, ChangeType, ContentType, Origin, PublicId, RemoteDestination, ResourceType,
    StoreStatus,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Result of a [`ServerContext::store`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOutcome {
    pub status: StoreStatus,
    /// Public identifier of the stored instance. `None` for the empty-input
    /// no-op and for policy rejections.
    pub public_id: Option<PublicId>,
}

/// Central orchestrator of the imaging store.
pub struct ServerContext {
    index: Arc<dyn ResourceIndex>,
    storage: StorageAccessor,
    cache: InstanceCache,
    hooks: Arc<HookRegistry>,
    scheduler: Scheduler,
    archive: SharedArchive<serde_json::Value>,
    pool: ReusableAssociation,
    reset_requested: AtomicBool,
}

impl ServerContext {
    pub fn new(
        index: Arc<dyn ResourceIndex>,
        area: Box<dyn StorageArea>,
        opener: Box<dyn crate::AssociationOpener>,
        config: ContextConfig,
    ) -> Self {
        let storage = StorageAccessor::new(area);
        storage.set_compression_enabled(config.compression_enabled);
        storage.set_store_digest(config.store_digest);

        Self {
            index,
            storage,
            cache: InstanceCache::new(config.cache_capacity),
            hooks: Arc::new(HookRegistry::new()),
            scheduler: Scheduler::start(),
            archive: SharedArchive::new(config.archive_capacity, config.archive_max_age),
            pool: ReusableAssociation::new(opener, config.association_idle_timeout),
            reset_requested: AtomicBool::new(false),
        }
    }

    /// Runs the full store pipeline for one inbound instance.
    ///
    /// Empty input is a no-op success with no side effect. Otherwise the
    /// payload is parsed, submitted to the policy filters, passed through the
    /// modify hooks, deduplicated against the already-stored content, and
    /// persisted blob-first. On-stored hooks run on the scheduler thread,
    /// outside the critical section; their failure never affects the
    /// returned status.
    ///
    /// The duplicate short-circuit runs after the filter *and* modify hooks:
    /// a policy rejection always wins over idempotent acceptance, and
    /// deduplication keys on the final identity so a modifier that rewrites
    /// identity attributes cannot be bypassed by re-submission. Duplicates
    /// never re-run the side-effecting on-stored hooks.
    pub fn store(&self, bytes: &[u8], origin: &Origin) -> CoreResult<StoreOutcome> {
        if bytes.is_empty() {
            return Ok(StoreOutcome {
                status: StoreStatus::Success,
                public_id: None,
            });
        }

        let mut dataset = InstanceDataset::parse(bytes)?;

        if !self.hooks.apply_filters(&dataset.simplified(), origin)? {
            tracing::info!("inbound instance rejected by policy filter");
            return Ok(StoreOutcome {
                status: StoreStatus::FilteredOut,
                public_id: None,
            });
        }

        self.hooks.apply_modifiers(&mut dataset, origin)?;

        let hierarchy = dataset.hierarchy()?;
        let instance_id = hierarchy.instance.clone();

        // Idempotent re-submission: identical primary content is already
        // indexed for this instance. With digest bookkeeping disabled the
        // lookup returns nothing and the payload is stored again as a
        // replacement.
        let digest = StorageAccessor::content_digest(bytes);
        if let Some(existing) = self
            .index
            .attachment_digest(&instance_id, ContentType::Dicom)?
        {
            if existing == digest {
                return Ok(StoreOutcome {
                    status: StoreStatus::AlreadyStored,
                    public_id: Some(instance_id),
                });
            }
        }

        let dicom_blob = self.storage.write(bytes)?;
        let json_bytes = dataset.to_bytes()?;
        let json_blob = match self.storage.write(&json_bytes) {
            Ok(blob) => blob,
            Err(err) => {
                self.reclaim_blob(&dicom_blob.key, "orphaned instance");
                return Err(err.into());
            }
        };

        let registration = match self.index.register_instance(NewInstance {
            hierarchy,
            attachments: vec![
                AttachmentInfo::new(ContentType::Dicom, dicom_blob.clone()),
                AttachmentInfo::new(ContentType::DicomAsJson, json_blob.clone()),
            ],
        }) {
            Ok(registration) => registration,
            Err(err) => {
                // The blobs were written but the metadata commit failed;
                // remove the orphans before surfacing the failure.
                self.reclaim_blob(&dicom_blob.key, "orphaned instance");
                self.reclaim_blob(&json_blob.key, "orphaned metadata");
                return Err(err.into());
            }
        };

        for replaced in &registration.replaced {
            self.reclaim_blob(&replaced.blob.key, "replaced attachment");
        }

        self.invalidate_cached(&instance_id);

        for event in &registration.events {
            self.hooks.notify_change(event);
        }

        let job = OnStoredJob {
            hooks: self.hooks.clone(),
            instance: instance_id.clone(),
            simplified: dataset.simplified(),
            origin: origin.clone(),
        };
        if let Err(err) = self.scheduler.submit(Box::new(job)) {
            tracing::error!(
                "failed to schedule on-stored hooks for {}: {}",
                instance_id,
                err
            );
        }

        tracing::info!("stored instance {} ({} bytes)", instance_id, bytes.len());
        Ok(StoreOutcome {
            status: StoreStatus::Success,
            public_id: Some(instance_id),
        })
    }

    /// Reads an attachment's content, decompressing on the fly if it was
    /// stored compressed.
    pub fn read_attachment(
        &self,
        id: &PublicId,
        content_type: ContentType,
    ) -> CoreResult<Vec<u8>> {
        let info = self.index.attachment(id, content_type)?;
        Ok(self.storage.read(&info.blob)?)
    }

    /// Returns an instance's structured metadata.
    ///
    /// Served through the parsed-instance cache: repeated metadata reads of
    /// the same instance reconstruct the dataset once.
    pub fn read_json(&self, id: &PublicId) -> CoreResult<serde_json::Value> {
        let locker = self.lock_parsed_instance(id)?;
        Ok(locker.dataset().to_value())
    }

    /// Acquires exclusive, scoped access to the parsed form of an instance,
    /// reconstructing it from storage on a cache miss.
    pub fn lock_parsed_instance(&self, id: &PublicId) -> CoreResult<CacheLocker<'_>> {
        self.cache.acquire(id, || {
            let info = self.index.attachment(id, ContentType::DicomAsJson)?;
            let bytes = self.storage.read(&info.blob)?;
            InstanceDataset::parse(&bytes)
        })
    }

    /// Adds or replaces an attachment on an existing resource.
    ///
    /// Same ordering and rollback rule as `store`: blob first, index
    /// transaction second, compensating delete of the new blob if the commit
    /// fails. The replaced attachment's blob is only reclaimed after the
    /// commit.
    pub fn add_attachment(
        &self,
        id: &PublicId,
        content_type: ContentType,
        data: &[u8],
    ) -> CoreResult<()> {
        if self.index.lookup(id)?.is_none() {
            return Err(CoreError::UnknownResource(id.to_string()));
        }

        let blob = self.storage.write(data)?;
        let update = match self
            .index
            .add_attachment(id, AttachmentInfo::new(content_type, blob.clone()))
        {
            Ok(update) => update,
            Err(err) => {
                self.reclaim_blob(&blob.key, "orphaned attachment");
                return Err(err.into());
            }
        };

        if let Some(replaced) = &update.replaced {
            self.reclaim_blob(&replaced.blob.key, "replaced attachment");
        }
        self.invalidate_cached(id);
        self.hooks.notify_change(&update.event);
        Ok(())
    }

    /// Removes an attachment. The metadata row goes first; the blob is only
    /// deleted after the transaction commits.
    pub fn remove_attachment(&self, id: &PublicId, content_type: ContentType) -> CoreResult<()> {
        let (removed, event) = self.index.remove_attachment(id, content_type)?;
        self.reclaim_blob(&removed.blob.key, "removed attachment");
        self.invalidate_cached(id);
        self.hooks.notify_change(&event);
        Ok(())
    }

    /// Deletes a resource and everything below it.
    ///
    /// `expected_type` must match the resource's actual level; the check
    /// defends against a mistyped identifier cascading into the wrong
    /// subtree. Returns `false` if the identifier names nothing.
    pub fn delete_resource(
        &self,
        id: &PublicId,
        expected_type: ResourceType,
    ) -> CoreResult<bool> {
        let actual = match self.index.lookup(id)? {
            Some(actual) => actual,
            None => return Ok(false),
        };
        if actual != expected_type {
            return Err(CoreError::UnknownResource(format!(
                "resource {id} is a {actual}, not a {expected_type}"
            )));
        }

        let outcome = self.index.delete_resource(id)?;

        // Metadata rows are gone; the blobs are unreferenced now and can be
        // reclaimed outside any transaction.
        for info in &outcome.attachments {
            self.reclaim_blob(&info.blob.key, "deleted attachment");
        }
        for (resource_id, resource_type) in &outcome.resources {
            if *resource_type == ResourceType::Instance {
                self.invalidate_cached(resource_id);
            }
        }
        for event in &outcome.events {
            self.hooks.notify_change(event);
        }

        tracing::info!(
            "deleted {} {} ({} resources removed)",
            expected_type,
            id,
            outcome.resources.len()
        );
        Ok(true)
    }

    /// Appends a change event for an existing resource and notifies the
    /// registered listeners.
    pub fn signal_change(
        &self,
        id: &PublicId,
        resource_type: ResourceType,
        change_type: ChangeType,
    ) -> CoreResult<ChangeEvent> {
        let event = self.index.record_change(id, resource_type, change_type)?;
        self.hooks.notify_change(&event);
        Ok(event)
    }

    /// Sends a payload to a remote destination, reusing the pooled
    /// association when possible.
    pub fn send_to_modality(
        &self,
        destination: &RemoteDestination,
        payload: &[u8],
    ) -> CoreResult<()> {
        self.pool.send_to(destination, payload)
    }

    /// Parks a transient result set and returns its handle.
    pub fn archive_result(&self, value: serde_json::Value) -> ArchiveHandle {
        self.archive.add(value)
    }

    pub fn index(&self) -> &Arc<dyn ResourceIndex> {
        &self.index
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn query_retrieve_archive(&self) -> &SharedArchive<serde_json::Value> {
        &self.archive
    }

    pub fn set_compression_enabled(&self, enabled: bool) {
        self.storage.set_compression_enabled(enabled);
    }

    pub fn is_compression_enabled(&self) -> bool {
        self.storage.is_compression_enabled()
    }

    pub fn set_store_digest(&self, enabled: bool) {
        self.storage.set_store_digest(enabled);
    }

    pub fn is_store_digest(&self) -> bool {
        self.storage.is_store_digest()
    }

    /// Flags that an administrative restart was requested. The embedding
    /// server owns the polling side: it calls [`Self::take_reset_request`]
    /// from its main loop and performs the actual restart.
    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
    }

    /// Consumes a pending reset request, returning whether one was set.
    pub fn take_reset_request(&self) -> bool {
        self.reset_requested.swap(false, Ordering::SeqCst)
    }

    /// Best-effort blob reclamation used by compensation and post-commit
    /// cleanup paths. Failure is logged, not escalated: an orphan blob is
    /// less harmful than losing the outcome already being reported.
    fn reclaim_blob(&self, key: &str, what: &str) {
        if let Err(err) = self.storage.remove(key) {
            tracing::warn!("failed to remove {} blob {}: {}", what, key, err);
        }
    }

    fn invalidate_cached(&self, id: &PublicId) {
        if let Err(err) = self.cache.invalidate(id) {
            tracing::error!("failed to invalidate cached instance {}: {}", id, err);
        }
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("storage", &self.storage)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Scheduler job carrying the deferred on-stored hook invocations for one
/// freshly stored instance.
struct OnStoredJob {
    hooks: Arc<HookRegistry>,
    instance: PublicId,
    simplified: SimplifiedTags,
    origin: Origin,
}

impl Job for OnStoredJob {
    fn description(&self) -> String {
        format!("on-stored hooks for instance {}", self.instance)
    }

    fn run(&mut self) -> CoreResult<()> {
        self.hooks
            .invoke_on_stored(&self.instance, &self.simplified, &self.origin)
    }
}
