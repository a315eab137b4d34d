//! In-memory reference implementation of [`ResourceIndex`].
//!
//! All state lives behind one mutex, which makes every trait method trivially
//! a single commit unit: each method validates against the locked state first
//! and only then mutates, so a returned error always means "nothing was
//! applied". Sequence numbers are assigned under the same lock as the
//! mutation they describe, giving the ordering guarantee the change feed
//! contract requires.

use crate::{
    AttachmentInfo, AttachmentUpdate, DeletionOutcome, IndexError, IndexResult,
    InstanceRegistration, NewInstance, ResourceIndex,
};
use chrono::Utc;
use opal_types::{ChangeEvent, ChangeType, ContentType, PublicId, ResourceType};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

#[derive(Debug)]
struct ResourceRecord {
    resource_type: ResourceType,
    parent: Option<PublicId>,
    children: BTreeSet<PublicId>,
    attachments: HashMap<ContentType, AttachmentInfo>,
}

#[derive(Debug, Default)]
struct IndexState {
    resources: HashMap<PublicId, ResourceRecord>,
    changes: Vec<ChangeEvent>,
    next_seq: u64,
}

impl IndexState {
    fn push_change(
        &mut self,
        id: &PublicId,
        resource_type: ResourceType,
        change_type: ChangeType,
    ) -> ChangeEvent {
        self.next_seq += 1;
        let event = ChangeEvent {
            seq: self.next_seq,
            change_type,
            resource_type,
            public_id: id.clone(),
            recorded_at: Utc::now(),
        };
        self.changes.push(event.clone());
        event
    }
}

/// Thread-safe in-memory index.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    state: Mutex<IndexState>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> IndexResult<std::sync::MutexGuard<'_, IndexState>> {
        self.state
            .lock()
            .map_err(|_| IndexError::Transaction("index lock poisoned".into()))
    }
}

impl ResourceIndex for MemoryIndex {
    fn lookup(&self, id: &PublicId) -> IndexResult<Option<ResourceType>> {
        let state = self.lock()?;
        Ok(state.resources.get(id).map(|r| r.resource_type))
    }

    fn register_instance(&self, request: NewInstance) -> IndexResult<InstanceRegistration> {
        let mut state = self.lock()?;

        // Validation pass: any level that already exists must be of the
        // expected type. Nothing is mutated until the whole path is vetted.
        for (id, _uid, level) in request.hierarchy.levels() {
            if let Some(existing) = state.resources.get(id) {
                if existing.resource_type != level {
                    return Err(IndexError::TypeMismatch {
                        id: id.to_string(),
                        expected: level,
                        actual: existing.resource_type,
                    });
                }
            }
        }

        let mut created = Vec::new();
        let mut events = Vec::new();
        let mut parent: Option<PublicId> = None;
        let instance_id = request.hierarchy.instance.clone();
        let instance_existed = state.resources.contains_key(&instance_id);

        for (id, _uid, level) in request.hierarchy.levels() {
            if !state.resources.contains_key(id) {
                state.resources.insert(
                    id.clone(),
                    ResourceRecord {
                        resource_type: level,
                        parent: parent.clone(),
                        children: BTreeSet::new(),
                        attachments: HashMap::new(),
                    },
                );
                if let Some(parent_id) = &parent {
                    if let Some(parent_record) = state.resources.get_mut(parent_id) {
                        parent_record.children.insert(id.clone());
                    }
                }
                created.push((id.clone(), level));
                let event = state.push_change(id, level, ChangeType::new_resource(level));
                events.push(event);
            }
            parent = Some(id.clone());
        }

        let mut replaced = Vec::new();
        if let Some(record) = state.resources.get_mut(&instance_id) {
            for info in request.attachments {
                if let Some(old) = record.attachments.insert(info.content_type, info) {
                    replaced.push(old);
                }
            }
        }

        if instance_existed {
            let event = state.push_change(
                &instance_id,
                ResourceType::Instance,
                ChangeType::UpdatedAttachment,
            );
            events.push(event);
        }

        Ok(InstanceRegistration {
            created,
            replaced,
            events,
        })
    }

    fn attachment(&self, id: &PublicId, content_type: ContentType) -> IndexResult<AttachmentInfo> {
        let state = self.lock()?;
        let record = state
            .resources
            .get(id)
            .ok_or_else(|| IndexError::UnknownResource(id.to_string()))?;
        record
            .attachments
            .get(&content_type)
            .cloned()
            .ok_or_else(|| IndexError::UnknownAttachment {
                id: id.to_string(),
                content_type,
            })
    }

    fn attachment_digest(
        &self,
        id: &PublicId,
        content_type: ContentType,
    ) -> IndexResult<Option<String>> {
        let state = self.lock()?;
        Ok(state
            .resources
            .get(id)
            .and_then(|r| r.attachments.get(&content_type))
            .and_then(|a| a.blob.digest.clone()))
    }

    fn add_attachment(&self, id: &PublicId, info: AttachmentInfo) -> IndexResult<AttachmentUpdate> {
        let mut state = self.lock()?;
        let resource_type = state
            .resources
            .get(id)
            .map(|r| r.resource_type)
            .ok_or_else(|| IndexError::UnknownResource(id.to_string()))?;

        let replaced = state
            .resources
            .get_mut(id)
            .and_then(|record| record.attachments.insert(info.content_type, info));

        let event = state.push_change(id, resource_type, ChangeType::UpdatedAttachment);
        Ok(AttachmentUpdate { replaced, event })
    }

    fn remove_attachment(
        &self,
        id: &PublicId,
        content_type: ContentType,
    ) -> IndexResult<(AttachmentInfo, ChangeEvent)> {
        let mut state = self.lock()?;
        let resource_type = state
            .resources
            .get(id)
            .map(|r| r.resource_type)
            .ok_or_else(|| IndexError::UnknownResource(id.to_string()))?;

        let removed = state
            .resources
            .get_mut(id)
            .and_then(|record| record.attachments.remove(&content_type))
            .ok_or(IndexError::UnknownAttachment {
                id: id.to_string(),
                content_type,
            })?;

        let event = state.push_change(id, resource_type, ChangeType::UpdatedAttachment);
        Ok((removed, event))
    }

    fn delete_resource(&self, id: &PublicId) -> IndexResult<DeletionOutcome> {
        let mut state = self.lock()?;

        if !state.resources.contains_key(id) {
            return Err(IndexError::UnknownResource(id.to_string()));
        }

        // Collect the target and all descendants, parents before children.
        let mut doomed = vec![id.clone()];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let current = doomed[cursor].clone();
            if let Some(record) = state.resources.get(&current) {
                doomed.extend(record.children.iter().cloned());
            }
            cursor += 1;
        }

        let parent_of_target = state.resources.get(id).and_then(|r| r.parent.clone());

        let mut resources = Vec::new();
        let mut attachments = Vec::new();
        let mut events = Vec::new();

        for victim in &doomed {
            if let Some(record) = state.resources.remove(victim) {
                attachments.extend(record.attachments.into_values());
                resources.push((victim.clone(), record.resource_type));
                let event =
                    state.push_change(victim, record.resource_type, ChangeType::Deleted);
                events.push(event);
            }
        }

        // Prune ancestors left childless by the cascade.
        let mut ancestor = parent_of_target;
        while let Some(current) = ancestor {
            let next = match state.resources.get_mut(&current) {
                Some(record) => {
                    record.children.remove(id);
                    if !record.children.is_empty() {
                        break;
                    }
                    record.parent.clone()
                }
                None => break,
            };
            // Childless after the cascade: remove it as well. Re-borrow since
            // the record must be taken out of the map.
            if let Some(record) = state.resources.remove(&current) {
                attachments.extend(record.attachments.into_values());
                resources.push((current.clone(), record.resource_type));
                let event =
                    state.push_change(&current, record.resource_type, ChangeType::Deleted);
                events.push(event);
            }
            if let Some(next_id) = &next {
                if let Some(next_record) = state.resources.get_mut(next_id) {
                    next_record.children.remove(&current);
                }
            }
            ancestor = next;
        }

        Ok(DeletionOutcome {
            resources,
            attachments,
            events,
        })
    }

    fn record_change(
        &self,
        id: &PublicId,
        resource_type: ResourceType,
        change_type: ChangeType,
    ) -> IndexResult<ChangeEvent> {
        let mut state = self.lock()?;
        let actual = state
            .resources
            .get(id)
            .map(|r| r.resource_type)
            .ok_or_else(|| IndexError::UnknownResource(id.to_string()))?;
        if actual != resource_type {
            return Err(IndexError::TypeMismatch {
                id: id.to_string(),
                expected: resource_type,
                actual,
            });
        }
        Ok(state.push_change(id, resource_type, change_type))
    }

    fn changes_since(&self, since: u64, limit: usize) -> IndexResult<Vec<ChangeEvent>> {
        let state = self.lock()?;
        Ok(state
            .changes
            .iter()
            .filter(|e| e.seq > since)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HierarchyIds;
    use opal_storage::StoredBlob;

    fn hierarchy(patient: &str, study: &str, series: &str, instance: &str) -> HierarchyIds {
        HierarchyIds {
            patient: PublicId::derive(&[patient]),
            study: PublicId::derive(&[patient, study]),
            series: PublicId::derive(&[patient, study, series]),
            instance: PublicId::derive(&[patient, study, series, instance]),
            patient_uid: patient.into(),
            study_uid: study.into(),
            series_uid: series.into(),
            instance_uid: instance.into(),
        }
    }

    fn blob(key: &str, digest: &str) -> StoredBlob {
        StoredBlob {
            key: key.into(),
            digest: Some(digest.into()),
            uncompressed_size: 128,
            is_compressed: false,
        }
    }

    fn register(index: &MemoryIndex, ids: &HierarchyIds, key: &str) -> InstanceRegistration {
        index
            .register_instance(NewInstance {
                hierarchy: ids.clone(),
                attachments: vec![AttachmentInfo::new(ContentType::Dicom, blob(key, key))],
            })
            .unwrap()
    }

    #[test]
    fn test_register_creates_four_levels_with_events() {
        let index = MemoryIndex::new();
        let ids = hierarchy("p1", "st1", "se1", "i1");
        let outcome = register(&index, &ids, "blob0001");

        assert_eq!(outcome.created.len(), 4);
        assert_eq!(outcome.created[0].1, ResourceType::Patient);
        assert_eq!(outcome.created[3].1, ResourceType::Instance);
        assert!(outcome.replaced.is_empty());

        let seqs: Vec<u64> = outcome.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(outcome.events[3].change_type, ChangeType::NewInstance);
        assert_eq!(
            index.lookup(&ids.instance).unwrap(),
            Some(ResourceType::Instance)
        );
    }

    #[test]
    fn test_register_into_existing_series_creates_only_instance() {
        let index = MemoryIndex::new();
        register(&index, &hierarchy("p1", "st1", "se1", "i1"), "blob0001");
        let outcome = register(&index, &hierarchy("p1", "st1", "se1", "i2"), "blob0002");

        assert_eq!(outcome.created.len(), 1);
        assert_eq!(outcome.created[0].1, ResourceType::Instance);
    }

    #[test]
    fn test_reregistering_instance_replaces_attachment() {
        let index = MemoryIndex::new();
        let ids = hierarchy("p1", "st1", "se1", "i1");
        register(&index, &ids, "blob0001");
        let outcome = register(&index, &ids, "blob0002");

        assert!(outcome.created.is_empty());
        assert_eq!(outcome.replaced.len(), 1);
        assert_eq!(outcome.replaced[0].blob.key, "blob0001");
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(
            outcome.events[0].change_type,
            ChangeType::UpdatedAttachment
        );
    }

    #[test]
    fn test_attachment_digest_lookup_is_not_an_error_when_absent() {
        let index = MemoryIndex::new();
        let ids = hierarchy("p1", "st1", "se1", "i1");
        assert_eq!(
            index
                .attachment_digest(&ids.instance, ContentType::Dicom)
                .unwrap(),
            None
        );

        register(&index, &ids, "blob0001");
        assert_eq!(
            index
                .attachment_digest(&ids.instance, ContentType::Dicom)
                .unwrap()
                .as_deref(),
            Some("blob0001")
        );
    }

    #[test]
    fn test_add_and_remove_attachment() {
        let index = MemoryIndex::new();
        let ids = hierarchy("p1", "st1", "se1", "i1");
        register(&index, &ids, "blob0001");

        let update = index
            .add_attachment(
                &ids.instance,
                AttachmentInfo::new(ContentType::Preview, blob("prev0001", "d")),
            )
            .unwrap();
        assert!(update.replaced.is_none());
        assert_eq!(update.event.change_type, ChangeType::UpdatedAttachment);

        let (removed, _event) = index
            .remove_attachment(&ids.instance, ContentType::Preview)
            .unwrap();
        assert_eq!(removed.blob.key, "prev0001");

        assert!(matches!(
            index.remove_attachment(&ids.instance, ContentType::Preview),
            Err(IndexError::UnknownAttachment { .. })
        ));
    }

    #[test]
    fn test_add_attachment_to_unknown_resource() {
        let index = MemoryIndex::new();
        let ids = hierarchy("p1", "st1", "se1", "i1");
        assert!(matches!(
            index.add_attachment(
                &ids.instance,
                AttachmentInfo::new(ContentType::Preview, blob("prev0001", "d")),
            ),
            Err(IndexError::UnknownResource(_))
        ));
    }

    #[test]
    fn test_delete_study_cascades_and_prunes_childless_patient() {
        let index = MemoryIndex::new();
        let ids = hierarchy("p1", "st1", "se1", "i1");
        register(&index, &ids, "blob0001");

        let outcome = index.delete_resource(&ids.study).unwrap();

        // Study, series, instance, plus the patient pruned by the cascade.
        assert_eq!(outcome.resources.len(), 4);
        assert_eq!(outcome.attachments.len(), 1);
        assert_eq!(outcome.events.len(), 4);
        assert!(outcome
            .events
            .iter()
            .all(|e| e.change_type == ChangeType::Deleted));
        assert_eq!(index.lookup(&ids.patient).unwrap(), None);
    }

    #[test]
    fn test_delete_keeps_siblings_and_their_ancestors() {
        let index = MemoryIndex::new();
        let a = hierarchy("p1", "st1", "se1", "i1");
        let b = hierarchy("p1", "st1", "se2", "i2");
        register(&index, &a, "blob0001");
        register(&index, &b, "blob0002");

        let outcome = index.delete_resource(&a.series).unwrap();
        assert_eq!(outcome.resources.len(), 2); // series + instance only

        assert_eq!(index.lookup(&a.study).unwrap(), Some(ResourceType::Study));
        assert_eq!(
            index.lookup(&b.instance).unwrap(),
            Some(ResourceType::Instance)
        );
    }

    #[test]
    fn test_delete_unknown_resource() {
        let index = MemoryIndex::new();
        let ids = hierarchy("p1", "st1", "se1", "i1");
        assert!(matches!(
            index.delete_resource(&ids.instance),
            Err(IndexError::UnknownResource(_))
        ));
    }

    #[test]
    fn test_record_change_validates_resource_and_type() {
        let index = MemoryIndex::new();
        let ids = hierarchy("p1", "st1", "se1", "i1");
        register(&index, &ids, "blob0001");

        let event = index
            .record_change(
                &ids.instance,
                ResourceType::Instance,
                ChangeType::UpdatedAttachment,
            )
            .unwrap();
        assert!(event.seq > 0);

        assert!(matches!(
            index.record_change(
                &ids.instance,
                ResourceType::Series,
                ChangeType::UpdatedAttachment
            ),
            Err(IndexError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_changes_since_pages_in_sequence_order() {
        let index = MemoryIndex::new();
        register(&index, &hierarchy("p1", "st1", "se1", "i1"), "blob0001");

        let first = index.changes_since(0, 2).unwrap();
        assert_eq!(first.len(), 2);
        let rest = index.changes_since(first[1].seq, 100).unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest[0].seq > first[1].seq);
    }
}
