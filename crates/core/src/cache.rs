//! Bounded cache of parsed instance datasets.
//!
//! Reconstructing a parsed instance means a blob read, decompression and a
//! parse; instances accessed repeatedly in a short window should pay that
//! cost once. The cache is protected by a single coarse lock covering both
//! structure mutation (insert, evict) and the scoped access handle, which
//! serializes all cache accesses across all resource ids. That is the
//! baseline contract; a finer-grained variant (striped or per-entry locks)
//! would allow concurrent access to distinct resources but changes contention
//! behaviour, so it is an explicit strengthening, not a drop-in change.

use crate::{CoreError, CoreResult, InstanceDataset};
use opal_types::PublicId;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

struct CacheState {
    entries: HashMap<PublicId, InstanceDataset>,
    /// Least-recently-used id at the front.
    order: VecDeque<PublicId>,
}

/// LRU cache of parsed instances, keyed by public id.
pub struct InstanceCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl InstanceCache {
    /// Creates a cache holding at most `capacity` parsed instances. A zero
    /// capacity is clamped to one, since an entry being accessed must stay
    /// resident for the duration of its locker.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Acquires exclusive, scoped access to the parsed instance `id`.
    ///
    /// On a miss, `provider` reconstructs the dataset (reading through the
    /// storage accessor and index); the result is inserted and the
    /// least-recently-used entry evicted if the cache is full. The returned
    /// locker holds the cache lock until it is dropped, so the lock is
    /// released on every exit path — including when `provider` fails, in
    /// which case no entry is retained.
    pub fn acquire<F>(&self, id: &PublicId, provider: F) -> CoreResult<CacheLocker<'_>>
    where
        F: FnOnce() -> CoreResult<InstanceDataset>,
    {
        let mut guard = self.lock()?;

        if guard.entries.contains_key(id) {
            // Touch: move to most-recently-used position.
            if let Some(pos) = guard.order.iter().position(|entry| entry == id) {
                guard.order.remove(pos);
            }
            guard.order.push_back(id.clone());
        } else {
            let dataset = provider()?;
            guard.entries.insert(id.clone(), dataset);
            guard.order.push_back(id.clone());

            while guard.entries.len() > self.capacity {
                match guard.order.pop_front() {
                    Some(oldest) => {
                        guard.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
        }

        Ok(CacheLocker {
            guard,
            id: id.clone(),
        })
    }

    /// Evicts the entry for `id`, if cached.
    ///
    /// Every write path that changes a resource's primary content must call
    /// this before reporting success; a stale entry here would be served to
    /// all subsequent readers.
    pub fn invalidate(&self, id: &PublicId) -> CoreResult<()> {
        let mut guard = self.lock()?;
        if guard.entries.remove(id).is_some() {
            if let Some(pos) = guard.order.iter().position(|entry| entry == id) {
                guard.order.remove(pos);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().map(|g| g.entries.len()).unwrap_or(0)
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::Internal("instance cache lock poisoned".into()))
    }
}

impl std::fmt::Debug for InstanceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceCache")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Scoped, exclusive handle to one cached parsed instance.
///
/// Holds the cache lock for its whole lifetime; dropping it releases the
/// lock. The entry is guaranteed resident while the locker exists.
pub struct CacheLocker<'a> {
    guard: MutexGuard<'a, CacheState>,
    id: PublicId,
}

impl CacheLocker<'_> {
    pub fn id(&self) -> &PublicId {
        &self.id
    }

    pub fn dataset(&self) -> &InstanceDataset {
        self.guard
            .entries
            .get(&self.id)
            .expect("locked cache entry is resident")
    }

    pub fn dataset_mut(&mut self) -> &mut InstanceDataset {
        self.guard
            .entries
            .get_mut(&self.id)
            .expect("locked cache entry is resident")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(sop: &str) -> InstanceDataset {
        InstanceDataset::from_value(serde_json::json!({
            "PatientID": "p",
            "StudyInstanceUID": "st",
            "SeriesInstanceUID": "se",
            "SOPInstanceUID": sop,
        }))
        .unwrap()
    }

    fn id(sop: &str) -> PublicId {
        PublicId::derive(&["p", "st", "se", sop])
    }

    #[test]
    fn test_miss_invokes_provider_then_hit_does_not() {
        let cache = InstanceCache::new(4);
        let key = id("1");

        let locker = cache.acquire(&key, || Ok(dataset("1"))).unwrap();
        assert_eq!(locker.dataset().tag("SOPInstanceUID"), Some("1"));
        drop(locker);

        // Second acquire must not call the provider.
        let locker = cache
            .acquire(&key, || Err(CoreError::Internal("provider called".into())))
            .unwrap();
        assert_eq!(locker.dataset().tag("SOPInstanceUID"), Some("1"));
    }

    #[test]
    fn test_provider_failure_releases_lock_and_retains_nothing() {
        let cache = InstanceCache::new(4);
        let key = id("1");

        let result = cache.acquire(&key, || Err(CoreError::Internal("read failed".into())));
        assert!(result.is_err());
        assert_eq!(cache.len(), 0);

        // The lock must have been released: a subsequent acquire (same id or
        // another) proceeds.
        let locker = cache.acquire(&key, || Ok(dataset("1"))).unwrap();
        assert_eq!(locker.id(), &key);
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache = InstanceCache::new(2);
        drop(cache.acquire(&id("1"), || Ok(dataset("1"))).unwrap());
        drop(cache.acquire(&id("2"), || Ok(dataset("2"))).unwrap());
        // Touch "1" so "2" becomes the eviction candidate.
        drop(cache
            .acquire(&id("1"), || Err(CoreError::Internal("unexpected".into())))
            .unwrap());
        drop(cache.acquire(&id("3"), || Ok(dataset("3"))).unwrap());

        assert_eq!(cache.len(), 2);
        // "2" was evicted: acquiring it must call the provider again.
        let mut provided = false;
        drop(
            cache
                .acquire(&id("2"), || {
                    provided = true;
                    Ok(dataset("2"))
                })
                .unwrap(),
        );
        assert!(provided);
    }

    #[test]
    fn test_invalidate_forces_reconstruction() {
        let cache = InstanceCache::new(4);
        let key = id("1");
        drop(cache.acquire(&key, || Ok(dataset("1"))).unwrap());
        cache.invalidate(&key).unwrap();

        let mut provided = false;
        drop(
            cache
                .acquire(&key, || {
                    provided = true;
                    Ok(dataset("1"))
                })
                .unwrap(),
        );
        assert!(provided);
    }

    #[test]
    fn test_mutation_through_locker_is_visible_to_next_reader() {
        let cache = InstanceCache::new(4);
        let key = id("1");
        {
            let mut locker = cache.acquire(&key, || Ok(dataset("1"))).unwrap();
            locker.dataset_mut().set_tag("PatientName", "DOE^JANE");
        }
        let locker = cache
            .acquire(&key, || Err(CoreError::Internal("unexpected".into())))
            .unwrap();
        assert_eq!(locker.dataset().tag("PatientName"), Some("DOE^JANE"));
    }
}
