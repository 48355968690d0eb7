// ── Generic reactive device collection ──
//
// Concurrent storage with O(1) lookups and push-based change
// notification via `watch` channels.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use pedalwire_radio::DeviceId;

/// A concurrent, reactive collection keyed by [`DeviceId`].
///
/// Every mutation bumps a version counter and rebuilds the snapshot that
/// subscribers receive.
pub(crate) struct EntityCollection<T: Clone + Send + Sync + 'static> {
    by_key: DashMap<DeviceId, Arc<T>>,

    /// Version counter, bumped on every mutation.
    version: watch::Sender<u64>,

    /// Full snapshot, rebuilt on mutation for efficient subscription.
    snapshot: watch::Sender<Arc<Vec<Arc<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> EntityCollection<T> {
    pub(crate) fn new() -> Self {
        let (version, _) = watch::channel(0u64);
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));

        Self {
            by_key: DashMap::new(),
            version,
            snapshot,
        }
    }

    /// Insert or replace an entity. Returns `true` if the key was new.
    pub(crate) fn upsert(&self, key: DeviceId, entity: T) -> bool {
        let is_new = self.by_key.insert(key, Arc::new(entity)).is_none();
        self.changed();
        is_new
    }

    /// Insert only if the key is absent. Returns `true` if inserted.
    ///
    /// The check and the insert happen under one shard lock, so two
    /// concurrent callers cannot both win.
    pub(crate) fn insert_if_absent(&self, key: DeviceId, entity: T) -> bool {
        let inserted = match self.by_key.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(entity));
                true
            }
        };
        if inserted {
            self.changed();
        }
        inserted
    }

    /// Replace an existing entity with `f(current)`. Returns the new value,
    /// or `None` if the key is absent or `f` declines.
    pub(crate) fn update(&self, key: &DeviceId, f: impl FnOnce(&T) -> Option<T>) -> Option<Arc<T>> {
        let updated = {
            let mut entry = self.by_key.get_mut(key)?;
            let next = Arc::new(f(entry.value().as_ref())?);
            *entry.value_mut() = Arc::clone(&next);
            next
        };
        self.changed();
        Some(updated)
    }

    /// Remove an entity by key. Returns the removed entity if it existed.
    pub(crate) fn remove(&self, key: &DeviceId) -> Option<Arc<T>> {
        let removed = self.by_key.remove(key).map(|(_, v)| v);
        if removed.is_some() {
            self.changed();
        }
        removed
    }

    /// Keep only entities for which `keep` returns true.
    pub(crate) fn retain(&self, mut keep: impl FnMut(&T) -> bool) {
        let before = self.by_key.len();
        self.by_key.retain(|_, v| keep(v.as_ref()));
        if self.by_key.len() != before {
            self.changed();
        }
    }

    pub(crate) fn get(&self, key: &DeviceId) -> Option<Arc<T>> {
        self.by_key.get(key).map(|r| Arc::clone(r.value()))
    }

    pub(crate) fn contains(&self, key: &DeviceId) -> bool {
        self.by_key.contains_key(key)
    }

    /// Get the current snapshot (cheap `Arc` clone).
    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to snapshot changes via a `watch::Receiver`.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<T>>>> {
        self.snapshot.subscribe()
    }

    /// Remove all entities.
    pub(crate) fn clear(&self) {
        self.by_key.clear();
        self.changed();
    }

    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Return all current keys in the collection.
    pub(crate) fn keys(&self) -> Vec<DeviceId> {
        self.by_key.iter().map(|r| r.key().clone()).collect()
    }

    pub(crate) fn version(&self) -> u64 {
        *self.version.borrow()
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn changed(&self) {
        let values: Vec<Arc<T>> = self.by_key.iter().map(|r| Arc::clone(r.value())).collect();
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
        self.version.send_modify(|v| *v += 1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pedalwire_radio::Transport;

    fn key(n: &str) -> DeviceId {
        DeviceId::new(Transport::Ble, n)
    }

    #[test]
    fn upsert_returns_true_for_new_key() {
        let col: EntityCollection<String> = EntityCollection::new();
        assert!(col.upsert(key("a"), "hello".into()));
        assert!(!col.upsert(key("a"), "world".into()));
        assert_eq!(*col.get(&key("a")).unwrap(), "world");
    }

    #[test]
    fn insert_if_absent_keeps_first_value() {
        let col: EntityCollection<String> = EntityCollection::new();
        assert!(col.insert_if_absent(key("a"), "first".into()));
        assert!(!col.insert_if_absent(key("a"), "second".into()));
        assert_eq!(*col.get(&key("a")).unwrap(), "first");
    }

    #[test]
    fn update_applies_or_declines() {
        let col: EntityCollection<u32> = EntityCollection::new();
        col.upsert(key("a"), 1);
        assert_eq!(*col.update(&key("a"), |v| Some(v + 1)).unwrap(), 2);
        assert!(col.update(&key("a"), |_| None).is_none());
        assert!(col.update(&key("missing"), |v| Some(*v)).is_none());
        assert_eq!(*col.get(&key("a")).unwrap(), 2);
    }

    #[test]
    fn remove_and_retain() {
        let col: EntityCollection<u32> = EntityCollection::new();
        col.upsert(key("a"), 1);
        col.upsert(key("b"), 2);
        col.upsert(key("c"), 3);

        assert_eq!(*col.remove(&key("a")).unwrap(), 1);
        assert!(col.remove(&key("a")).is_none());

        col.retain(|v| *v > 2);
        assert_eq!(col.keys(), vec![key("c")]);
    }

    #[test]
    fn snapshot_and_version_track_mutations() {
        let col: EntityCollection<u32> = EntityCollection::new();
        let rx = col.subscribe();
        assert!(col.snapshot().is_empty());
        let v0 = col.version();

        col.upsert(key("a"), 1);
        col.upsert(key("b"), 2);
        assert_eq!(col.snapshot().len(), 2);
        assert_eq!(rx.borrow().len(), 2);
        assert_eq!(col.version(), v0 + 2);

        col.clear();
        assert!(col.is_empty());
        assert_eq!(col.len(), 0);
        assert!(col.snapshot().is_empty());
    }
}
