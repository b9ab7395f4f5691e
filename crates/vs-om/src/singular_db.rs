//! The interning table giving each family one canonical instance per key.
//!
//! Entries are weak: the table never keeps an object alive.  Client
//! reference sets hold the strong pointers; when the last one drops, the
//! object's destructor sweeps it and scrubs its entry here.

use crate::object_base::ObjectBase;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Family-parametric intern map `K -> weak V`.
pub struct SingularDb<K, V> {
    map: Mutex<BTreeMap<K, Weak<V>>>,
}

impl<K: Ord, V> Default for SingularDb<K, V> {
    fn default() -> Self {
        SingularDb {
            map: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<K: Ord + Clone, V> SingularDb<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the canonical instance for `key`, constructing it from the
    /// caller's template when absent or expired.  Two callers supplying
    /// equal keys observe the same shared instance.
    pub fn find_or_add<F>(&self, key: K, make: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        if let Some(existing) = self.find(&key) {
            return existing;
        }
        // Constructed outside the lock so a family's constructor may intern
        // the objects it references.
        let fresh = Arc::new(make());
        let mut map = self.map.lock();
        if let Some(raced) = map.get(&key).and_then(Weak::upgrade) {
            return raced;
        }
        map.insert(key, Arc::downgrade(&fresh));
        fresh
    }

    /// Look up a live canonical instance; expired entries are absent.
    pub fn find(&self, key: &K) -> Option<Arc<V>> {
        self.map.lock().get(key).and_then(Weak::upgrade)
    }

    /// Publish an existing instance under an additional key (a family
    /// reachable by more than one identity, e.g. a tunnel by endpoint and
    /// by interface name).
    pub fn add(&self, key: K, obj: &Arc<V>) {
        self.map.lock().insert(key, Arc::downgrade(obj));
    }

    /// Scrub an entry from a destructor.  Only expired entries are removed,
    /// so a re-intern racing the teardown keeps its fresh entry.
    pub fn release(&self, key: &K) {
        let mut map = self.map.lock();
        if let Some(weak) = map.get(key)
            && weak.upgrade().is_none()
        {
            map.remove(key);
        }
    }

    /// Number of live entries.
    pub fn live_count(&self) -> usize {
        self.map
            .lock()
            .values()
            .filter(|w| w.upgrade().is_some())
            .count()
    }

    fn live(&self) -> Vec<Arc<V>> {
        self.map.lock().values().filter_map(Weak::upgrade).collect()
    }
}

impl<K: Ord + Clone, V: ObjectBase> SingularDb<K, V> {
    /// Re-issue creates for every live entry, in key order.
    pub fn replay(&self) {
        for obj in self.live() {
            debug!(obj = %obj, "replay");
            obj.replay();
        }
    }

    /// Stringify every live entry into the stream provided.
    pub fn dump(&self, out: &mut String) {
        for obj in self.live() {
            let _ = writeln!(out, "{obj}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        name: String,
        replays: AtomicUsize,
    }

    impl Probe {
        fn new(name: &str) -> Self {
            Probe {
                name: name.to_owned(),
                replays: AtomicUsize::new(0),
            }
        }
    }

    impl std::fmt::Display for Probe {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "probe:[{}]", self.name)
        }
    }

    impl ObjectBase for Probe {
        fn sweep(&self) {}
        fn replay(&self) {
            self.replays.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn equal_keys_observe_the_same_instance() {
        let db: SingularDb<u32, Probe> = SingularDb::new();
        let a = db.find_or_add(7, || Probe::new("a"));
        let b = db.find_or_add(7, || Probe::new("b"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name, "a");
        assert_eq!(db.live_count(), 1);
    }

    #[test]
    fn expired_entries_are_absent_and_released() {
        let db: SingularDb<u32, Probe> = SingularDb::new();
        let a = db.find_or_add(7, || Probe::new("a"));
        drop(a);
        assert!(db.find(&7).is_none());
        db.release(&7);
        // a new intern after release constructs afresh
        let b = db.find_or_add(7, || Probe::new("b"));
        assert_eq!(b.name, "b");
    }

    #[test]
    fn release_keeps_a_live_reintern() {
        let db: SingularDb<u32, Probe> = SingularDb::new();
        let fresh = db.find_or_add(7, || Probe::new("fresh"));
        // a stale destructor releasing the key must not evict the live entry
        db.release(&7);
        assert!(db.find(&7).is_some());
        drop(fresh);
    }

    #[test]
    fn secondary_key_reaches_the_same_instance() {
        let db: SingularDb<String, Probe> = SingularDb::new();
        let a = db.find_or_add("primary".to_owned(), || Probe::new("a"));
        db.add("alias".to_owned(), &a);
        let via_alias = db.find(&"alias".to_owned()).unwrap();
        assert!(Arc::ptr_eq(&a, &via_alias));
    }

    #[test]
    fn replay_visits_only_live_entries() {
        let db: SingularDb<u32, Probe> = SingularDb::new();
        let a = db.find_or_add(1, || Probe::new("a"));
        let b = db.find_or_add(2, || Probe::new("b"));
        drop(b);
        db.replay();
        assert_eq!(a.replays.load(Ordering::SeqCst), 1);
        let mut out = String::new();
        db.dump(&mut out);
        assert_eq!(out, "probe:[a]\n");
    }
}
