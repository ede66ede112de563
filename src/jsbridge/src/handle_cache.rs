/*!
Identity keyed caches of guest references, and the queue through which guest side collection
and host side drops release them.

Nothing in here touches the engine directly. Entries are inserted and removed by the bridge
while the owning context holds its engine lock; release notifications can be raised from any
thread (or from a guest finalizer in the middle of a collection) and are only recorded in the
[`ReleaseQueue`] until the context drains it.
*/

use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use hashbrown::HashMap;
use rquickjs::{Object, Persistent};

/// A map from a stable identity to a long-lived guest reference.
pub(crate) struct HandleCache<K, V> {
    name: &'static str,
    entries: HashMap<K, V>,
}

impl<K: Hash + Eq, V> HandleCache<K, V> {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: HashMap::new(),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub(crate) fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    /// Remove the entry for `key` only if `matches` accepts it.
    pub(crate) fn remove_if(&mut self, key: &K, matches: impl FnOnce(&V) -> bool) -> Option<V> {
        if self.entries.get(key).is_some_and(matches) {
            self.entries.remove(key)
        } else {
            None
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry, returning them in no particular order.
    pub(crate) fn release_all(&mut self) -> Vec<V> {
        self.entries.drain().map(|(_, v)| v).collect()
    }
}

/// A guest object held weakly, together with the host reference it keeps alive.
pub(crate) struct WeakEntry<T> {
    /// A guest `WeakRef` pointing at the wrapper.
    pub(crate) weak: Persistent<Object<'static>>,
    pub(crate) target: T,
    /// Distinguishes this wrapper from later wrappers created for the same identity.
    pub(crate) serial: u64,
    /// Bytes charged to external memory when the wrapper was created.
    pub(crate) charge: usize,
}

/// A pending release of a guest reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Release {
    /// A host object wrapper was collected by the guest.
    HostObject { key: usize, serial: u64 },
    /// A host closure wrapper was collected by the guest.
    Closure { key: usize, serial: u64 },
    /// A script resource was disposed or dropped.
    Script(u64),
    /// The last host handle to a guest object was dropped.
    Guest(u64),
}

/// A thread safe queue of pending releases.
#[derive(Clone, Default)]
pub(crate) struct ReleaseQueue(Arc<Mutex<Vec<Release>>>);

impl ReleaseQueue {
    pub(crate) fn push(&self, release: Release) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(release);
    }

    pub(crate) fn take(&self) -> Vec<Release> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Pushes a release onto a queue when dropped.
///
/// Stored inside guest wrappers, so the guest collector finalizing a wrapper notifies the
/// context without the finalizer touching any engine state.
pub(crate) struct ReleaseGuard {
    queue: ReleaseQueue,
    release: Release,
}

impl ReleaseGuard {
    pub(crate) fn new(queue: ReleaseQueue, release: Release) -> Self {
        Self { queue, release }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.queue.push(self.release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_if_checks_serial() {
        let mut cache = HandleCache::new("test");
        cache.insert(1usize, 10u64);
        assert_eq!(cache.remove_if(&1, |serial| *serial == 9), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.remove_if(&1, |serial| *serial == 10), Some(10));
        assert!(cache.is_empty());
        assert_eq!(cache.name(), "test");
    }

    #[test]
    fn release_all_empties_the_cache() {
        let mut cache = HandleCache::new("test");
        cache.insert("a", 1);
        cache.insert("b", 2);
        let mut released = cache.release_all();
        released.sort();
        assert_eq!(released, [1, 2]);
        assert!(cache.is_empty());
    }

    #[test]
    fn guard_enqueues_on_drop() {
        let queue = ReleaseQueue::default();
        let guard = ReleaseGuard::new(queue.clone(), Release::Script(7));
        assert_eq!(queue.len(), 0);
        drop(guard);
        assert_eq!(queue.take(), [Release::Script(7)]);
        assert_eq!(queue.len(), 0);
    }
}
