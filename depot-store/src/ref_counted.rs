//! Keyed resources with reference-counted lifetimes.
//!
//! A [`RefCountedResource`] hands out one shared instance per key and tears
//! it down once the last holder lets go. Acquire and release go through a
//! single mutex over the whole map so creation and destruction never race.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

type Create<K, T> = Box<dyn Fn(&K) -> T + Send + Sync>;
type OnRelease<K, T> = Box<dyn Fn(&K, &Arc<T>) + Send + Sync>;

struct Entry<T> {
    value: Arc<T>,
    acquired: usize,
}

/// Registry of per-key resources, created lazily and destroyed at zero
/// references.
pub struct RefCountedResource<K, T> {
    entries: Mutex<HashMap<K, Entry<T>>>,
    create: Create<K, T>,
    on_release: Option<OnRelease<K, T>>,
}

impl<K, T> RefCountedResource<K, T>
where
    K: Clone + Eq + Hash + fmt::Debug,
{
    pub fn new<F>(create: F) -> Self
    where
        F: Fn(&K) -> T + Send + Sync + 'static,
    {
        Self {
            entries: Mutex::new(HashMap::new()),
            create: Box::new(create),
            on_release: None,
        }
    }

    /// Same as [`new`](Self::new), with a teardown callback invoked when an
    /// entry's count drops to zero.
    pub fn with_release<F, R>(create: F, on_release: R) -> Self
    where
        F: Fn(&K) -> T + Send + Sync + 'static,
        R: Fn(&K, &Arc<T>) + Send + Sync + 'static,
    {
        Self {
            entries: Mutex::new(HashMap::new()),
            create: Box::new(create),
            on_release: Some(Box::new(on_release)),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, Entry<T>>> {
        // A panicking holder cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create-or-reuse the resource for `key` and bump its count.
    ///
    /// The returned lease releases the acquisition when dropped.
    pub fn acquire(self: &Arc<Self>, key: &K) -> Lease<K, T> {
        let value = {
            let mut entries = self.entries();
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                value: Arc::new((self.create)(key)),
                acquired: 0,
            });
            entry.acquired += 1;
            Arc::clone(&entry.value)
        };
        Lease {
            owner: Arc::clone(self),
            key: key.clone(),
            value,
        }
    }

    /// Drop one acquisition of `value` for `key`.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not the instance currently tracked for `key`.
    /// That only happens on a double release or a leaked acquisition.
    pub fn release(&self, key: &K, value: &Arc<T>) {
        let released = {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(key) else {
                panic!("inconsistent release for key {:?}: nothing acquired", key);
            };
            if !Arc::ptr_eq(&entry.value, value) {
                panic!("inconsistent release for key {:?}: instance mismatch", key);
            }
            entry.acquired -= 1;
            if entry.acquired == 0 {
                entries.remove(key).map(|entry| entry.value)
            } else {
                None
            }
        };

        if let (Some(value), Some(on_release)) = (released, &self.on_release) {
            on_release(key, &value);
        }
    }

    /// Number of live entries.
    pub fn size(&self) -> usize {
        self.entries().len()
    }
}

/// One acquisition of a keyed resource. Releases itself on drop.
pub struct Lease<K, T>
where
    K: Clone + Eq + Hash + fmt::Debug,
{
    owner: Arc<RefCountedResource<K, T>>,
    key: K,
    value: Arc<T>,
}

impl<K, T> Lease<K, T>
where
    K: Clone + Eq + Hash + fmt::Debug,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn shared(&self) -> &Arc<T> {
        &self.value
    }
}

impl<K, T> Deref for Lease<K, T>
where
    K: Clone + Eq + Hash + fmt::Debug,
{
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<K, T> Drop for Lease<K, T>
where
    K: Clone + Eq + Hash + fmt::Debug,
{
    fn drop(&mut self) {
        self.owner.release(&self.key, &self.value);
    }
}

impl<K, T> fmt::Debug for Lease<K, T>
where
    K: Clone + Eq + Hash + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("key", &self.key).finish()
    }
}
