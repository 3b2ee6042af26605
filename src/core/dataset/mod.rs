// SPDX-License-Identifier: MIT OR Apache-2.0

//! Keyed dataset contract and a minimal in-memory implementation.
//!
//! The engine consumes mutations through [`MutationListener::on_mutate`].
//! A dataset must notify its listener while still holding the lock that
//! orders its mutations, and [`Dataset::scan_locked`] must hold that same
//! lock for the duration of the scan. Together these make a continuous
//! query's initial snapshot and the start of incremental evaluation atomic.
//! Once the lock is released the dataset calls
//! [`MutationListener::after_mutate`], where listener callbacks that may read
//! the dataset are run.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use crate::core::event::{AttributeValue, Mutation, MutationKind};

/// Receives every mutation applied to a dataset, in mutation order.
pub trait MutationListener: Send + Sync {
    /// Called with the dataset's mutation lock held.
    fn on_mutate(&self, mutation: &Mutation);

    /// Called after the mutation lock is released.
    fn after_mutate(&self) {}
}

/// Iterator over `(key, value)` entries handed to a locked scan
pub type Entries<'e> = dyn Iterator<Item = (&'e str, &'e AttributeValue)> + 'e;

pub trait Dataset: Send + Sync {
    fn get(&self, key: &str) -> Option<AttributeValue>;

    /// Run `scan` over every entry while mutations are held off.
    ///
    /// `scan` must not mutate the dataset.
    fn scan_locked(&self, scan: &mut dyn for<'e> FnMut(&mut Entries<'e>));
}

/// Ordered in-memory map that notifies a single mutation listener.
#[derive(Default)]
pub struct InMemoryDataset {
    entries: RwLock<BTreeMap<String, AttributeValue>>,
    listener: RwLock<Option<Weak<dyn MutationListener>>>,
}

impl std::fmt::Debug for InMemoryDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDataset")
            .field("entries", &self.len())
            .finish()
    }
}

impl InMemoryDataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the listener that receives every subsequent mutation. Only a
    /// weak reference is kept.
    pub fn set_mutation_listener<L>(&self, listener: &Arc<L>)
    where
        L: MutationListener + 'static,
    {
        let weak: Weak<dyn MutationListener> = Arc::downgrade(listener) as Weak<dyn MutationListener>;
        *self.listener.write().expect("dataset listener lock poisoned") = Some(weak);
    }

    pub fn clear_mutation_listener(&self) {
        *self.listener.write().expect("dataset listener lock poisoned") = None;
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, AttributeValue>> {
        self.entries.read().expect("dataset lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, AttributeValue>> {
        self.entries.write().expect("dataset lock poisoned")
    }

    fn listener(&self) -> Option<Arc<dyn MutationListener>> {
        self.listener
            .read()
            .expect("dataset listener lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn notify(&self, mutation: &Mutation) {
        if let Some(listener) = self.listener() {
            listener.on_mutate(mutation);
        }
    }

    fn notify_committed(&self) {
        if let Some(listener) = self.listener() {
            listener.after_mutate();
        }
    }

    /// Create or update `key`. Returns the previous value.
    pub fn put(&self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Option<AttributeValue> {
        let key = key.into();
        let value = value.into();
        let mut entries = self.write();
        let old = entries.insert(key.clone(), value.clone());
        let kind = if old.is_some() {
            MutationKind::Update
        } else {
            MutationKind::Create
        };
        let mutation = Mutation::new(key, old.clone(), Some(value), kind);
        // Listener runs under the write lock so mutation order is delivery order
        self.notify(&mutation);
        drop(entries);
        self.notify_committed();
        old
    }

    /// Remove `key`. Destroying an absent key is not a mutation.
    pub fn destroy(&self, key: &str) -> Option<AttributeValue> {
        let mut entries = self.write();
        let old = entries.remove(key)?;
        let mutation = Mutation::new(key, Some(old.clone()), None, MutationKind::Destroy);
        self.notify(&mutation);
        drop(entries);
        self.notify_committed();
        Some(old)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Dataset for InMemoryDataset {
    fn get(&self, key: &str) -> Option<AttributeValue> {
        self.read().get(key).cloned()
    }

    fn scan_locked(&self, scan: &mut dyn for<'e> FnMut(&mut Entries<'e>)) {
        let entries = self.read();
        let mut iter = entries.iter().map(|(k, v)| (k.as_str(), v));
        scan(&mut iter);
    }
}
