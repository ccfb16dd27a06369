//! Bidirectional key index
//!
//! Maps caller-supplied string keys to payload identities and back in
//! constant time. Both directions are kept in lockstep: for every `(k, v)`
//! in the forward map the reverse map holds `(v, k)`.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

/// Strict one-to-one mapping between keys and values
#[derive(Debug, Clone)]
pub struct KeyIndex<K, V> {
    forward: HashMap<K, V>,
    reverse: HashMap<V, K>,
}

impl<K, V> KeyIndex<K, V>
where
    K: Hash + Eq + Clone,
    V: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Bind `key` to `value`.
    ///
    /// Any previous binding of `key` and any previous binding of `value`
    /// under another key are dropped first, so the index never holds a stale
    /// reverse pointer.
    pub fn insert(&mut self, key: K, value: V) {
        if let Some(old_value) = self.forward.remove(&key) {
            self.reverse.remove(&old_value);
        }
        if let Some(old_key) = self.reverse.remove(&value) {
            self.forward.remove(&old_key);
        }
        self.forward.insert(key.clone(), value.clone());
        self.reverse.insert(value, key);
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.forward.get(key)
    }

    pub fn get_by_value(&self, value: &V) -> Option<&K> {
        self.reverse.get(value)
    }

    /// Remove the binding for `key`.
    ///
    /// Returns true only if both directions held an entry and both were
    /// removed. A half-present binding is still cleaned up but reports false.
    pub fn remove<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut removed = 0;
        if let Some(value) = self.forward.get(key) {
            removed += usize::from(self.reverse.remove(value).is_some());
        }
        removed += usize::from(self.forward.remove(key).is_some());
        removed == 2
    }

    /// Remove the binding for `value`, with the same both-sides contract as
    /// [`KeyIndex::remove`].
    pub fn remove_by_value(&mut self, value: &V) -> bool {
        let mut removed = 0;
        if let Some(key) = self.reverse.get(value) {
            removed += usize::from(self.forward.remove(key).is_some());
        }
        removed += usize::from(self.reverse.remove(value).is_some());
        removed == 2
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }
}

impl<K, V> Default for KeyIndex<K, V>
where
    K: Hash + Eq + Clone,
    V: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
