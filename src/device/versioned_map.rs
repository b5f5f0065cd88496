// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, hash::Hash};

/// Revision history of one key: `(revision, value)` pairs in ascending
/// revision order, `None` recording a deletion at that revision.
pub type Revisions<V> = Vec<(u32, Option<V>)>;

/// A map whose writes are stamped with a caller-assigned revision.
///
/// Reads observe the newest entry at or below the map's current `revision`,
/// so a script re-run at a later revision sees updates while the planner can
/// still consult the state an earlier revision produced. `collapse` folds
/// history above a revision back into it once a commit round is final.
#[derive(Debug, Clone)]
pub struct VersionedMap<K, V> {
    map: HashMap<K, Revisions<V>>,
    /// Current read/write revision; assigned by the session driver before
    /// each batch of writes.
    pub revision: u32,
}

impl<K: Eq + Hash + Clone, V: Clone> Default for VersionedMap<K, V> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            revision: 0,
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> VersionedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn visible<'a>(&self, revisions: &'a Revisions<V>) -> Option<&'a V> {
        revisions
            .iter()
            .rev()
            .find(|(rev, _)| *rev <= self.revision)
            .and_then(|(_, v)| v.as_ref())
    }

    /// The value visible at the current revision.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key).and_then(|revs| self.visible(revs))
    }

    pub fn has(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Writes `value` at the current revision, replacing any same-revision
    /// entry.
    pub fn set(&mut self, key: K, value: V) {
        self.write(key, Some(value));
    }

    /// Records the key as absent at the current revision.
    pub fn delete(&mut self, key: &K) {
        if self.map.contains_key(key) {
            self.write(key.clone(), None);
        }
    }

    fn write(&mut self, key: K, value: Option<V>) {
        let revs = self.map.entry(key).or_default();
        while revs.last().is_some_and(|(rev, _)| *rev >= self.revision) {
            revs.pop();
        }
        revs.push((self.revision, value));
    }

    /// Folds every entry above `revision` into a single entry stamped
    /// `revision`. Keys whose whole history collapses to an absence are
    /// dropped.
    pub fn collapse(&mut self, revision: u32) {
        self.map.retain(|_, revs| {
            if let Some(pos) = revs.iter().position(|(rev, _)| *rev > revision) {
                let (_, newest) = revs
                    .drain(pos..)
                    .last()
                    .unwrap_or((revision, None));
                while revs.last().is_some_and(|(rev, _)| *rev >= revision) {
                    revs.pop();
                }
                revs.push((revision, newest));
            }
            !(revs.len() == 1 && revs[0].1.is_none())
        });
    }

    /// Raw history of one key, for persistence.
    pub fn revisions_of(&self, key: &K) -> Option<&Revisions<V>> {
        self.map.get(key)
    }

    /// Restores the raw history of one key, for persistence.
    pub fn set_revisions(&mut self, key: K, revisions: Revisions<V>) {
        if revisions.is_empty() {
            self.map.remove(&key);
        } else {
            self.map.insert(key, revisions);
        }
    }

    /// Keys and values visible at the current revision.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map
            .iter()
            .filter_map(|(k, revs)| self.visible(revs).map(|v| (k, v)))
    }

    /// All keys that carry any history, visible or not.
    pub fn tracked_keys(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }

    /// Number of keys visible at the current revision.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}
