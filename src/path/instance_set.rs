// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::BTreeMap;

/// A key map identifying one planned instance of a multi-instance object:
/// relative key path → required value.
pub type InstanceKeys = BTreeMap<String, String>;

/// Set of planned instances, each described by its alias key values.
///
/// Used by the declaration processor to accumulate `AddObject` candidates
/// and to answer whether an instance with a compatible key set is already
/// planned (`superset`/`subset` queries).
#[derive(Debug, Default, Clone)]
pub struct InstanceSet {
    instances: Vec<InstanceKeys>,
}

impl InstanceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, keys: InstanceKeys) {
        self.instances.push(keys);
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instances whose keys include every pair of `keys`.
    pub fn superset(&self, keys: &InstanceKeys) -> Vec<&InstanceKeys> {
        self.instances
            .iter()
            .filter(|m| keys.iter().all(|(k, v)| m.get(k) == Some(v)))
            .collect()
    }

    /// Instances whose every key pair appears in `keys`.
    pub fn subset(&self, keys: &InstanceKeys) -> Vec<&InstanceKeys> {
        self.instances
            .iter()
            .filter(|m| m.iter().all(|(k, v)| keys.get(k) == Some(v)))
            .collect()
    }

    /// Removes and returns one instance whose keys include every pair of
    /// `keys`.
    pub fn take_superset(&mut self, keys: &InstanceKeys) -> Option<InstanceKeys> {
        let idx = self
            .instances
            .iter()
            .position(|m| keys.iter().all(|(k, v)| m.get(k) == Some(v)))?;
        Some(self.instances.remove(idx))
    }

    /// Removes and returns the first planned instance.
    pub fn take_next(&mut self) -> Option<InstanceKeys> {
        if self.instances.is_empty() {
            None
        } else {
            Some(self.instances.remove(0))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceKeys> {
        self.instances.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = InstanceKeys> + '_ {
        self.instances.drain(..)
    }
}
