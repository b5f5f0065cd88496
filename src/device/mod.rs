// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The in-memory, versioned device data model and the helpers that keep it
//! consistent: monotonic-timestamp merges, pattern-scoped invalidation,
//! alias expansion, and change tracking.

pub mod versioned_map;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use tracing::debug;

use crate::{
    models::attributes::{AttributeTimestamps, Attributes},
    path::{Path, PathSet, Segment},
    session::declaration::Declaration,
};

pub use versioned_map::VersionedMap;

/// One pending invalidation produced by [`set`]: sweep everything matching
/// `path` that is older than `timestamp` (or, per attribute, older than the
/// corresponding entry of `attributes`).
#[derive(Debug, Clone)]
pub struct ClearEntry {
    pub path: Path,
    pub timestamp: Option<i64>,
    pub attributes: Option<AttributeTimestamps>,
}

impl ClearEntry {
    pub fn sweep(path: Path, timestamp: i64) -> Self {
        Self {
            path,
            timestamp: Some(timestamp),
            attributes: None,
        }
    }
}

/// Aggregate device state for one session: interned paths, versioned
/// timestamp and attribute maps, declaration trackers, and the set of
/// tracker labels whose paths were touched since the last replan.
#[derive(Debug, Default)]
pub struct DeviceData {
    pub paths: PathSet,
    pub timestamps: VersionedMap<Arc<Path>, i64>,
    pub attributes: VersionedMap<Arc<Path>, Attributes>,
    pub trackers: HashMap<Arc<Path>, HashMap<String, u32>>,
    pub changes: HashSet<String>,
}

impl DeviceData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets both versioned maps to the same revision; they must always agree
    /// at observable boundaries.
    pub fn set_revision(&mut self, revision: u32) {
        self.timestamps.revision = revision;
        self.attributes.revision = revision;
    }
}

/// Writes `path` into the data model.
///
/// With `attributes` present, each provided attribute is merged under the
/// monotonic-timestamp rule; a change of the `object` attribute schedules
/// the node's descendants for invalidation through `to_clear`. With
/// `attributes` absent, the path (usually a pattern) is stamped as refreshed
/// at `timestamp` and everything it covers that was not re-confirmed in the
/// same turn is scheduled for invalidation.
pub fn set(
    device_data: &mut DeviceData,
    path: Path,
    timestamp: i64,
    attributes: Option<Attributes>,
    to_clear: &mut Vec<ClearEntry>,
) -> Result<()> {
    let path = device_data.paths.add(path);

    let Some(attrs) = attributes else {
        // A pattern invalidation doubles as an enumeration marker: whatever
        // it covers was (re-)checked at `timestamp`. A concrete
        // invalidation must not stamp the node, or the sweep would spare
        // it.
        if !path.is_concrete() {
            let stamped = device_data
                .timestamps
                .get(&path)
                .copied()
                .unwrap_or(0)
                .max(timestamp);
            device_data.timestamps.set(Arc::clone(&path), stamped);
        }
        to_clear.push(ClearEntry::sweep((*path).clone(), timestamp));
        return Ok(());
    };

    let current = device_data.attributes.get(&path).cloned();
    let mut merged = current.clone().unwrap_or_default();
    let changed = merged.merge(&attrs);

    let object_flipped = match (
        current.as_ref().and_then(Attributes::is_object),
        merged.is_object(),
    ) {
        (Some(before), Some(after)) => before != after,
        _ => false,
    };
    if object_flipped {
        to_clear.push(ClearEntry::sweep(path.child(Segment::Wildcard)?, timestamp));
    }

    let stamped = device_data
        .timestamps
        .get(&path)
        .copied()
        .unwrap_or(0)
        .max(timestamp);
    device_data.timestamps.set(Arc::clone(&path), stamped);
    device_data.attributes.set(Arc::clone(&path), merged);

    if !changed.is_empty() {
        mark_trackers(device_data, &path);
    }
    Ok(())
}

/// Flags the trackers attached to `path` and to any stored pattern covering
/// it, so writes to freshly discovered instances still trigger a replan.
fn mark_trackers(device_data: &mut DeviceData, path: &Arc<Path>) {
    let mut marked: Vec<String> = Vec::new();
    for q in device_data.paths.find(path, true, false, path.len()) {
        if let Some(markers) = device_data.trackers.get(&q) {
            marked.extend(markers.keys().cloned());
        }
    }
    device_data.changes.extend(marked);
}

/// Stamps a path's refresh timestamp without scheduling any invalidation.
/// Used for the ACS-virtual roots a root-level GPN implicitly confirms.
pub fn refresh_timestamp(device_data: &mut DeviceData, path: Path, timestamp: i64) {
    let path = device_data.paths.add(path);
    let stamped = device_data
        .timestamps
        .get(&path)
        .copied()
        .unwrap_or(0)
        .max(timestamp);
    device_data.timestamps.set(path, stamped);
}

/// Removes everything matching `path` that is strictly older than
/// `timestamp` (and/or per-attribute limits), cascading through wildcards to
/// descendants. Tracker labels attached to removed state are recorded in
/// `device_data.changes`.
pub fn clear(
    device_data: &mut DeviceData,
    path: &Path,
    timestamp: Option<i64>,
    attributes: Option<&AttributeTimestamps>,
) {
    let matches = device_data.paths.find(path, true, true, path.len());

    for q in matches {
        let mut touched = false;

        if let Some(limit) = timestamp {
            let stored = device_data.timestamps.get(&q).copied();
            let has_attrs = device_data.attributes.has(&q);
            if (stored.is_some() || has_attrs) && stored.is_none_or(|ts| ts < limit) {
                device_data.timestamps.delete(&q);
                if has_attrs {
                    device_data.attributes.delete(&q);
                }
                touched = true;

                // A removed node takes its whole subtree with it; entries a
                // same-turn write already re-confirmed survive.
                if q.is_concrete() {
                    for d in device_data.paths.find(&q, false, true, Path::MAX_DEPTH) {
                        if d.len() == q.len() {
                            continue;
                        }
                        let dts = device_data.timestamps.get(&d).copied();
                        if dts.is_none_or(|ts| ts < limit) {
                            device_data.timestamps.delete(&d);
                            if device_data.attributes.has(&d) {
                                device_data.attributes.delete(&d);
                            }
                            mark_trackers_of(device_data, &d);
                        }
                    }
                }
            }
        }

        if let Some(limits) = attributes
            && let Some(attrs) = device_data.attributes.get(&q)
        {
            let mut pruned = attrs.clone();
            if pruned.prune_older_than(limits) {
                if pruned.is_empty() {
                    device_data.attributes.delete(&q);
                } else {
                    device_data.attributes.set(Arc::clone(&q), pruned);
                }
                touched = true;
            }
        }

        if touched {
            mark_trackers_of(device_data, &q);
        }
    }
}

fn mark_trackers_of(device_data: &mut DeviceData, path: &Arc<Path>) {
    let markers: Vec<String> = device_data
        .trackers
        .get(path)
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();
    device_data.changes.extend(markers);
}

/// Applies the invalidations accumulated by [`set`].
pub fn apply_clears(device_data: &mut DeviceData, entries: &[ClearEntry]) {
    for entry in entries {
        clear(
            device_data,
            &entry.path,
            entry.timestamp,
            entry.attributes.as_ref(),
        );
    }
}

/// Attaches a tracker label to a path so later invalidation of that path is
/// observable through `device_data.changes`.
pub fn track(device_data: &mut DeviceData, path: &Arc<Path>, marker: &str) {
    *device_data
        .trackers
        .entry(Arc::clone(path))
        .or_default()
        .entry(marker.to_string())
        .or_insert(0) += 1;
}

/// Drops every tracker carrying `marker` and clears its change flag.
pub fn clear_trackers(device_data: &mut DeviceData, marker: &str) {
    device_data.trackers.retain(|_, markers| {
        markers.remove(marker);
        !markers.is_empty()
    });
    device_data.changes.remove(marker);
}

/// Expands a pattern into the concrete, currently-known paths it matches.
/// Alias segments constrain matching instances by the stored values of their
/// key parameters.
pub fn unpack(device_data: &DeviceData, pattern: &Path) -> Vec<Arc<Path>> {
    let dealiased = pattern.dealias();
    let mut out: Vec<Arc<Path>> = device_data
        .paths
        .find(&dealiased, false, true, pattern.len())
        .into_iter()
        .filter(|c| c.is_concrete() && device_data.attributes.has(c))
        .filter(|c| alias_constraints_hold(device_data, pattern, c))
        .collect();
    out.sort();
    out
}

fn alias_constraints_hold(
    device_data: &DeviceData,
    pattern: &Path,
    concrete: &Arc<Path>,
) -> bool {
    if pattern.alias_mask() == 0 {
        return true;
    }
    for i in 0..pattern.len() {
        let Segment::Alias(pairs) = pattern.segment(i) else {
            continue;
        };
        for (key, expected) in pairs {
            let Ok(key_path) = concrete.slice(0, i + 1).concat(key) else {
                return false;
            };
            let Some(stored) = device_data
                .paths
                .get(&key_path)
                .and_then(|p| device_data.attributes.get(&p))
            else {
                return false;
            };
            match &stored.value {
                Some((_, (literal, _))) if literal.to_string() == *expected => {},
                _ => return false,
            }
        }
    }
    true
}

/// Concrete known children of `parent` matching `segment`.
pub fn known_children(
    device_data: &DeviceData,
    parent: &Path,
    segment: &Segment,
) -> Vec<Arc<Path>> {
    match parent.child(segment.clone()) {
        Ok(child_pattern) => unpack(device_data, &child_pattern),
        Err(_) => Vec::new(),
    }
}

/// Highest refresh timestamp claimed for `pattern` by the pattern itself or
/// any stored pattern covering it.
pub fn effective_timestamp(device_data: &DeviceData, pattern: &Path) -> i64 {
    device_data
        .paths
        .find(pattern, true, false, pattern.len())
        .into_iter()
        .filter_map(|q| device_data.timestamps.get(&q).copied())
        .max()
        .unwrap_or(0)
}

/// Expands an aliased declaration path into the prerequisite declarations
/// that make the alias resolvable: the dealiased pattern itself plus a
/// value read for every alias key parameter.
pub fn get_alias_declarations(path: &Path, timestamp: i64) -> Vec<Declaration> {
    let mut declarations = Vec::new();
    let base = path.dealias();

    declarations.push(Declaration::path_get(base.clone(), timestamp));

    for i in 0..path.len() {
        let Segment::Alias(pairs) = path.segment(i) else {
            continue;
        };
        for (key, _) in pairs {
            let Ok(key_pattern) = base.slice(0, i + 1).concat(key) else {
                debug!(path = %path, "alias key exceeds maximum depth, skipped");
                continue;
            };
            declarations.push(Declaration::value_get(key_pattern, timestamp));
        }
    }
    declarations
}
