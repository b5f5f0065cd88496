// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, sync::Arc};

use crate::path::path::{Path, Segment};

/// Interning store for [`Path`] values, indexed by depth.
///
/// Every path the engine touches goes through [`PathSet::add`] so that all
/// data structures share one `Arc` per distinct path and pattern queries can
/// be answered per depth level.
#[derive(Debug, Default)]
pub struct PathSet {
    index: HashMap<String, Arc<Path>>,
    by_depth: Vec<Vec<Arc<Path>>>,
}

impl PathSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `path` and returns the canonical instance.
    pub fn add(&mut self, path: Path) -> Arc<Path> {
        if let Some(p) = self.index.get(path.as_str()) {
            return Arc::clone(p);
        }
        let depth = path.len();
        let arc = Arc::new(path);
        self.index.insert(arc.as_str().to_string(), Arc::clone(&arc));
        if self.by_depth.len() <= depth {
            self.by_depth.resize_with(depth + 1, Vec::new);
        }
        self.by_depth[depth].push(Arc::clone(&arc));
        arc
    }

    /// Returns the interned instance of `path`, if present.
    pub fn get(&self, path: &Path) -> Option<Arc<Path>> {
        self.index.get(path.as_str()).cloned()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Path>> {
        self.index.values()
    }

    /// Finds interned paths matching `pattern`.
    ///
    /// With `superset` set, a stored wildcard/alias segment is allowed to
    /// stand in for an exact pattern segment (stored patterns covering the
    /// query). With `subset` set, an exact stored segment is allowed where
    /// the pattern has a wildcard/alias (stored paths covered by the query).
    /// `max_depth` extends the match to descendants: stored paths deeper
    /// than the pattern match on the pattern's prefix alone.
    pub fn find(
        &self,
        pattern: &Path,
        superset: bool,
        subset: bool,
        max_depth: usize,
    ) -> Vec<Arc<Path>> {
        let lo = pattern.len();
        let hi = max_depth.min(self.by_depth.len().saturating_sub(1));
        let mut out = Vec::new();
        for depth in lo..=hi {
            let Some(bucket) = self.by_depth.get(depth) else {
                continue;
            };
            for stored in bucket {
                if Self::matches(pattern, stored, superset, subset) {
                    out.push(Arc::clone(stored));
                }
            }
        }
        out.sort();
        out
    }

    fn matches(pattern: &Path, stored: &Path, superset: bool, subset: bool) -> bool {
        for i in 0..pattern.len() {
            let p = pattern.segment(i);
            let s = stored.segment(i);
            let ok = match (p, s) {
                (a, b) if a == b => true,
                (Segment::Name(_) | Segment::Instance(_), Segment::Wildcard)
                | (Segment::Name(_) | Segment::Instance(_), Segment::Alias(_)) => {
                    superset
                },
                (Segment::Wildcard | Segment::Alias(_), _) if s.is_exact() => subset,
                (Segment::Wildcard, Segment::Alias(_)) => subset,
                (Segment::Alias(_), Segment::Wildcard) => superset,
                _ => false,
            };
            if !ok {
                return false;
            }
        }
        true
    }
}
