// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    models::attributes::{AttributeTimestamps, AttributeValues},
    path::Path,
};

/// Desired instance cardinality of a `pathSet` declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceBounds {
    pub min: u32,
    /// Unbounded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

impl InstanceBounds {
    /// Exactly `n` instances.
    pub fn exactly(n: u32) -> Self {
        Self {
            min: n,
            max: Some(n),
        }
    }

    pub fn range(min: u32, max: u32) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }
}

/// One assertion emitted by a provision or virtual-parameter script.
///
/// Declarations are the engine's IR: scripts declare *what* must hold
/// (existence freshness, attribute freshness, attribute values, instance
/// cardinality) and the planner derives the RPCs that make it hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    pub path: Path,
    /// The path's existence must have been (re-)confirmed no earlier than
    /// this timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_get: Option<i64>,
    /// Desired number of instances matching the path's final pattern
    /// segment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_set: Option<InstanceBounds>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attr_get: Option<AttributeTimestamps>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attr_set: Option<AttributeValues>,
    /// Set while the emitting script batch has not completed; deferred
    /// attribute values do not create new plan entries on their own.
    #[serde(default)]
    pub defer: bool,
}

impl Declaration {
    pub fn new(path: Path) -> Self {
        Self {
            path,
            path_get: None,
            path_set: None,
            attr_get: None,
            attr_set: None,
            defer: true,
        }
    }

    /// Existence freshness only.
    pub fn path_get(path: Path, timestamp: i64) -> Self {
        Self {
            path_get: Some(timestamp),
            ..Self::new(path)
        }
    }

    /// Existence plus a fresh value read.
    pub fn value_get(path: Path, timestamp: i64) -> Self {
        Self {
            path_get: Some(timestamp),
            attr_get: Some(AttributeTimestamps {
                value: Some(timestamp),
                ..Default::default()
            }),
            ..Self::new(path)
        }
    }

    /// Caps every declared timestamp at `limit`; scripts may not demand
    /// freshness from the future.
    pub fn cap_timestamps(&mut self, limit: i64) {
        if let Some(t) = &mut self.path_get {
            *t = (*t).min(limit);
        }
        if let Some(at) = &mut self.attr_get {
            at.cap(limit);
        }
    }
}

/// A declaration that survived the `VirtualParameters` filter: `path` is the
/// interned, concrete `VirtualParameters.<name>` node (or the root during
/// object-attribute upkeep).
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualParameterDeclaration {
    pub path: Arc<Path>,
    pub path_get: Option<i64>,
    pub attr_get: Option<AttributeTimestamps>,
    pub attr_set: Option<AttributeValues>,
}
