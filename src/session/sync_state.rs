// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use crate::{
    models::value::Literal,
    path::{InstanceSet, Path},
    session::declaration::VirtualParameterDeclaration,
};

/// Pending attribute-refresh demands, keyed by declared pattern with the
/// freshness timestamp the declaration asked for. Entries are drained
/// lazily: a pattern only produces RPC work once the matching paths are
/// known and stale.
#[derive(Debug, Default, Clone)]
pub struct RefreshAttributes {
    /// Existence of the pattern must be (re-)confirmed.
    pub exist: BTreeMap<Arc<Path>, i64>,
    /// Objectness of the pattern must be learned or re-confirmed.
    pub object: BTreeMap<Arc<Path>, i64>,
    pub writable: BTreeMap<Arc<Path>, i64>,
    pub value: BTreeMap<Arc<Path>, i64>,
    pub notification: BTreeMap<Arc<Path>, i64>,
    pub access_list: BTreeMap<Arc<Path>, i64>,
}

/// Desired attribute payloads for one path (SPA planning).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SpaEntry {
    pub notification: Option<u8>,
    pub access_list: Option<Vec<String>>,
}

/// Ephemeral planner state derived from one pass over a declaration layer.
///
/// Regenerable at any time from the declarations and the device data; never
/// serialized.
#[derive(Debug, Default)]
pub struct SyncState {
    pub refresh: RefreshAttributes,

    /// Declared parameter values to converge to (SPV planning).
    pub spv: BTreeMap<Arc<Path>, Literal>,
    /// Declared notification/access-list values (SPA planning).
    pub spa: BTreeMap<Arc<Path>, SpaEntry>,

    /// GetParameterNames queue: concrete paths whose children (or whose own
    /// existence) must be discovered.
    pub gpn: BTreeSet<Arc<Path>>,
    /// Declared patterns driving the GPN crawl: pattern → (wildcard
    /// bitmask, declared freshness). Consulted when a GPN reply reports
    /// object children, to decide whether the crawl descends.
    pub gpn_patterns: BTreeMap<Arc<Path>, (u32, i64)>,

    /// Declared ACS-side tag values: `Tags.<tag>` → present.
    pub tags: BTreeMap<Arc<Path>, bool>,

    /// Parent → instances to delete (overage against declared bounds).
    pub instances_to_delete: BTreeMap<Arc<Path>, BTreeSet<Arc<Path>>>,
    /// Parent → keyed instances to create (shortfall against bounds).
    pub instances_to_create: BTreeMap<Arc<Path>, InstanceSet>,

    /// ACS-virtual download instances to remove.
    pub downloads_to_delete: BTreeSet<Arc<Path>>,
    /// ACS-virtual download instances to create.
    pub downloads_to_create: InstanceSet,
    /// Declared values on `Downloads.{i}.*` leaves.
    pub downloads_values: BTreeMap<Arc<Path>, Literal>,
    /// Declared `Downloads.{i}.Download` trigger timestamps.
    pub downloads_download: BTreeMap<Arc<Path>, i64>,

    /// Declared reboot-not-before timestamp.
    pub reboot: Option<i64>,
    /// Declared factory-reset-not-before timestamp.
    pub factory_reset: Option<i64>,

    /// Filtered virtual-parameter declarations, one entry per inception
    /// layer processed so far.
    pub virtual_parameter_declarations: Vec<Vec<VirtualParameterDeclaration>>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }
}
