// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Declaration processing: merging a declaration layer into the planner's
//! [`SyncState`] and splitting off the virtual-parameter declarations the
//! driver escalates into deeper inception layers.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use tracing::{debug, warn};

use crate::{
    device::{self, DeviceData},
    models::{
        attributes::{AttributeTimestamps, AttributeValues},
        value::{Literal, literal_to_ms},
    },
    path::{InstanceKeys, Path, Segment},
    session::{
        PREREQUISITE_TRACKER, SessionContext,
        declaration::{Declaration, InstanceBounds, VirtualParameterDeclaration},
        sync_state::SyncState,
    },
};

/// Merges one declaration layer into the session's sync state and returns
/// the declarations addressing `VirtualParameters.*`, which the driver may
/// escalate into a deeper inception layer.
pub fn run_declarations(
    ctx: &mut SessionContext,
    declarations: &[Declaration],
    vparam_names: &HashSet<String>,
) -> Result<Vec<VirtualParameterDeclaration>> {
    if ctx.sync_state.is_none() {
        ctx.sync_state = Some(SyncState::new());
    }

    let mut all_ts: BTreeMap<Arc<Path>, i64> = BTreeMap::new();
    let mut all_attr_ts: BTreeMap<Arc<Path>, AttributeTimestamps> = BTreeMap::new();
    let mut all_attr_vals: BTreeMap<Arc<Path>, AttributeValues> = BTreeMap::new();
    let mut instance_decls: Vec<(Arc<Path>, InstanceBounds)> = Vec::new();

    for dec in declarations {
        let path = ctx.device_data.paths.add(dec.path.clone());

        intern_virtual_roots(&mut ctx.device_data, &path, vparam_names);

        let mut unpacked: Option<Vec<Arc<Path>>> = None;

        if path.alias_mask() != 0 {
            // Alias resolution depends on key parameter values; declare the
            // prerequisite reads and track them so later invalidation
            // triggers a replan.
            for ad in device::get_alias_declarations(&path, dec.path_get.unwrap_or(1)) {
                let p = ctx.device_data.paths.add(ad.path.clone());
                if let Some(t) = ad.path_get {
                    merge_ts(&mut all_ts, &p, t);
                }
                if let Some(at) = &ad.attr_get {
                    all_attr_ts.entry(Arc::clone(&p)).or_default().merge(at);
                }
                device::track(&mut ctx.device_data, &p, PREREQUISITE_TRACKER);
            }
            let concrete = device::unpack(&ctx.device_data, &path);
            for u in &concrete {
                if let Some(t) = dec.path_get {
                    merge_ts(&mut all_ts, u, t);
                }
                if let Some(at) = &dec.attr_get {
                    all_attr_ts.entry(Arc::clone(u)).or_default().merge(at);
                }
            }
            unpacked = Some(concrete);
        } else {
            if let Some(t) = dec.path_get {
                merge_ts(&mut all_ts, &path, t);
            }
            if let Some(at) = &dec.attr_get {
                all_attr_ts.entry(Arc::clone(&path)).or_default().merge(at);
            }
        }

        if let Some(bounds) = dec.path_set
            && !dec.defer
        {
            instance_decls.push((Arc::clone(&path), bounds));
        }

        if let Some(av) = &dec.attr_set {
            let targets: Vec<Arc<Path>> = if path.is_concrete() {
                vec![Arc::clone(&path)]
            } else {
                unpacked
                    .take()
                    .unwrap_or_else(|| device::unpack(&ctx.device_data, &path))
            };
            for target in targets {
                match all_attr_vals.entry(target) {
                    std::collections::btree_map::Entry::Vacant(e) => {
                        // Deferred values only refresh entries that already
                        // exist in the plan.
                        if !dec.defer {
                            e.insert(av.clone());
                        }
                    },
                    std::collections::btree_map::Entry::Occupied(mut e) => {
                        e.get_mut().merge(av);
                    },
                }
            }
        }
    }

    process_instances(ctx, &instance_decls);

    Ok(process_declarations(
        ctx,
        &all_ts,
        &all_attr_ts,
        &all_attr_vals,
    ))
}

fn merge_ts(map: &mut BTreeMap<Arc<Path>, i64>, path: &Arc<Path>, t: i64) {
    let entry = map.entry(Arc::clone(path)).or_insert(t);
    *entry = (*entry).max(t);
}

/// Interns the ACS-virtual roots a declaration may touch so pattern queries
/// can see them.
fn intern_virtual_roots(
    device_data: &mut DeviceData,
    path: &Path,
    vparam_names: &HashSet<String>,
) {
    if path.is_root() {
        return;
    }
    let first = path.segment(0);
    let root_pattern = !first.is_exact();

    let touches = |name: &str| {
        root_pattern || matches!(first, Segment::Name(n) if n == name)
    };

    if touches("Reboot") {
        let _ = Path::parse("Reboot").map(|p| device_data.paths.add(p));
    }
    if touches("FactoryReset") {
        let _ = Path::parse("FactoryReset").map(|p| device_data.paths.add(p));
    }
    if touches("VirtualParameters") {
        if let Ok(p) = Path::parse("VirtualParameters") {
            device_data.paths.add(p);
        }
        if path.len() >= 2 {
            for name in vparam_names {
                if let Ok(p) = Path::parse(&format!("VirtualParameters.{name}")) {
                    device_data.paths.add(p);
                }
            }
        }
    }
}

/// Applies `pathSet` bounds: plans instance deletions beyond `max` and
/// keyed creations up to `min`, relative to the currently observed children
/// and to instances already planned in this sync state.
fn process_instances(ctx: &mut SessionContext, decls: &[(Arc<Path>, InstanceBounds)]) {
    let Some(sync) = ctx.sync_state.as_mut() else {
        return;
    };

    for (pattern, bounds) in decls {
        if pattern.is_root() {
            continue;
        }
        let last = pattern.segment(pattern.len() - 1);
        let keys: InstanceKeys = match last {
            Segment::Alias(pairs) => pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            Segment::Wildcard => InstanceKeys::new(),
            _ => {
                debug!(path = %pattern, "pathSet on an exact segment, skipped");
                continue;
            },
        };

        let is_downloads = pattern.len() == 2
            && matches!(pattern.segment(0), Segment::Name(n) if n == "Downloads");

        if is_downloads {
            let current = device::unpack(&ctx.device_data, pattern);
            let max = bounds.max.map(|m| m as usize);
            if let Some(max) = max {
                for overage in current.iter().skip(max) {
                    sync.downloads_to_delete.insert(Arc::clone(overage));
                }
            }
            let mut have = current.len().min(max.unwrap_or(usize::MAX))
                + sync.downloads_to_create.superset(&keys).len();
            while have < bounds.min as usize {
                sync.downloads_to_create.add(keys.clone());
                have += 1;
            }
            continue;
        }

        let parent_pattern = pattern.slice(0, pattern.len() - 1);
        for parent in device::unpack(&ctx.device_data, &parent_pattern) {
            if ctx
                .device_data
                .attributes
                .get(&parent)
                .and_then(|a| a.is_object())
                == Some(false)
            {
                continue;
            }
            let children = device::known_children(&ctx.device_data, &parent, last);
            let max = bounds.max.map(|m| m as usize);
            if let Some(max) = max {
                for overage in children.iter().skip(max) {
                    sync.instances_to_delete
                        .entry(Arc::clone(&parent))
                        .or_default()
                        .insert(Arc::clone(overage));
                }
            }
            let planned = sync
                .instances_to_create
                .entry(Arc::clone(&parent))
                .or_default();
            let mut have =
                children.len().min(max.unwrap_or(usize::MAX)) + planned.superset(&keys).len();
            while have < bounds.min as usize {
                planned.add(keys.clone());
                have += 1;
            }
        }
    }
}

/// Walks the declared paths, sorted so exact segments precede wildcards and
/// parents precede children, dispatching each to the planner bucket its
/// root belongs to.
fn process_declarations(
    ctx: &mut SessionContext,
    all_ts: &BTreeMap<Arc<Path>, i64>,
    all_attr_ts: &BTreeMap<Arc<Path>, AttributeTimestamps>,
    all_attr_vals: &BTreeMap<Arc<Path>, AttributeValues>,
) -> Vec<VirtualParameterDeclaration> {
    let mut vpd = Vec::new();

    let mut keys: Vec<Arc<Path>> = all_ts
        .keys()
        .chain(all_attr_ts.keys())
        .chain(all_attr_vals.keys())
        .cloned()
        .collect();
    keys.sort();
    keys.dedup();

    for p in keys {
        let t = all_ts.get(&p).copied().unwrap_or(0);
        let at = all_attr_ts.get(&p);
        let av = all_attr_vals.get(&p);

        if p.is_root() {
            if t > 0 {
                plan_path_get(ctx, &p, t);
            }
            continue;
        }

        let root = match p.segment(0) {
            Segment::Name(n) => n.clone(),
            // Root-level patterns go through regular planning; the virtual
            // roots keep their timestamps fresh through the root GPN
            // handler.
            _ => String::new(),
        };

        match root.as_str() {
            "Reboot" => {
                if p.len() == 1
                    && let Some(value) = av.and_then(|v| v.value.as_ref())
                {
                    match literal_to_ms(value) {
                        Ok(ms) => {
                            let sync = sync_state(ctx);
                            sync.reboot = Some(sync.reboot.map_or(ms, |c| c.max(ms)));
                        },
                        Err(e) => warn!("invalid Reboot declaration: {e}"),
                    }
                }
            },
            "FactoryReset" => {
                if p.len() == 1
                    && let Some(value) = av.and_then(|v| v.value.as_ref())
                {
                    match literal_to_ms(value) {
                        Ok(ms) => {
                            let sync = sync_state(ctx);
                            sync.factory_reset =
                                Some(sync.factory_reset.map_or(ms, |c| c.max(ms)));
                        },
                        Err(e) => warn!("invalid FactoryReset declaration: {e}"),
                    }
                }
            },
            "Tags" => {
                if p.len() == 2
                    && p.is_concrete()
                    && let Some(value) = av.and_then(|v| v.value.as_ref())
                {
                    let present = literal_truthy(value);
                    sync_state(ctx).tags.insert(Arc::clone(&p), present);
                }
            },
            "Events" | "DeviceID" => {},
            "Downloads" => {
                if p.len() == 3
                    && p.is_concrete()
                    && let Some(value) = av.and_then(|v| v.value.as_ref())
                {
                    let is_download_leaf =
                        matches!(p.segment(2), Segment::Name(n) if n == "Download");
                    if is_download_leaf {
                        match literal_to_ms(value) {
                            Ok(ms) => {
                                sync_state(ctx)
                                    .downloads_download
                                    .insert(Arc::clone(&p), ms);
                            },
                            Err(e) => warn!("invalid Download declaration: {e}"),
                        }
                    } else {
                        sync_state(ctx)
                            .downloads_values
                            .insert(Arc::clone(&p), value.clone());
                    }
                }
            },
            "VirtualParameters" => {
                if p.len() <= 2 && (t > 0 || at.is_some() || av.is_some()) {
                    vpd.push(VirtualParameterDeclaration {
                        path: Arc::clone(&p),
                        path_get: (t > 0).then_some(t),
                        attr_get: at.cloned(),
                        attr_set: av.cloned(),
                    });
                }
            },
            _ => {
                if t > 0 {
                    plan_path_get(ctx, &p, t);
                }
                if let Some(at) = at {
                    plan_attr_get(ctx, &p, at);
                }
                if let Some(av) = av {
                    plan_attr_set(ctx, &p, av);
                }
            },
        }
    }

    vpd
}

fn sync_state(ctx: &mut SessionContext) -> &mut SyncState {
    ctx.sync_state.get_or_insert_with(SyncState::new)
}

fn literal_truthy(value: &Literal) -> bool {
    match value {
        Literal::Bool(b) => *b,
        Literal::Number(n) => *n != 0,
        Literal::String(s) => matches!(s.as_str(), "true" | "1"),
    }
}

/// Plans the discovery work for one declared pattern: descends through the
/// known data model as far as the pattern allows and queues existence,
/// objectness, or enumeration refreshes at the first stale or unknown
/// boundary.
fn plan_path_get(ctx: &mut SessionContext, pattern: &Arc<Path>, t: i64) {
    let leaf_ts = device::effective_timestamp(&ctx.device_data, pattern);

    let mut frontier: Vec<Arc<Path>> =
        vec![ctx.device_data.paths.add(Path::root())];
    let mut depth = 0usize;
    while depth < pattern.len() {
        let seg = pattern.segment(depth).clone();
        let mut next = Vec::new();
        for pre in &frontier {
            next.extend(device::known_children(&ctx.device_data, pre, &seg));
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
        depth += 1;
    }

    if depth == pattern.len() {
        // Fully resolved: re-confirm stale endpoints.
        for c in frontier {
            let cur = device::effective_timestamp(&ctx.device_data, &c).max(leaf_ts);
            if t > cur {
                register_pattern(ctx, pattern, t);
                let sync = sync_state(ctx);
                let entry = sync.refresh.exist.entry(c).or_insert(t);
                *entry = (*entry).max(t);
            }
        }
        return;
    }

    // Unknown territory starts below `depth`.
    let boundary = ctx.device_data.paths.add(pattern.slice(0, depth + 1));
    let cur = device::effective_timestamp(&ctx.device_data, &boundary).max(leaf_ts);
    if t <= cur {
        return;
    }

    // Nothing can exist below a node known to be a parameter.
    let parents_are_leaves = frontier.iter().all(|p| {
        ctx.device_data
            .attributes
            .get(p)
            .and_then(|a| a.is_object())
            == Some(false)
    });
    if parents_are_leaves && !frontier.is_empty() && depth > 0 {
        return;
    }

    register_pattern(ctx, pattern, t);
    let sync = sync_state(ctx);
    if depth + 1 == pattern.len() {
        let entry = sync.refresh.exist.entry(boundary).or_insert(t);
        *entry = (*entry).max(t);
    } else {
        let entry = sync.refresh.object.entry(boundary).or_insert(t);
        *entry = (*entry).max(t);
    }
}

/// Remembers the full declared pattern so GetParameterNames replies know
/// whether the crawl has to descend into a reported object child.
fn register_pattern(ctx: &mut SessionContext, pattern: &Arc<Path>, t: i64) {
    let mask = pattern.wildcard_mask() | pattern.alias_mask();
    let sync = sync_state(ctx);
    let entry = sync
        .gpn_patterns
        .entry(Arc::clone(pattern))
        .or_insert((mask, t));
    entry.0 |= mask;
    entry.1 = entry.1.max(t);
}

fn plan_attr_get(ctx: &mut SessionContext, pattern: &Arc<Path>, at: &AttributeTimestamps) {
    // Value reads require knowing whether each matching node is a
    // parameter; queue an objectness refresh for matches that lack it.
    if at.value.is_some() {
        let unknown_object: Vec<Arc<Path>> = device::unpack(&ctx.device_data, pattern)
            .into_iter()
            .filter(|c| {
                ctx.device_data
                    .attributes
                    .get(c)
                    .and_then(|a| a.is_object())
                    .is_none()
            })
            .collect();
        let ts = at.value.unwrap_or(1);
        for c in unknown_object {
            register_pattern(ctx, pattern, ts);
            let sync = sync_state(ctx);
            let entry = sync.refresh.object.entry(c).or_insert(ts);
            *entry = (*entry).max(ts);
        }
    }

    let sync = sync_state(ctx);
    let mut demand = |map: &mut BTreeMap<Arc<Path>, i64>, ts: Option<i64>| {
        if let Some(ts) = ts {
            let entry = map.entry(Arc::clone(pattern)).or_insert(ts);
            *entry = (*entry).max(ts);
        }
    };
    demand(&mut sync.refresh.object, at.object);
    demand(&mut sync.refresh.writable, at.writable);
    demand(&mut sync.refresh.value, at.value);
    demand(&mut sync.refresh.notification, at.notification);
    demand(&mut sync.refresh.access_list, at.access_list);
}

fn plan_attr_set(ctx: &mut SessionContext, pattern: &Arc<Path>, av: &AttributeValues) {
    let targets = device::unpack(&ctx.device_data, pattern);

    for c in targets {
        if let Some(value) = &av.value {
            // Converging a value needs the current value (for both the type
            // and the no-op check); read it first when it is missing.
            let known = ctx
                .device_data
                .attributes
                .get(&c)
                .is_some_and(|a| a.value.is_some());
            let sync = sync_state(ctx);
            if !known {
                sync.refresh.value.entry(Arc::clone(&c)).or_insert(1);
            }
            sync.spv.insert(Arc::clone(&c), value.clone());
        }
        if av.notification.is_some() || av.access_list.is_some() {
            let sync = sync_state(ctx);
            let entry = sync.spa.entry(Arc::clone(&c)).or_default();
            if let Some(n) = av.notification {
                entry.notification = Some(n);
            }
            if let Some(a) = &av.access_list {
                entry.access_list = Some(a.clone());
            }
        }
    }
}
