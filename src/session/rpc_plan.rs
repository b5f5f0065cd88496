// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! RPC planning: turning the sync state into the next GetParameterNames /
//! GetParameterValues / GetParameterAttributes read, or the next mutation
//! (SetParameterValues, SetParameterAttributes, AddObject, DeleteObject,
//! Download, Reboot, FactoryReset), honoring batch sizes and writability.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::{
    device,
    models::{
        acs::{
            AcsRequest, AddObject, DeleteObject, Download, FactoryReset,
            GetParameterAttributes, GetParameterNames, GetParameterValues, NextAction,
            Reboot, SetAttributesEntry, SetParameterAttributes, SetParameterValues,
        },
        attributes::compare_access_lists,
        value::{Literal, XsdType, sanitize_parameter_value},
    },
    path::{Path, Segment},
    session::SessionContext,
    utils::generate_command_key,
};

/// Expected GetParameterNames reply cardinality for a path at `depth`,
/// derived from the wildcard bitmasks of the declared patterns that cover
/// it. Every wildcard position below the queried depth multiplies the
/// subtree fan-out.
pub fn estimate_gpn_count(depth: usize, patterns: &[(Arc<Path>, (u32, i64))]) -> u64 {
    let mut count: u64 = 0;
    for (pattern, (mask, _)) in patterns {
        if pattern.len() <= depth {
            continue;
        }
        let wildcards_below = (mask >> depth).count_ones();
        count = count.saturating_add(1u64 << wildcards_below.min(16));
    }
    count.max(1)
}

fn attr_ts(slot: &Option<(i64, impl Clone)>) -> Option<i64> {
    slot.as_ref().map(|(t, _)| *t)
}

/// True when some pending read entry at `path` or below will reveal the
/// existence `exist_path` asks about, making a dedicated GPN redundant.
fn covered_by_pending(ctx: &SessionContext, exist_path: &Path) -> bool {
    let Some(sync) = ctx.sync_state.as_ref() else {
        return false;
    };
    let base = exist_path.dealias();
    let covers =
        |k: &Arc<Path>| k.len() > exist_path.len() && base.covers_prefix(&k.dealias());
    sync.refresh.value.keys().any(&covers)
        || sync.refresh.object.keys().any(&covers)
        || sync.refresh.writable.keys().any(&covers)
        || sync.gpn.iter().any(&covers)
}

fn parent_reachable(ctx: &SessionContext, path: &Path) -> bool {
    let parent = path.parent();
    if parent.is_root() {
        return true;
    }
    parent.is_concrete()
        && ctx
            .device_data
            .paths
            .get(&parent)
            .is_some_and(|p| ctx.device_data.attributes.has(&p))
}

fn is_known_leaf(ctx: &SessionContext, path: &Arc<Path>) -> bool {
    ctx.device_data
        .attributes
        .get(path)
        .and_then(|a| a.is_object())
        == Some(false)
}

/// Moves satisfiable existence/objectness/writability demands into the GPN
/// queue. Demands whose ancestors are still undiscovered stay pending; a
/// later reply unblocks them.
fn promote_refreshes(ctx: &mut SessionContext) {
    let Some(sync) = ctx.sync_state.as_ref() else {
        return;
    };

    let mut queue: Vec<Arc<Path>> = Vec::new();

    for (p, t) in sync.refresh.exist.clone() {
        if covered_by_pending(ctx, &p) {
            continue;
        }
        let matches = device::unpack(&ctx.device_data, &p);
        let satisfied = !matches.is_empty()
            && matches
                .iter()
                .all(|c| device::effective_timestamp(&ctx.device_data, c) >= t)
            || device::effective_timestamp(&ctx.device_data, &p) >= t;
        if satisfied {
            continue;
        }
        let parent = p.parent();
        let parents = if parent.is_concrete() {
            if parent_reachable(ctx, &p) || parent.is_root() {
                vec![ctx.device_data.paths.add(parent)]
            } else {
                Vec::new()
            }
        } else {
            device::unpack(&ctx.device_data, &parent)
        };
        for parent in parents {
            if !is_known_leaf(ctx, &parent) {
                queue.push(parent);
            }
        }
    }

    for (p, t) in sync.refresh.object.clone() {
        let targets = if p.is_concrete() {
            vec![p.clone()]
        } else {
            let matches = device::unpack(&ctx.device_data, &p);
            if matches.is_empty() {
                // Nothing matches the pattern yet; enumerating the known
                // parents is what can change that.
                let parent = p.parent();
                for parent in device::unpack(&ctx.device_data, &parent) {
                    let fresh =
                        device::effective_timestamp(&ctx.device_data, &p) >= t;
                    if !fresh && !is_known_leaf(ctx, &parent) {
                        queue.push(parent);
                    }
                }
                continue;
            }
            matches
        };
        for target in targets {
            let attrs = ctx
                .device_data
                .paths
                .get(&target)
                .and_then(|q| ctx.device_data.attributes.get(&q).cloned());
            match attrs {
                Some(a) => {
                    let fresh = attr_ts(&a.object).is_some_and(|ts| ts >= t)
                        || device::effective_timestamp(&ctx.device_data, &target) >= t;
                    if fresh {
                        continue;
                    }
                    if a.is_object() == Some(false) {
                        // Re-confirm leafness through the parent listing.
                        if parent_reachable(ctx, &target) && !target.parent().is_root() {
                            queue.push(ctx.device_data.paths.add(target.parent()));
                        } else {
                            queue.push(ctx.device_data.paths.add((*target).clone()));
                        }
                    } else {
                        queue.push(ctx.device_data.paths.add((*target).clone()));
                    }
                },
                None => {
                    let inspected =
                        device::effective_timestamp(&ctx.device_data, &target) >= t;
                    if !inspected
                        && target.is_concrete()
                        && parent_reachable(ctx, &target)
                    {
                        queue.push(ctx.device_data.paths.add((*target).clone()));
                    }
                },
            }
        }
    }

    for (pat, t) in sync.refresh.writable.clone() {
        for c in device::unpack(&ctx.device_data, &pat) {
            let stale = ctx
                .device_data
                .attributes
                .get(&c)
                .is_none_or(|a| !attr_ts(&a.writable).is_some_and(|ts| ts >= t));
            if stale {
                let parent = c.parent();
                if parent.is_root() {
                    queue.push(Arc::clone(&c));
                } else {
                    queue.push(ctx.device_data.paths.add(parent));
                }
            }
        }
    }

    if let Some(sync) = ctx.sync_state.as_mut() {
        for q in queue {
            sync.gpn.insert(q);
        }
    }
}

/// Produces the next read RPC, or `None` when the read phase is drained.
pub fn generate_get_rpc_request(ctx: &mut SessionContext) -> Result<Option<AcsRequest>> {
    if ctx.sync_state.is_none() {
        return Ok(None);
    }

    promote_refreshes(ctx);

    // GetParameterNames, deepest undiscovered path first.
    loop {
        let Some(sync) = ctx.sync_state.as_ref() else {
            return Ok(None);
        };
        let chosen = sync
            .gpn
            .iter()
            .max_by_key(|p| {
                let undiscovered = !ctx
                    .device_data
                    .attributes
                    .has(p);
                (undiscovered, p.len())
            })
            .cloned();
        let Some(path) = chosen else {
            break;
        };
        let patterns: Vec<(Arc<Path>, (u32, i64))> = sync
            .gpn_patterns
            .iter()
            .filter(|(pt, _)| pt.dealias().covers_prefix(&path.dealias()) || path.dealias().covers_prefix(&pt.dealias()))
            .map(|(pt, v)| (Arc::clone(pt), *v))
            .collect();

        if let Some(sync) = ctx.sync_state.as_mut() {
            sync.gpn.remove(&path);
        }

        if path.is_root() && ctx.config.skip_root_gpn {
            debug!("root GPN suppressed by cwmp.skipRootGpn");
            continue;
        }

        let next_level = if path.len() < ctx.config.gpn_next_level {
            true
        } else {
            let estimate = estimate_gpn_count(path.len(), &patterns);
            estimate < (1u64 << (8usize.saturating_sub(path.len())).min(63))
        };

        let parameter_path = if path.is_root() {
            String::new()
        } else {
            format!("{path}.")
        };
        debug!(path = %parameter_path, next_level, "planned GetParameterNames");
        return Ok(Some(AcsRequest::from(GetParameterNames {
            parameter_path,
            next_level,
        })));
    }

    // GetParameterValues over known, stale parameters.
    let batch = drain_value_reads(ctx);
    if !batch.is_empty() {
        debug!(count = batch.len(), "planned GetParameterValues");
        return Ok(Some(AcsRequest::from(GetParameterValues {
            parameter_names: batch,
            next: None,
        })));
    }

    // GetParameterAttributes over known, stale parameters.
    let batch = drain_attribute_reads(ctx);
    if !batch.is_empty() {
        debug!(count = batch.len(), "planned GetParameterAttributes");
        return Ok(Some(AcsRequest::from(GetParameterAttributes {
            parameter_names: batch,
        })));
    }

    Ok(None)
}

fn drain_value_reads(ctx: &SessionContext) -> Vec<String> {
    let Some(sync) = ctx.sync_state.as_ref() else {
        return Vec::new();
    };
    let mut batch: Vec<String> = Vec::new();
    for (pattern, t) in &sync.refresh.value {
        for c in device::unpack(&ctx.device_data, pattern) {
            if batch.len() >= ctx.config.gpv_batch_size {
                return batch;
            }
            let Some(attrs) = ctx.device_data.attributes.get(&c) else {
                continue;
            };
            if attrs.is_object() != Some(false) {
                continue;
            }
            let stale = !attr_ts(&attrs.value).is_some_and(|ts| ts >= *t);
            if stale && !batch.iter().any(|n| n == c.as_str()) {
                batch.push(c.to_string());
            }
        }
    }
    batch
}

fn drain_attribute_reads(ctx: &SessionContext) -> Vec<String> {
    let Some(sync) = ctx.sync_state.as_ref() else {
        return Vec::new();
    };
    let mut batch: Vec<String> = Vec::new();

    let visit = |pattern: &Arc<Path>,
                 t: i64,
                 which: fn(&crate::models::attributes::Attributes) -> Option<i64>,
                 batch: &mut Vec<String>| {
        for c in device::unpack(&ctx.device_data, pattern) {
            if batch.len() >= ctx.config.gpv_batch_size {
                return;
            }
            let Some(attrs) = ctx.device_data.attributes.get(&c) else {
                continue;
            };
            if attrs.is_object() != Some(false) {
                continue;
            }
            let stale = !which(attrs).is_some_and(|ts| ts >= t);
            if stale && !batch.iter().any(|n| n == c.as_str()) {
                batch.push(c.to_string());
            }
        }
    };

    for (pattern, t) in &sync.refresh.notification {
        visit(pattern, *t, |a| attr_ts(&a.notification), &mut batch);
    }
    for (pattern, t) in &sync.refresh.access_list {
        visit(pattern, *t, |a| attr_ts(&a.access_list), &mut batch);
    }
    batch
}

fn writable_allows(ctx: &SessionContext, path: &Arc<Path>) -> bool {
    if ctx.config.skip_writable_check {
        return true;
    }
    ctx.device_data
        .attributes
        .get(path)
        .and_then(|a| a.is_writable())
        != Some(false)
}

/// Produces the next mutation RPC, or `None` when the device has converged
/// to the declared state.
pub fn generate_set_rpc_request(ctx: &mut SessionContext) -> Result<Option<AcsRequest>> {
    if ctx.sync_state.is_none() {
        return Ok(None);
    }

    // DeleteObject for instances beyond the declared bounds.
    {
        let Some(sync) = ctx.sync_state.as_mut() else {
            return Ok(None);
        };
        let mut chosen: Option<Arc<Path>> = None;
        'outer: for instances in sync.instances_to_delete.values() {
            for instance in instances {
                if ctx.config.skip_writable_check
                    || ctx
                        .device_data
                        .attributes
                        .get(instance)
                        .and_then(|a| a.is_writable())
                        == Some(true)
                {
                    chosen = Some(Arc::clone(instance));
                    break 'outer;
                }
            }
        }
        if let Some(instance) = chosen {
            for instances in sync.instances_to_delete.values_mut() {
                instances.remove(&instance);
            }
            debug!(instance = %instance, "planned DeleteObject");
            return Ok(Some(AcsRequest::from(DeleteObject {
                object_name: format!("{instance}."),
            })));
        }
    }

    // AddObject for declared instances that do not exist yet.
    {
        let mut planned: Option<(Arc<Path>, crate::path::InstanceKeys)> = None;
        if let Some(sync) = ctx.sync_state.as_mut() {
            'outer: for (parent, iset) in sync.instances_to_create.iter_mut() {
                if iset.is_empty() {
                    continue;
                }
                if !ctx.config.skip_writable_check {
                    let writable = ctx
                        .device_data
                        .attributes
                        .get(parent)
                        .and_then(|a| a.is_writable());
                    if writable == Some(false) {
                        continue;
                    }
                }
                if let Some(keys) = iset.take_next() {
                    planned = Some((Arc::clone(parent), keys));
                    break 'outer;
                }
            }
        }
        if let Some((parent, keys)) = planned {
            let instance_values: Vec<(String, String)> = keys.into_iter().collect();
            let next = (!instance_values.is_empty()).then_some(NextAction::GetInstanceKeys);
            debug!(parent = %parent, "planned AddObject");
            return Ok(Some(AcsRequest::from(AddObject {
                object_name: format!("{parent}."),
                instance_values,
                next,
            })));
        }
    }

    // SetParameterValues for declared values that differ from the device.
    {
        let mut batch: Vec<(String, Literal, XsdType)> = Vec::new();
        let mut invalid: Vec<Arc<Path>> = Vec::new();
        if let Some(sync) = ctx.sync_state.as_ref() {
            for (path, declared) in &sync.spv {
                if batch.len() >= ctx.config.gpv_batch_size {
                    break;
                }
                let Some(attrs) = ctx.device_data.attributes.get(path) else {
                    continue;
                };
                let Some((_, current)) = &attrs.value else {
                    // Current value still unread; the read phase handles it.
                    continue;
                };
                if !writable_allows(ctx, path) {
                    debug!(path = %path, "SPV skipped, parameter not writable");
                    continue;
                }
                match sanitize_parameter_value(declared, &current.1) {
                    Ok((mut lit, ty)) => {
                        if ty == XsdType::DateTime
                            && !ctx.config.datetime_milliseconds
                            && let Literal::Number(ms) = &mut lit
                        {
                            *ms -= ms.rem_euclid(1000);
                        }
                        if (&lit, &ty) == (&current.0, &current.1) {
                            continue;
                        }
                        batch.push((path.to_string(), lit, ty));
                    },
                    Err(e) => {
                        warn!(path = %path, "undeliverable declared value: {e}");
                        invalid.push(Arc::clone(path));
                    },
                }
            }
        }
        if let Some(sync) = ctx.sync_state.as_mut() {
            for path in invalid {
                sync.spv.remove(&path);
            }
        }
        if !batch.is_empty() {
            debug!(count = batch.len(), "planned SetParameterValues");
            return Ok(Some(AcsRequest::from(SetParameterValues {
                parameter_list: batch,
                datetime_milliseconds: ctx.config.datetime_milliseconds,
                boolean_literal: ctx.config.boolean_literal,
                next: None,
            })));
        }
    }

    // SetParameterAttributes where notification/access list disagree.
    {
        let mut batch: Vec<SetAttributesEntry> = Vec::new();
        if let Some(sync) = ctx.sync_state.as_ref() {
            for (path, want) in &sync.spa {
                if batch.len() >= ctx.config.gpv_batch_size {
                    break;
                }
                let Some(attrs) = ctx.device_data.attributes.get(path) else {
                    continue;
                };
                let notification = want.notification.filter(|n| {
                    attrs.notification.as_ref().map(|(_, cur)| cur) != Some(n)
                });
                let access_list = want.access_list.clone().filter(|al| {
                    attrs
                        .access_list
                        .as_ref()
                        .is_none_or(|(_, cur)| !compare_access_lists(cur, al))
                });
                if notification.is_none() && access_list.is_none() {
                    continue;
                }
                batch.push(SetAttributesEntry {
                    name: path.to_string(),
                    notification,
                    access_list,
                });
            }
        }
        if !batch.is_empty() {
            debug!(count = batch.len(), "planned SetParameterAttributes");
            return Ok(Some(AcsRequest::from(SetParameterAttributes {
                parameter_list: batch,
            })));
        }
    }

    // Download for declared triggers that have come due.
    if let Some(request) = plan_download(ctx)? {
        return Ok(Some(request));
    }

    // Reboot / FactoryReset, consumed on emission.
    let reboot = ctx.sync_state.as_mut().and_then(|s| s.reboot.take());
    if let Some(t) = reboot
        && !one_shot_satisfied(ctx, "Reboot", t)?
        && t <= ctx.timestamp
    {
        debug!("planned Reboot");
        return Ok(Some(AcsRequest::from(Reboot {})));
    }
    let factory_reset = ctx.sync_state.as_mut().and_then(|s| s.factory_reset.take());
    if let Some(t) = factory_reset
        && !one_shot_satisfied(ctx, "FactoryReset", t)?
        && t <= ctx.timestamp
    {
        debug!("planned FactoryReset");
        return Ok(Some(AcsRequest::from(FactoryReset {})));
    }

    Ok(None)
}

fn one_shot_satisfied(ctx: &SessionContext, root: &str, t: i64) -> Result<bool> {
    let path = Path::parse(root)?;
    let done = ctx
        .device_data
        .paths
        .get(&path)
        .and_then(|p| ctx.device_data.attributes.get(&p).cloned())
        .and_then(|a| a.value)
        .is_some_and(|(_, (lit, _))| match lit {
            Literal::Number(v) => t <= v,
            _ => false,
        });
    Ok(done)
}

fn plan_download(ctx: &mut SessionContext) -> Result<Option<AcsRequest>> {
    let Some(sync) = ctx.sync_state.as_ref() else {
        return Ok(None);
    };
    for (path, t) in sync.downloads_download.clone() {
        if t <= 0 || t > ctx.timestamp {
            continue;
        }
        let current = ctx
            .device_data
            .attributes
            .get(&path)
            .and_then(|a| a.value.as_ref())
            .and_then(|(_, (lit, _))| match lit {
                Literal::Number(v) => Some(*v),
                _ => None,
            })
            .unwrap_or(0);
        if t <= current {
            continue;
        }

        let instance = path.parent();
        let read = |leaf: &str| -> String {
            instance
                .concat(&Path::parse(leaf).unwrap_or_else(|_| Path::root()))
                .ok()
                .and_then(|p| ctx.device_data.paths.get(&p))
                .and_then(|p| ctx.device_data.attributes.get(&p).cloned())
                .and_then(|a| a.value)
                .map(|(_, (lit, _))| lit.to_string())
                .unwrap_or_default()
        };

        let (_, command_key) = generate_command_key();
        debug!(instance = %instance, command_key, "planned Download");
        return Ok(Some(AcsRequest::from(Download {
            command_key,
            instance: instance.to_string(),
            file_type: read("FileType"),
            file_name: read("FileName"),
            target_file_name: read("TargetFileName"),
        })));
    }
    Ok(None)
}

/// Virtual parameter reads needed before the current layer's declarations
/// are satisfiable.
pub fn generate_get_virtual_parameter_provisions(
    ctx: &SessionContext,
) -> Vec<crate::sandbox::VirtualParameterCall> {
    use crate::sandbox::VirtualParameterCall;

    let Some(sync) = ctx.sync_state.as_ref() else {
        return Vec::new();
    };
    let Some(vpd) = sync.virtual_parameter_declarations.last() else {
        return Vec::new();
    };

    let mut calls = Vec::new();
    for d in vpd {
        if d.path.len() != 2 {
            continue;
        }
        let Segment::Name(name) = d.path.segment(1) else {
            continue;
        };
        let current = ctx
            .device_data
            .attributes
            .get(&d.path)
            .cloned()
            .unwrap_or_default();
        let node_ts = ctx.device_data.timestamps.get(&d.path).copied().unwrap_or(0);

        let mut unmet = d.path_get.is_some_and(|t| t > node_ts);
        if let Some(at) = &d.attr_get {
            if at.writable.is_some_and(|t| !attr_ts(&current.writable).is_some_and(|c| c >= t)) {
                unmet = true;
            }
            if at.value.is_some_and(|t| !attr_ts(&current.value).is_some_and(|c| c >= t)) {
                unmet = true;
            }
        }
        if !unmet {
            continue;
        }

        let mut attr_get = d.attr_get.clone().unwrap_or_default();
        if let Some(t) = d.path_get {
            // Existence freshness of a virtual parameter means running it.
            if attr_get.value.is_none() {
                attr_get.value = Some(t);
            }
        }
        calls.push(VirtualParameterCall {
            name: name.clone(),
            current,
            attr_get,
            attr_set: Default::default(),
        });
    }
    calls
}

/// Virtual parameter writes needed to converge declared values.
pub fn generate_set_virtual_parameter_provisions(
    ctx: &SessionContext,
) -> Vec<crate::sandbox::VirtualParameterCall> {
    use crate::sandbox::VirtualParameterCall;

    let Some(sync) = ctx.sync_state.as_ref() else {
        return Vec::new();
    };
    let Some(vpd) = sync.virtual_parameter_declarations.last() else {
        return Vec::new();
    };

    let mut calls = Vec::new();
    for d in vpd {
        if d.path.len() != 2 {
            continue;
        }
        let Some(av) = &d.attr_set else {
            continue;
        };
        let Some(declared) = &av.value else {
            continue;
        };
        let Segment::Name(name) = d.path.segment(1) else {
            continue;
        };
        let current = ctx
            .device_data
            .attributes
            .get(&d.path)
            .cloned()
            .unwrap_or_default();

        let converged = current.value.as_ref().is_some_and(|(_, (lit, ty))| {
            sanitize_parameter_value(declared, ty)
                .map(|(want, _)| &want == lit)
                .unwrap_or(false)
        });
        if converged {
            continue;
        }

        calls.push(VirtualParameterCall {
            name: name.clone(),
            current,
            attr_get: Default::default(),
            attr_set: av.clone(),
        });
    }
    calls
}
