// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cross-turn session persistence. Between HTTP turns the whole session is
//! flattened to a JSON string; the ephemeral planner state is dropped and
//! regenerated after the round trip.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    cfg::CwmpConfig,
    device::DeviceData,
    models::{acs::AcsRequest, attributes::Attributes},
    path::Path,
    sandbox::VirtualParameterCall,
    session::{
        LayerReturns, Operation, Provision, Services, SessionContext,
        declaration::Declaration,
    },
};

/// One data-model node: path, trackers, and the raw versioned histories.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedNode {
    path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    trackers: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    timestamps: Vec<(u32, Option<i64>)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<(u32, Option<Attributes>)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSession {
    device_id: String,
    cwmp_version: String,
    timeout: u32,
    timestamp: i64,
    is_new: bool,
    state: u8,
    auth_state: u8,
    config: CwmpConfig,
    cache_snapshot: String,
    provisions: Vec<Provision>,
    channels: BTreeMap<String, u64>,
    virtual_parameters: Vec<Vec<VirtualParameterCall>>,
    declarations: Vec<Vec<Declaration>>,
    revisions: Vec<u32>,
    provisions_ret: Vec<Option<LayerReturns>>,
    rpc_request: Option<AcsRequest>,
    rpc_count: u32,
    iteration: u32,
    cycle: u32,
    operations: BTreeMap<String, Operation>,
    operations_touched: Vec<String>,
    retries: BTreeMap<String, u32>,
    extensions_cache: BTreeMap<String, serde_json::Value>,
    device_data: Vec<PersistedNode>,
    timestamps_revision: u32,
    attributes_revision: u32,
}

/// Flattens the session to a deterministic JSON string. The sync state and
/// transport buffers are ephemeral and excluded.
pub fn serialize(ctx: &SessionContext) -> Result<String> {
    fn node<'a>(
        index: &'a mut BTreeMap<String, PersistedNode>,
        path: &Path,
    ) -> &'a mut PersistedNode {
        index
            .entry(path.to_string())
            .or_insert_with(|| PersistedNode {
                path: path.to_string(),
                trackers: BTreeMap::new(),
                timestamps: Vec::new(),
                attributes: Vec::new(),
            })
    }

    let mut node_index: BTreeMap<String, PersistedNode> = BTreeMap::new();

    for path in ctx.device_data.paths.iter() {
        node(&mut node_index, path);
    }
    for path in ctx.device_data.timestamps.tracked_keys() {
        let history = ctx
            .device_data
            .timestamps
            .revisions_of(path)
            .cloned()
            .unwrap_or_default();
        node(&mut node_index, path).timestamps = history;
    }
    for path in ctx.device_data.attributes.tracked_keys() {
        let history = ctx
            .device_data
            .attributes
            .revisions_of(path)
            .cloned()
            .unwrap_or_default();
        node(&mut node_index, path).attributes = history;
    }
    for (path, markers) in &ctx.device_data.trackers {
        node(&mut node_index, path).trackers =
            markers.iter().map(|(k, v)| (k.clone(), *v)).collect();
    }

    let mut operations_touched: Vec<String> =
        ctx.operations_touched.iter().cloned().collect();
    operations_touched.sort();

    let persisted = PersistedSession {
        device_id: ctx.device_id.clone(),
        cwmp_version: ctx.cwmp_version.clone(),
        timeout: ctx.timeout,
        timestamp: ctx.timestamp,
        is_new: ctx.is_new,
        state: ctx.state,
        auth_state: ctx.auth_state,
        config: ctx.config.clone(),
        cache_snapshot: ctx.cache_snapshot.clone(),
        provisions: ctx.provisions.clone(),
        channels: ctx.channels.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        virtual_parameters: ctx.virtual_parameters.clone(),
        declarations: ctx.declarations.clone(),
        revisions: ctx.revisions.clone(),
        provisions_ret: ctx.provisions_ret.clone(),
        rpc_request: ctx.rpc_request.clone(),
        rpc_count: ctx.rpc_count,
        iteration: ctx.iteration,
        cycle: ctx.cycle,
        operations: ctx
            .operations
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        operations_touched,
        retries: ctx.retries.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        extensions_cache: ctx
            .extensions_cache
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        device_data: node_index.into_values().collect(),
        timestamps_revision: ctx.device_data.timestamps.revision,
        attributes_revision: ctx.device_data.attributes.revision,
    };

    serde_json::to_string(&persisted).context("failed to serialize session")
}

/// Restores a session from its serialized form, re-interning every path and
/// re-installing the versioned histories. Blocks on the local cache so a
/// cold process is bootstrapped before the session continues.
pub async fn deserialize(services: &Services, data: &str) -> Result<SessionContext> {
    let persisted: PersistedSession =
        serde_json::from_str(data).context("failed to deserialize session")?;

    // Ensure the cache is initialized before the session resumes; the
    // session keeps the configuration it was created with.
    services
        .cache
        .snapshot()
        .await
        .context("local cache unavailable during session restore")?;

    let mut device_data = DeviceData::new();
    for node in &persisted.device_data {
        let path = Path::parse(&node.path)
            .with_context(|| format!("invalid persisted path {:?}", node.path))?;
        let interned = device_data.paths.add(path);
        if !node.timestamps.is_empty() {
            device_data
                .timestamps
                .set_revisions(interned.clone(), node.timestamps.clone());
        }
        if !node.attributes.is_empty() {
            device_data
                .attributes
                .set_revisions(interned.clone(), node.attributes.clone());
        }
        if !node.trackers.is_empty() {
            device_data.trackers.insert(
                interned,
                node.trackers
                    .iter()
                    .map(|(k, v)| (k.clone(), *v))
                    .collect(),
            );
        }
    }
    device_data.timestamps.revision = persisted.timestamps_revision;
    device_data.attributes.revision = persisted.attributes_revision;

    Ok(SessionContext {
        device_id: persisted.device_id,
        cwmp_version: persisted.cwmp_version,
        timeout: persisted.timeout,
        timestamp: persisted.timestamp,
        is_new: persisted.is_new,
        state: persisted.state,
        auth_state: persisted.auth_state,
        device_data,
        config: persisted.config,
        cache_snapshot: persisted.cache_snapshot,
        provisions: persisted.provisions,
        channels: persisted.channels.into_iter().collect::<HashMap<_, _>>(),
        virtual_parameters: persisted.virtual_parameters,
        declarations: persisted.declarations,
        revisions: persisted.revisions,
        provisions_ret: persisted.provisions_ret,
        sync_state: None,
        rpc_request: persisted.rpc_request,
        rpc_count: persisted.rpc_count,
        iteration: persisted.iteration,
        cycle: persisted.cycle,
        operations: persisted.operations.into_iter().collect(),
        operations_touched: persisted
            .operations_touched
            .into_iter()
            .collect::<HashSet<_>>(),
        retries: persisted.retries.into_iter().collect(),
        extensions_cache: persisted.extensions_cache.into_iter().collect(),
    })
}
