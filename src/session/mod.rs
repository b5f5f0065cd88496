// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-device session engine: context, declaration processing, RPC
//! planning, the reentrant driver, lifecycle entry points, and persistence.

pub mod declaration;
pub mod declarations;
pub mod driver;
pub mod lifecycle;
pub mod rpc_plan;
pub mod serialize;
pub mod sync_state;

pub use driver::{DriverResult, rpc_fault, rpc_request, rpc_response};
pub use lifecycle::{
    TransferCompleteOutcome, add_provisions, clear_provisions, inform,
    timeout_operations, transfer_complete,
};
pub use serialize::{deserialize, serialize};

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    cache::LocalCache,
    cfg::CwmpConfig,
    device::DeviceData,
    models::{acs::AcsRequest, value::ParameterValue},
    sandbox::{ScriptExecutor, VirtualParameterCall},
    session::{declaration::Declaration, sync_state::SyncState},
};

/// Hard cap on the virtual-parameter inception depth.
pub const MAX_INCEPTION_DEPTH: usize = 8;

/// Hard cap on planner-restart cycles within one session.
pub const MAX_CYCLES: u32 = 255;

/// Tracker label attached to alias prerequisite reads; invalidation of a
/// tracked path forces a replan.
pub const PREREQUISITE_TRACKER: &str = "prerequisite";

/// Process-global collaborators handed to the engine's async entry points.
#[derive(Clone)]
pub struct Services {
    pub cache: Arc<dyn LocalCache>,
    pub sandbox: Arc<dyn ScriptExecutor>,
}

/// A provision instance: builtin or user script name plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provision {
    pub name: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

impl Provision {
    pub fn new(name: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Arguments of a pending Download operation, kept for TransferComplete and
/// timeout handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadArgs {
    /// The `Downloads.{i}` instance the download was declared on.
    pub instance: String,
    pub file_type: String,
    pub file_name: String,
    pub target_file_name: String,
}

/// An operation the CPE acknowledged but has not completed yet, keyed by
/// command key in [`SessionContext::operations`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// CWMP method name, currently always `"Download"`.
    pub name: String,
    /// When the operation was started (epoch ms).
    pub timestamp: i64,
    /// Channel memberships at the time of start, for fault attribution.
    pub channels: HashMap<String, u64>,
    pub args: DownloadArgs,
}

/// Return record of a completed virtual parameter script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualParameterReturn {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ParameterValue>,
}

/// Per-layer script returns, aligned with the layer's call list. `None` for
/// the provisions layer, whose scripts return nothing.
pub type LayerReturns = Vec<Option<VirtualParameterReturn>>;

/// The state of one CWMP session with one device.
///
/// Mutated only by the engine's entry points, one call at a time; between
/// HTTP turns it round-trips through [`serialize`](crate::session::serialize).
pub struct SessionContext {
    pub device_id: String,
    pub cwmp_version: String,
    /// Transport-level session timeout hint, seconds.
    pub timeout: u32,
    /// Session start, epoch ms; every data-model write in this session is
    /// stamped relative to it.
    pub timestamp: i64,
    /// Marked by the host when the device has never been seen before.
    pub is_new: bool,
    /// Transport bookkeeping, maintained by the host.
    pub state: u8,
    pub auth_state: u8,

    pub device_data: DeviceData,
    /// Resolved configuration, captured once per session.
    pub config: CwmpConfig,
    /// Cache generation the configuration and script names were read at.
    pub cache_snapshot: String,

    pub provisions: Vec<Provision>,
    /// Channel name → bitmap over provision indexes.
    pub channels: HashMap<String, u64>,

    /// One entry per inception layer above the provisions.
    pub virtual_parameters: Vec<Vec<VirtualParameterCall>>,
    /// One entry per inception layer, provisions first.
    pub declarations: Vec<Vec<Declaration>>,
    /// Revision counters aligned with the declaration layers.
    pub revisions: Vec<u32>,
    /// Completed-layer returns, indexed by inception.
    pub provisions_ret: Vec<Option<LayerReturns>>,

    /// Ephemeral planner state; regenerable from the declarations.
    pub sync_state: Option<SyncState>,
    /// The in-flight ACS request, if any.
    pub rpc_request: Option<AcsRequest>,

    pub rpc_count: u32,
    /// Commit-step counter; read phase stamps `timestamp + iteration`,
    /// update phase `timestamp + iteration + 1`.
    pub iteration: u32,
    /// Planner-restart counter, bumped by provision changes mid-session.
    pub cycle: u32,

    /// Pending operations keyed by command key.
    pub operations: HashMap<String, Operation>,
    /// Command keys whose operations changed this session, for the host's
    /// persistence layer.
    pub operations_touched: HashSet<String>,
    /// Per-channel fault retry counters, maintained by the host.
    pub retries: HashMap<String, u32>,

    /// Sandbox extension cache, keyed `"<revision>:<rest>"`.
    pub extensions_cache: HashMap<String, serde_json::Value>,
}

impl SessionContext {
    /// Iteration quota of the current cycle.
    pub fn max_iterations(&self) -> u32 {
        self.config.max_iterations()
    }

    /// The id the transport must echo with the reply to the current RPC:
    /// session timestamp, cycle, and RPC counter, hex encoded.
    pub fn generate_rpc_id(&self) -> String {
        format!(
            "{:x}{:02x}{:02x}",
            self.timestamp,
            self.cycle & 0xff,
            self.rpc_count & 0xff
        )
    }

    /// Drops extension-cache entries computed above `revision`.
    pub fn prune_extensions_cache(&mut self, revision: u32) {
        self.extensions_cache.retain(|key, _| {
            key.split(':')
                .next()
                .and_then(|r| r.parse::<u32>().ok())
                .is_none_or(|r| r <= revision)
        });
    }
}

/// Creates a fresh session for `device_id`, capturing the configuration as
/// of the current cache generation.
pub async fn init(
    services: &Services,
    device_id: &str,
    cwmp_version: &str,
    timeout: u32,
) -> Result<SessionContext> {
    let cache_snapshot = services.cache.snapshot().await?;
    let config = services.cache.config(&cache_snapshot).await?;

    Ok(SessionContext {
        device_id: device_id.to_string(),
        cwmp_version: cwmp_version.to_string(),
        timeout,
        timestamp: Utc::now().timestamp_millis(),
        is_new: false,
        state: 0,
        auth_state: 0,
        device_data: DeviceData::new(),
        config,
        cache_snapshot,
        provisions: Vec::new(),
        channels: HashMap::new(),
        virtual_parameters: Vec::new(),
        declarations: Vec::new(),
        revisions: vec![0],
        provisions_ret: Vec::new(),
        sync_state: None,
        rpc_request: None,
        rpc_count: 0,
        iteration: 0,
        cycle: 0,
        operations: HashMap::new(),
        operations_touched: HashSet::new(),
        retries: HashMap::new(),
        extensions_cache: HashMap::new(),
    })
}
