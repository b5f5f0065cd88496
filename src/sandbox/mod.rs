// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The script-sandbox seam. Provisions and virtual parameters are scripts
//! owned by the host; the engine hands them a read snapshot of the session
//! and gets back declarations, clears, and (for virtual parameters) a
//! return value. The builtin provisions live here as well since they stand
//! in for scripts the host has not overridden.

pub mod builtins;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    device::ClearEntry,
    models::{
        attributes::{AttributeMask, AttributeTimestamps, AttributeValues, Attributes},
        fault::Fault,
    },
    session::{SessionContext, declaration::Declaration},
};

/// One virtual parameter invocation: the script sees the current state of
/// its `VirtualParameters.<name>` node and what the declarations ask of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualParameterCall {
    pub name: String,
    /// Current attributes of `VirtualParameters.<name>`.
    pub current: Attributes,
    /// Freshness the declarations demand.
    pub attr_get: AttributeTimestamps,
    /// Values the declarations want applied.
    pub attr_set: AttributeValues,
}

impl VirtualParameterCall {
    /// True when the declaration asked about writability on either side.
    pub fn wants_writable(&self) -> bool {
        self.attr_get.mask().contains(AttributeMask::WRITABLE)
    }

    /// True when the declaration asked for the value on either side.
    pub fn wants_value(&self) -> bool {
        self.attr_get.mask().contains(AttributeMask::VALUE) || self.attr_set.value.is_some()
    }
}

/// A script invocation dispatched to the sandbox.
#[derive(Debug, Clone)]
pub enum ScriptCall {
    Provision {
        name: String,
        args: Vec<serde_json::Value>,
        start_revision: u32,
        end_revision: u32,
    },
    VirtualParameter {
        call: VirtualParameterCall,
        start_revision: u32,
        end_revision: u32,
    },
}

/// What a script run produced. Scripts never mutate engine state directly;
/// everything comes back through this record.
#[derive(Debug, Default)]
pub struct ScriptResult {
    pub fault: Option<Fault>,
    pub clear: Vec<ClearEntry>,
    pub declare: Vec<Declaration>,
    /// False while the script needs another revision of device data before
    /// its declarations are final.
    pub done: bool,
    /// Virtual parameter return record (`{writable?, value?}`).
    pub return_value: Option<serde_json::Value>,
}

impl ScriptResult {
    pub fn done() -> Self {
        Self {
            done: true,
            ..Default::default()
        }
    }

    pub fn fault(fault: Fault) -> Self {
        Self {
            fault: Some(fault),
            ..Default::default()
        }
    }
}

/// Executes scripts against a read snapshot of the session. Implementations
/// must not retain references into the session past the call.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn run(&self, session: &SessionContext, call: ScriptCall) -> ScriptResult;
}
