// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared fixtures for the end-to-end session scenarios: an in-memory
//! cache, a sandbox stub, and helpers to step the driver against a scripted
//! CPE.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cwmp_session_rs::{
    Services, SessionContext,
    cache::MemoryCache,
    device,
    models::{
        acs::AcsRequest,
        attributes::Attributes,
        cpe::{CpeResponse, DeviceIdStruct, InformRequest},
        fault::Fault,
        value::{Literal, XsdType},
    },
    path::Path,
    sandbox::{ScriptCall, ScriptExecutor, ScriptResult},
    session::{self, driver::DriverResult},
};

/// Sandbox stub: the scenarios only use builtin provisions, so any script
/// dispatch is a test failure surfaced as a fault.
pub struct NoScripts;

#[async_trait]
impl ScriptExecutor for NoScripts {
    async fn run(&self, _session: &SessionContext, call: ScriptCall) -> ScriptResult {
        let name = match call {
            ScriptCall::Provision { name, .. } => name,
            ScriptCall::VirtualParameter { call, .. } => call.name,
        };
        ScriptResult::fault(Fault::script_error(
            "ReferenceError",
            format!("no script {name}"),
        ))
    }
}

pub fn services() -> Services {
    Services {
        cache: Arc::new(MemoryCache::new()),
        sandbox: Arc::new(NoScripts),
    }
}

pub fn services_with_config(pairs: &[(&str, &str)]) -> Services {
    let cache = Arc::new(MemoryCache::new());
    for (key, value) in pairs {
        cache.set_config_key(*key, *value);
    }
    Services {
        cache,
        sandbox: Arc::new(NoScripts),
    }
}

pub async fn new_session(services: &Services) -> SessionContext {
    session::init(services, "test-device", "1.4", 30000)
        .await
        .expect("session init failed")
}

pub fn basic_inform() -> InformRequest {
    InformRequest {
        device_id: DeviceIdStruct {
            manufacturer: "M".to_string(),
            oui: "000000".to_string(),
            product_class: "P".to_string(),
            serial_number: "S".to_string(),
        },
        event: vec!["0 BOOTSTRAP".to_string()],
        parameter_list: Vec::new(),
        retry_count: 0,
    }
}

/// Steps the driver and expects it to hand out a request.
pub async fn expect_request(
    services: &Services,
    ctx: &mut SessionContext,
) -> Result<(String, AcsRequest)> {
    match session::rpc_request(services, ctx, None).await? {
        DriverResult::Request { rpc_id, request } => Ok((rpc_id, request)),
        other => anyhow::bail!("expected a request, got {other:?}"),
    }
}

/// Steps the driver and expects session completion.
pub async fn expect_done(services: &Services, ctx: &mut SessionContext) -> Result<()> {
    match session::rpc_request(services, ctx, None).await? {
        DriverResult::Done => Ok(()),
        other => anyhow::bail!("expected completion, got {other:?}"),
    }
}

/// Feeds a CPE reply back for the request id the driver handed out.
pub fn respond(
    ctx: &mut SessionContext,
    rpc_id: &str,
    response: CpeResponse,
) -> Result<()> {
    if let Some(fault) = session::rpc_response(ctx, rpc_id, &response)? {
        anyhow::bail!("unexpected session fault: {fault}");
    }
    Ok(())
}

pub fn seed_object(ctx: &mut SessionContext, path: &str, writable: bool) -> Result<()> {
    let t = ctx.timestamp;
    let mut to_clear = Vec::new();
    device::set(
        &mut ctx.device_data,
        Path::parse(path)?,
        t,
        Some(Attributes {
            object: Some((t, true)),
            writable: Some((t, writable)),
            ..Default::default()
        }),
        &mut to_clear,
    )?;
    device::apply_clears(&mut ctx.device_data, &to_clear);
    Ok(())
}

pub fn seed_leaf(
    ctx: &mut SessionContext,
    path: &str,
    value: (Literal, XsdType),
    writable: bool,
) -> Result<()> {
    let t = ctx.timestamp;
    let mut to_clear = Vec::new();
    device::set(
        &mut ctx.device_data,
        Path::parse(path)?,
        t,
        Some(Attributes {
            object: Some((t, false)),
            writable: Some((t, writable)),
            value: Some((t, value)),
            ..Default::default()
        }),
        &mut to_clear,
    )?;
    device::apply_clears(&mut ctx.device_data, &to_clear);
    Ok(())
}

/// Stamps a child-enumeration marker so declarations that only assert
/// cardinality do not trigger a discovery round first.
pub fn seed_enumeration(ctx: &mut SessionContext, pattern: &str) -> Result<()> {
    let t = ctx.timestamp;
    let mut to_clear = Vec::new();
    device::set(&mut ctx.device_data, Path::parse(pattern)?, t, None, &mut to_clear)?;
    device::apply_clears(&mut ctx.device_data, &to_clear);
    Ok(())
}

/// Reads the stored value of a parameter.
pub fn stored_value(ctx: &SessionContext, path: &str) -> Option<(Literal, XsdType)> {
    let p = ctx.device_data.paths.get(&Path::parse(path).ok()?)?;
    ctx.device_data
        .attributes
        .get(&p)
        .and_then(|a| a.value.as_ref())
        .map(|(_, v)| v.clone())
}
