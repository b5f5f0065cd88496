// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The reentrant session driver: runs provision and virtual-parameter
//! layers, processes declarations, emits RPCs, and assimilates CPE replies
//! into the device data model.

use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    device::{self, ClearEntry},
    models::{
        acs::{AcsRequest, NextAction, RpcMethod, SetParameterValues},
        attributes::Attributes,
        cpe::{CpeFault, CpeResponse, ParameterInfo},
        fault::Fault,
        value::{Literal, XsdType, sanitize_parameter_value},
    },
    path::{Path, Segment},
    sandbox::{ScriptCall, ScriptResult, VirtualParameterCall, builtins},
    session::{
        LayerReturns, MAX_CYCLES, MAX_INCEPTION_DEPTH, PREREQUISITE_TRACKER, Provision,
        Services, SessionContext, VirtualParameterReturn,
        declaration::{Declaration, VirtualParameterDeclaration},
        declarations::run_declarations,
        rpc_plan::{
            generate_get_rpc_request, generate_get_virtual_parameter_provisions,
            generate_set_rpc_request, generate_set_virtual_parameter_provisions,
        },
        sync_state::SyncState,
    },
};

/// Outcome of one driver step: the next request to send, a fault for the
/// host, or session completion.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverResult {
    Request { rpc_id: String, request: AcsRequest },
    Fault(Fault),
    Done,
}

/// Combined output of one script layer.
struct LayerOutcome {
    fault: Option<Fault>,
    clear: Vec<ClearEntry>,
    declare: Vec<Declaration>,
    done: bool,
    returns: LayerReturns,
}

impl LayerOutcome {
    fn new() -> Self {
        Self {
            fault: None,
            clear: Vec::new(),
            declare: Vec::new(),
            done: true,
            returns: Vec::new(),
        }
    }

    fn absorb(&mut self, result: ScriptResult) {
        if self.fault.is_none() {
            self.fault = result.fault;
        }
        self.clear.extend(result.clear);
        self.declare.extend(result.declare);
        self.done &= result.done;
    }
}

async fn run_script(
    services: &Services,
    ctx: &SessionContext,
    call: ScriptCall,
    token: CancellationToken,
) -> Option<ScriptResult> {
    tokio::select! {
        _ = token.cancelled() => None,
        result = services.sandbox.run(ctx, call) => {
            if result.fault.is_some() {
                token.cancel();
            }
            Some(result)
        },
    }
}

/// Runs one provisions layer: builtins inline, user scripts concurrently in
/// the sandbox. A script fault cancels the remainder of the layer.
async fn run_provisions(
    services: &Services,
    ctx: &SessionContext,
    provisions: &[Provision],
    start_revision: u32,
    end_revision: u32,
    user_scripts: &HashSet<String>,
) -> Result<LayerOutcome> {
    let mut outcome = LayerOutcome::new();
    let token = CancellationToken::new();
    let mut pending = Vec::new();

    for provision in provisions {
        if !user_scripts.contains(&provision.name) {
            match builtins::run_builtin(
                ctx,
                &provision.name,
                &provision.args,
                start_revision,
                end_revision,
            ) {
                Ok(Some(result)) => {
                    outcome.absorb(result);
                    continue;
                },
                Ok(None) => {},
                Err(e) => {
                    outcome.absorb(ScriptResult::fault(Fault::script_error(
                        "Error",
                        e.to_string(),
                    )));
                    continue;
                },
            }
        }
        pending.push(run_script(
            services,
            ctx,
            ScriptCall::Provision {
                name: provision.name.clone(),
                args: provision.args.clone(),
                start_revision,
                end_revision,
            },
            token.clone(),
        ));
    }

    for result in futures::future::join_all(pending).await.into_iter().flatten() {
        outcome.absorb(result);
    }

    if outcome.done && outcome.fault.is_none() {
        for d in &mut outcome.declare {
            d.defer = false;
        }
    }
    Ok(outcome)
}

/// Runs one virtual-parameter layer concurrently and validates the return
/// records of completed scripts.
async fn run_virtual_parameters(
    services: &Services,
    ctx: &SessionContext,
    calls: &[VirtualParameterCall],
    start_revision: u32,
    end_revision: u32,
) -> Result<LayerOutcome> {
    let mut outcome = LayerOutcome::new();
    let token = CancellationToken::new();

    let pending: Vec<_> = calls
        .iter()
        .map(|call| {
            run_script(
                services,
                ctx,
                ScriptCall::VirtualParameter {
                    call: call.clone(),
                    start_revision,
                    end_revision,
                },
                token.clone(),
            )
        })
        .collect();

    let results = futures::future::join_all(pending).await;

    let mut returns: LayerReturns = Vec::with_capacity(calls.len());
    for (call, result) in calls.iter().zip(results) {
        let Some(result) = result else {
            returns.push(None);
            outcome.done = false;
            continue;
        };
        let done = result.done;
        let fault = result.fault.is_some();
        let return_value = result.return_value.clone();
        outcome.absorb(result);
        if done && !fault {
            match validate_vp_return(call, return_value.as_ref()) {
                Ok(ret) => returns.push(Some(ret)),
                Err(fault) => {
                    if outcome.fault.is_none() {
                        outcome.fault = Some(fault);
                    }
                    returns.push(None);
                },
            }
        } else {
            returns.push(None);
        }
    }
    outcome.returns = returns;

    if outcome.done && outcome.fault.is_none() {
        for d in &mut outcome.declare {
            d.defer = false;
        }
    }
    Ok(outcome)
}

/// Validates a completed virtual parameter's `{writable?, value?}` return.
fn validate_vp_return(
    call: &VirtualParameterCall,
    value: Option<&Json>,
) -> Result<VirtualParameterReturn, Fault> {
    let Some(Json::Object(map)) = value else {
        return Err(Fault::script_invalid(format!(
            "virtual parameter {} must return an object",
            call.name
        )));
    };

    for key in map.keys() {
        if key != "writable" && key != "value" {
            return Err(Fault::script_invalid(format!(
                "virtual parameter {} returned unexpected key {key:?}",
                call.name
            )));
        }
    }

    let writable = match (call.wants_writable(), map.get("writable")) {
        (true, Some(Json::Bool(b))) => Some(*b),
        (true, Some(other)) => {
            return Err(Fault::script_invalid(format!(
                "virtual parameter {} returned non-boolean writable {other}",
                call.name
            )));
        },
        (true, None) => {
            return Err(Fault::script_invalid(format!(
                "virtual parameter {} did not return writable",
                call.name
            )));
        },
        (false, Some(_)) => {
            return Err(Fault::script_invalid(format!(
                "virtual parameter {} returned writable unrequested",
                call.name
            )));
        },
        (false, None) => None,
    };

    let value = match (call.wants_value(), map.get("value")) {
        (true, Some(v)) => Some(normalize_vp_value(&call.name, v)?),
        (true, None) => {
            return Err(Fault::script_invalid(format!(
                "virtual parameter {} did not return value",
                call.name
            )));
        },
        (false, Some(_)) => {
            return Err(Fault::script_invalid(format!(
                "virtual parameter {} returned value unrequested",
                call.name
            )));
        },
        (false, None) => None,
    };

    Ok(VirtualParameterReturn { writable, value })
}

/// Normalizes a virtual parameter value to `(literal, xsdType)`, inferring
/// the type for bare scalars.
fn normalize_vp_value(
    name: &str,
    value: &Json,
) -> Result<(Literal, XsdType), Fault> {
    let invalid =
        |msg: String| Err(Fault::script_invalid(format!("virtual parameter {name}: {msg}")));

    match value {
        Json::Bool(b) => Ok((Literal::Bool(*b), XsdType::Boolean)),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Ok((Literal::Number(i), XsdType::Int)),
            None => invalid(format!("non-integer number {n}")),
        },
        Json::String(s) => Ok((Literal::String(s.clone()), XsdType::String)),
        Json::Array(pair) if pair.len() == 2 => {
            let Some(type_str) = pair[1].as_str() else {
                return invalid("type must be a string".to_string());
            };
            let xsd = XsdType::parse(type_str);
            if !xsd.is_known() {
                return invalid(format!("unsupported type {type_str}"));
            }
            let literal = match &pair[0] {
                Json::Bool(b) => Literal::Bool(*b),
                Json::Number(n) => match n.as_i64() {
                    Some(i) => Literal::Number(i),
                    None => return invalid(format!("non-integer number {n}")),
                },
                Json::String(s) => Literal::String(s.clone()),
                other => return invalid(format!("unsupported value {other}")),
            };
            match sanitize_parameter_value(&literal, &xsd) {
                Ok(v) => Ok(v),
                Err(e) => invalid(e.to_string()),
            }
        },
        other => invalid(format!("unsupported return value {other}")),
    }
}

/// Caps declared timestamps at session start and pushes the layer output
/// into the declaration stack.
fn adopt_layer(
    ctx: &mut SessionContext,
    inception: usize,
    mut outcome: LayerOutcome,
) -> Result<Option<Fault>> {
    if let Some(fault) = outcome.fault {
        return Ok(Some(fault.with_timestamp(ctx.timestamp)));
    }

    for d in &mut outcome.declare {
        d.cap_timestamps(ctx.timestamp);
    }
    ctx.declarations.push(outcome.declare);

    if ctx.provisions_ret.len() <= inception {
        ctx.provisions_ret.resize(inception + 1, None);
    }
    ctx.provisions_ret[inception] = outcome.done.then_some(outcome.returns);

    for c in &outcome.clear {
        device::clear(
            &mut ctx.device_data,
            &c.path,
            c.timestamp,
            c.attributes.as_ref(),
        );
    }
    Ok(None)
}

/// Filters raw `VirtualParameters.*` declarations: expands wildcards over
/// the known virtual parameter names, drops names the cache does not carry
/// (clearing their stale data-model nodes), and keeps the root's object
/// attribute in shape.
fn filter_virtual_parameter_declarations(
    ctx: &mut SessionContext,
    raw: Vec<VirtualParameterDeclaration>,
    vparam_names: &HashSet<String>,
) -> Result<(Vec<VirtualParameterDeclaration>, bool)> {
    let timestamp = ctx.timestamp + ctx.iteration as i64;
    let mut filtered = Vec::new();
    let mut to_clear: Vec<ClearEntry> = Vec::new();

    for d in raw {
        match d.path.len() {
            1 => {
                device::set(
                    &mut ctx.device_data,
                    (*d.path).clone(),
                    timestamp,
                    Some(Attributes {
                        object: Some((timestamp, true)),
                        writable: Some((timestamp, false)),
                        ..Default::default()
                    }),
                    &mut to_clear,
                )?;
            },
            2 => match d.path.segment(1) {
                Segment::Name(name) => {
                    if vparam_names.contains(name) {
                        ctx.device_data.paths.add((*d.path).clone());
                        filtered.push(d);
                    } else {
                        warn!(name, "declaration for unknown virtual parameter");
                        if has_state(ctx, &d.path) {
                            to_clear
                                .push(ClearEntry::sweep((*d.path).clone(), timestamp));
                        }
                    }
                },
                _ => {
                    for name in vparam_names {
                        let path = Path::parse(&format!("VirtualParameters.{name}"))?;
                        let interned = ctx.device_data.paths.add(path);
                        filtered.push(VirtualParameterDeclaration {
                            path: interned,
                            path_get: d.path_get,
                            attr_get: d.attr_get.clone(),
                            attr_set: d.attr_set.clone(),
                        });
                    }
                    // Sweep data-model leftovers of removed virtual
                    // parameters.
                    let known = device::unpack(
                        &ctx.device_data,
                        &Path::parse("VirtualParameters.*")?,
                    );
                    for child in known {
                        let is_current = match child.segment(1) {
                            Segment::Name(n) => vparam_names.contains(n),
                            _ => false,
                        };
                        if !is_current {
                            to_clear.push(ClearEntry::sweep((*child).clone(), timestamp));
                        }
                    }
                },
            },
            _ => {
                if has_state(ctx, &d.path) {
                    to_clear.push(ClearEntry::sweep((*d.path).clone(), timestamp));
                }
            },
        }
    }

    let cleared = !to_clear.is_empty();
    device::apply_clears(&mut ctx.device_data, &to_clear);
    Ok((filtered, cleared))
}

/// True when the data model still holds anything for `path`.
fn has_state(ctx: &SessionContext, path: &Path) -> bool {
    ctx.device_data.paths.get(path).is_some_and(|p| {
        ctx.device_data.attributes.has(&p)
            || ctx.device_data.timestamps.get(&p).is_some()
    })
}

/// Writes the pending ACS-side state (tags, download instances, download
/// parameter values) during the update phase. Returns true when anything
/// was written.
fn apply_pending_writes(ctx: &mut SessionContext) -> Result<bool> {
    let Some(sync) = ctx.sync_state.as_mut() else {
        return Ok(false);
    };
    let tags = std::mem::take(&mut sync.tags);
    let downloads_to_delete = std::mem::take(&mut sync.downloads_to_delete);
    let downloads_to_create: Vec<_> = sync.downloads_to_create.drain().collect();
    let downloads_values = std::mem::take(&mut sync.downloads_values);

    if tags.is_empty()
        && downloads_to_delete.is_empty()
        && downloads_to_create.is_empty()
        && downloads_values.is_empty()
    {
        return Ok(false);
    }

    let timestamp = ctx.timestamp + ctx.iteration as i64 + 1;
    let mut to_clear: Vec<ClearEntry> = Vec::new();

    for (path, present) in tags {
        if present {
            device::set(
                &mut ctx.device_data,
                (*path).clone(),
                timestamp,
                Some(Attributes {
                    object: Some((timestamp, false)),
                    writable: Some((timestamp, true)),
                    value: Some((timestamp, (Literal::Bool(true), XsdType::Boolean))),
                    ..Default::default()
                }),
                &mut to_clear,
            )?;
        } else {
            device::set(
                &mut ctx.device_data,
                (*path).clone(),
                timestamp,
                None,
                &mut to_clear,
            )?;
        }
    }

    for path in downloads_to_delete {
        device::set(&mut ctx.device_data, (*path).clone(), timestamp, None, &mut to_clear)?;
    }

    if !downloads_to_create.is_empty() {
        device::set(
            &mut ctx.device_data,
            Path::parse("Downloads")?,
            timestamp,
            Some(Attributes {
                object: Some((timestamp, true)),
                writable: Some((timestamp, true)),
                ..Default::default()
            }),
            &mut to_clear,
        )?;
    }
    for keys in downloads_to_create {
        let index = next_download_index(ctx);
        let base = Path::parse(&format!("Downloads.{index}"))?;
        device::set(
            &mut ctx.device_data,
            base.clone(),
            timestamp,
            Some(Attributes {
                object: Some((timestamp, true)),
                writable: Some((timestamp, true)),
                ..Default::default()
            }),
            &mut to_clear,
        )?;
        for leaf in ["FileType", "FileName", "TargetFileName"] {
            let value = keys.get(leaf).cloned().unwrap_or_default();
            device::set(
                &mut ctx.device_data,
                base.concat(&Path::parse(leaf)?)?,
                timestamp,
                Some(Attributes {
                    object: Some((timestamp, false)),
                    writable: Some((timestamp, true)),
                    value: Some((timestamp, (Literal::String(value), XsdType::String))),
                    ..Default::default()
                }),
                &mut to_clear,
            )?;
        }
        device::set(
            &mut ctx.device_data,
            base.concat(&Path::parse("Download")?)?,
            timestamp,
            Some(Attributes {
                object: Some((timestamp, false)),
                writable: Some((timestamp, true)),
                value: Some((timestamp, (Literal::Number(0), XsdType::DateTime))),
                ..Default::default()
            }),
            &mut to_clear,
        )?;
    }

    for (path, value) in downloads_values {
        if !ctx.device_data.attributes.has(&path) {
            warn!(path = %path, "declared download value on unknown instance");
            continue;
        }
        let is_download_leaf =
            matches!(path.segment(2), Segment::Name(n) if n == "Download");
        let target_type = if is_download_leaf {
            XsdType::DateTime
        } else {
            XsdType::String
        };
        match sanitize_parameter_value(&value, &target_type) {
            Ok(value) => {
                device::set(
                    &mut ctx.device_data,
                    (*path).clone(),
                    timestamp,
                    Some(Attributes {
                        value: Some((timestamp, value)),
                        ..Default::default()
                    }),
                    &mut to_clear,
                )?;
            },
            Err(e) => warn!(path = %path, "invalid download value: {e}"),
        }
    }

    device::apply_clears(&mut ctx.device_data, &to_clear);
    Ok(true)
}

fn next_download_index(ctx: &SessionContext) -> u64 {
    let Ok(pattern) = Path::parse("Downloads.*") else {
        return 1;
    };
    device::unpack(&ctx.device_data, &pattern)
        .iter()
        .filter_map(|p| match p.segment(1) {
            Segment::Instance(n) => Some(*n),
            _ => None,
        })
        .max()
        .map_or(1, |n| n + 1)
}

/// The reentrant driver step: returns the next ACS request, a fault, or
/// `Done` when the session has converged.
///
/// `extra` declarations (from the host, e.g. connection-request handling)
/// are spliced into the provisions layer.
pub async fn rpc_request(
    services: &Services,
    ctx: &mut SessionContext,
    extra: Option<Vec<Declaration>>,
) -> Result<DriverResult> {
    let user_scripts = services.cache.provisions(&ctx.cache_snapshot).await?;
    let vparam_names = services.cache.virtual_parameters(&ctx.cache_snapshot).await?;
    let mut extra = extra.filter(|d| !d.is_empty());

    loop {
        // (A) An in-flight request is re-offered with a fresh id.
        if let Some(request) = &ctx.rpc_request {
            return Ok(DriverResult::Request {
                rpc_id: ctx.generate_rpc_id(),
                request: request.clone(),
            });
        }

        // (B) Nothing to do at all.
        if ctx.provisions.is_empty()
            && ctx.declarations.is_empty()
            && ctx.virtual_parameters.is_empty()
            && extra.is_none()
        {
            return Ok(DriverResult::Done);
        }

        // (C) Run the next provision / virtual-parameter layer.
        if ctx.declarations.len() <= ctx.virtual_parameters.len() {
            let inception = ctx.declarations.len();
            while ctx.revisions.len() <= inception {
                let last = ctx.revisions.last().copied().unwrap_or(0);
                ctx.revisions.push(last);
            }
            let revision = ctx.revisions[inception] + 1;
            ctx.device_data.set_revision(revision);

            let start_revision = if inception == 0 {
                0
            } else {
                ctx.revisions[inception - 1]
            };
            let end_revision = ctx.revisions[inception];

            let outcome = if inception == 0 {
                let provisions = ctx.provisions.clone();
                run_provisions(
                    services,
                    ctx,
                    &provisions,
                    start_revision,
                    end_revision,
                    &user_scripts,
                )
                .await?
            } else {
                let calls = ctx.virtual_parameters[inception - 1].clone();
                run_virtual_parameters(services, ctx, &calls, start_revision, end_revision)
                    .await?
            };

            if let Some(fault) = adopt_layer(ctx, inception, outcome)? {
                return Ok(DriverResult::Fault(fault));
            }
            continue;
        }

        // (D) Splice host-supplied declarations into the provisions layer.
        if let Some(extra_decs) = extra.take() {
            ctx.sync_state = None;
            if ctx.declarations.is_empty() {
                ctx.declarations.push(Vec::new());
            }
            ctx.declarations[0].extend(extra_decs);
            continue;
        }

        // (E) Quotas.
        if ctx.rpc_count >= ctx.config.max_rpc_count {
            return Ok(DriverResult::Fault(
                Fault::new("too_many_rpcs", "RPC count exceeded")
                    .with_timestamp(ctx.timestamp),
            ));
        }
        if ctx.revisions.len() > MAX_INCEPTION_DEPTH {
            return Ok(DriverResult::Fault(
                Fault::new(
                    "deeply_nested_vparams",
                    "virtual parameters nested too deeply",
                )
                .with_timestamp(ctx.timestamp),
            ));
        }
        if ctx.cycle >= MAX_CYCLES {
            return Ok(DriverResult::Fault(
                Fault::new("too_many_cycles", "too many provision cycles")
                    .with_timestamp(ctx.timestamp),
            ));
        }
        if ctx.iteration >= ctx.max_iterations() * (ctx.cycle + 1) {
            return Ok(DriverResult::Fault(
                Fault::new("too_many_commits", "too many commit iterations")
                    .with_timestamp(ctx.timestamp),
            ));
        }

        // (F) Process declarations one inception level at a time.
        let computed = ctx
            .sync_state
            .as_ref()
            .map_or(0, |s| s.virtual_parameter_declarations.len());
        if computed < ctx.declarations.len() {
            let layer = ctx.declarations[computed].clone();
            let raw = run_declarations(ctx, &layer, &vparam_names)?;
            let (filtered, cleared) =
                filter_virtual_parameter_declarations(ctx, raw, &vparam_names)?;
            ctx.sync_state
                .get_or_insert_with(SyncState::new)
                .virtual_parameter_declarations
                .push(filtered);
            if cleared {
                // Cleared stale virtual-parameter state; replan this level.
                ctx.sync_state = None;
            }
            continue;
        }

        // (G) Plan reads, then ACS-side writes, then mutations.
        let inception = ctx.declarations.len() - 1;
        let mut vp_calls = generate_get_virtual_parameter_provisions(ctx);
        if vp_calls.is_empty() {
            ctx.rpc_request = generate_get_rpc_request(ctx)?;
            if ctx.rpc_request.is_none() {
                if ctx.device_data.changes.contains(PREREQUISITE_TRACKER) {
                    // Prerequisites moved under the plan; start a fresh
                    // commit round.
                    debug!("prerequisite data changed, replanning");
                    ctx.sync_state = None;
                    device::clear_trackers(&mut ctx.device_data, PREREQUISITE_TRACKER);
                    ctx.iteration += 2;
                    continue;
                }
                if apply_pending_writes(ctx)? {
                    continue;
                }
                vp_calls = generate_set_virtual_parameter_provisions(ctx);
                if vp_calls.is_empty() {
                    ctx.rpc_request = generate_set_rpc_request(ctx)?;
                }
            }
        }

        // (H) Escalate into a deeper virtual-parameter layer.
        if !vp_calls.is_empty() {
            let current_revision = ctx.revisions[inception];
            ctx.virtual_parameters.push(vp_calls);
            ctx.revisions.push(current_revision);
            continue;
        }

        // (I) Hand the planned request to the transport.
        if let Some(request) = &ctx.rpc_request {
            return Ok(DriverResult::Request {
                rpc_id: ctx.generate_rpc_id(),
                request: request.clone(),
            });
        }

        // (J) This inception level is drained; pop it.
        ctx.revisions[inception] += 1;
        ctx.declarations.pop();
        if let Some(sync) = ctx.sync_state.as_mut() {
            sync.virtual_parameter_declarations.pop();
        }

        let ret = if ctx.provisions_ret.len() > inception {
            ctx.provisions_ret.drain(inception..).next().flatten()
        } else {
            None
        };
        let Some(returns) = ret else {
            // The layer is not done; rerun it at the next revision.
            continue;
        };

        ctx.revisions.pop();
        let revision = ctx.revisions.last().copied().unwrap_or(0);
        ctx.device_data.timestamps.collapse(revision + 1);
        ctx.device_data.attributes.collapse(revision + 1);
        ctx.device_data.set_revision(revision + 1);
        ctx.prune_extensions_cache(revision);

        if let Some(calls) = ctx.virtual_parameters.pop() {
            apply_virtual_parameter_returns(ctx, &calls, &returns)?;
            continue;
        }

        // The provisions layer itself completed.
        return Ok(DriverResult::Done);
    }
}

/// Writes completed virtual parameter returns back to their
/// `VirtualParameters.<name>` nodes.
fn apply_virtual_parameter_returns(
    ctx: &mut SessionContext,
    calls: &[VirtualParameterCall],
    returns: &LayerReturns,
) -> Result<()> {
    let timestamp = ctx.timestamp + ctx.iteration as i64;
    let mut to_clear: Vec<ClearEntry> = Vec::new();

    for (call, ret) in calls.iter().zip(returns.iter()) {
        let Some(ret) = ret else {
            continue;
        };
        let mut attrs = Attributes {
            object: Some((timestamp, false)),
            ..Default::default()
        };
        if let Some(writable) = ret.writable {
            attrs.writable = Some((timestamp, writable));
        }
        if let Some(value) = &ret.value {
            attrs.value = Some((timestamp, value.clone()));
        }
        let path = Path::parse(&format!("VirtualParameters.{}", call.name))?;
        device::set(&mut ctx.device_data, path, timestamp, Some(attrs), &mut to_clear)?;
    }
    device::apply_clears(&mut ctx.device_data, &to_clear);
    Ok(())
}

/// Assimilates a CPE reply into the data model. Returns a fault value for
/// protocol violations the host must know about; internal continuation
/// requests are cached for the next `rpc_request` call.
pub fn rpc_response(
    ctx: &mut SessionContext,
    rpc_id: &str,
    response: &CpeResponse,
) -> Result<Option<Fault>> {
    let Some(request) = ctx.rpc_request.clone() else {
        return Ok(Some(
            Fault::new("invalid_response", "no request in flight")
                .with_timestamp(ctx.timestamp),
        ));
    };
    if rpc_id != ctx.generate_rpc_id() || !response.answers(&request) {
        warn!(rpc_id, response = response.method_name(), "response mismatch");
        return Ok(Some(
            Fault::new("invalid_response", "response does not match request")
                .with_timestamp(ctx.timestamp),
        ));
    }

    ctx.rpc_count += 1;
    ctx.rpc_request = None;

    let timestamp = ctx.timestamp + ctx.iteration as i64 + 1;
    let mut to_clear: Vec<ClearEntry> = Vec::new();

    match (&request, response) {
        (
            AcsRequest::GetParameterNames(req),
            CpeResponse::GetParameterNamesResponse { parameter_list },
        ) => {
            assimilate_gpn(ctx, req.parameter_path.as_str(), req.next_level, parameter_list, timestamp, &mut to_clear)?;
        },
        (
            AcsRequest::GetParameterValues(req),
            CpeResponse::GetParameterValuesResponse { parameter_list },
        ) => {
            assimilate_gpv(ctx, req, parameter_list, timestamp, &mut to_clear)?;
        },
        (
            AcsRequest::GetParameterAttributes(req),
            CpeResponse::GetParameterAttributesResponse { parameter_list },
        ) => {
            let requested: HashSet<&str> =
                req.parameter_names.iter().map(String::as_str).collect();
            for attr in parameter_list {
                if !requested.contains(attr.name.as_str()) {
                    warn!(name = %attr.name, "unexpected parameter attributes");
                }
                device::set(
                    &mut ctx.device_data,
                    Path::parse(&attr.name)?,
                    timestamp,
                    Some(Attributes {
                        object: Some((timestamp, false)),
                        notification: Some((timestamp, attr.notification)),
                        access_list: Some((timestamp, attr.access_list.clone())),
                        ..Default::default()
                    }),
                    &mut to_clear,
                )?;
            }
        },
        (
            AcsRequest::SetParameterValues(req),
            CpeResponse::SetParameterValuesResponse { .. },
        ) => {
            for (name, literal, xsd) in &req.parameter_list {
                device::set(
                    &mut ctx.device_data,
                    Path::parse(name)?,
                    timestamp,
                    Some(Attributes {
                        value: Some((timestamp, (literal.clone(), xsd.clone()))),
                        ..Default::default()
                    }),
                    &mut to_clear,
                )?;
            }
        },
        (
            AcsRequest::SetParameterAttributes(req),
            CpeResponse::SetParameterAttributesResponse,
        ) => {
            for entry in &req.parameter_list {
                let mut attrs = Attributes::default();
                if let Some(n) = entry.notification {
                    attrs.notification = Some((timestamp, n));
                }
                if let Some(al) = &entry.access_list {
                    attrs.access_list = Some((timestamp, al.clone()));
                }
                device::set(
                    &mut ctx.device_data,
                    Path::parse(&entry.name)?,
                    timestamp,
                    Some(attrs),
                    &mut to_clear,
                )?;
            }
        },
        (
            AcsRequest::AddObject(req),
            CpeResponse::AddObjectResponse { instance_number, .. },
        ) => {
            let parent = Path::parse(&req.object_name)?;
            let instance = parent.child(Segment::Instance(*instance_number))?;
            device::set(
                &mut ctx.device_data,
                instance.clone(),
                timestamp,
                Some(Attributes {
                    object: Some((timestamp, true)),
                    writable: Some((timestamp, true)),
                    ..Default::default()
                }),
                &mut to_clear,
            )?;
            // The instance listing of the parent changed.
            device::refresh_timestamp(
                &mut ctx.device_data,
                parent.child(Segment::Wildcard)?,
                timestamp,
            );

            if matches!(req.next, Some(NextAction::GetInstanceKeys))
                && !req.instance_values.is_empty()
            {
                let mut names = Vec::new();
                let mut expected = Vec::new();
                for (key, value) in &req.instance_values {
                    let key_path = instance.concat(&Path::parse(key)?)?;
                    names.push(key_path.to_string());
                    expected.push((key_path.to_string(), Literal::String(value.clone())));
                }
                debug!(instance = %instance, "following up with instance key read");
                ctx.rpc_request =
                    Some(AcsRequest::from(crate::models::acs::GetParameterValues {
                        parameter_names: names,
                        next: Some(NextAction::SetInstanceKeys { expected }),
                    }));
            }
        },
        (AcsRequest::DeleteObject(req), CpeResponse::DeleteObjectResponse { .. }) => {
            let path = Path::parse(&req.object_name)?;
            device::set(&mut ctx.device_data, path.clone(), timestamp, None, &mut to_clear)?;
            device::refresh_timestamp(
                &mut ctx.device_data,
                path.parent().child(Segment::Wildcard)?,
                timestamp,
            );
        },
        (AcsRequest::Download(req), CpeResponse::DownloadResponse { status, start_time, complete_time }) => {
            assimilate_download(ctx, req, *status, *start_time, *complete_time, timestamp, &mut to_clear)?;
        },
        (AcsRequest::Reboot(_), CpeResponse::RebootResponse) => {
            device::set(
                &mut ctx.device_data,
                Path::parse("Reboot")?,
                timestamp,
                Some(Attributes {
                    object: Some((timestamp, false)),
                    writable: Some((timestamp, true)),
                    value: Some((
                        timestamp,
                        (Literal::Number(ctx.timestamp), XsdType::DateTime),
                    )),
                    ..Default::default()
                }),
                &mut to_clear,
            )?;
        },
        (AcsRequest::FactoryReset(_), CpeResponse::FactoryResetResponse) => {
            device::set(
                &mut ctx.device_data,
                Path::parse("FactoryReset")?,
                timestamp,
                Some(Attributes {
                    object: Some((timestamp, false)),
                    writable: Some((timestamp, true)),
                    value: Some((
                        timestamp,
                        (Literal::Number(ctx.timestamp), XsdType::DateTime),
                    )),
                    ..Default::default()
                }),
                &mut to_clear,
            )?;
        },
        _ => {
            return Ok(Some(
                Fault::new("invalid_response", "response does not match request")
                    .with_timestamp(ctx.timestamp),
            ));
        },
    }

    device::apply_clears(&mut ctx.device_data, &to_clear);
    Ok(None)
}

fn assimilate_gpn(
    ctx: &mut SessionContext,
    parameter_path: &str,
    next_level: bool,
    parameter_list: &[ParameterInfo],
    timestamp: i64,
    to_clear: &mut Vec<ClearEntry>,
) -> Result<()> {
    let root = Path::parse(parameter_path)?;

    if root.is_root() {
        // A root listing implicitly confirms the ACS-virtual roots.
        for virtual_root in [
            "DeviceID",
            "Events",
            "Tags",
            "Reboot",
            "FactoryReset",
            "VirtualParameters",
            "Downloads",
        ] {
            device::refresh_timestamp(
                &mut ctx.device_data,
                Path::parse(virtual_root)?,
                timestamp,
            );
        }
    }

    let mut entries: Vec<(Path, &ParameterInfo)> = Vec::new();
    for info in parameter_list {
        if ctx.config.is_ignored(&info.name) {
            debug!(name = %info.name, "ignored parameter");
            continue;
        }
        entries.push((Path::parse(&info.name)?, info));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut reported_objects: Vec<Arc<Path>> = Vec::new();
    if !root.is_root() && !entries.is_empty() {
        // Children were listed, so the queried node is an object.
        device::set(
            &mut ctx.device_data,
            root.clone(),
            timestamp,
            Some(Attributes {
                object: Some((timestamp, true)),
                ..Default::default()
            }),
            to_clear,
        )?;
        reported_objects.push(ctx.device_data.paths.add(root.clone()));
    }

    for (path, info) in &entries {
        // Fill in intermediate objects the reply did not spell out.
        for depth in (root.len() + 1)..path.len() {
            let ancestor = path.slice(0, depth);
            if !ctx.device_data.attributes.has(
                &ctx.device_data
                    .paths
                    .get(&ancestor)
                    .unwrap_or_else(|| Arc::new(ancestor.clone())),
            ) {
                device::set(
                    &mut ctx.device_data,
                    ancestor,
                    timestamp,
                    Some(Attributes {
                        object: Some((timestamp, true)),
                        ..Default::default()
                    }),
                    to_clear,
                )?;
            }
        }

        device::set(
            &mut ctx.device_data,
            path.clone(),
            timestamp,
            Some(Attributes {
                object: Some((timestamp, info.object)),
                writable: Some((timestamp, info.writable)),
                ..Default::default()
            }),
            to_clear,
        )?;
        if info.object {
            let interned = ctx.device_data.paths.add(path.clone());
            reported_objects.push(interned);
        }
    }

    if !root.is_root() {
        // Record that the queried node was inspected, even when the reply
        // was empty; the planner must not ask again this round.
        device::refresh_timestamp(&mut ctx.device_data, root.clone(), timestamp);
    }

    // Sweep descendants that were not re-confirmed under each enumerated
    // node: the whole reported set for a deep listing, the queried node for
    // a single-hop listing.
    let enumerated: Vec<Path> = if next_level {
        vec![root.clone()]
    } else {
        let mut all: Vec<Path> =
            reported_objects.iter().map(|p| (**p).clone()).collect();
        all.push(root.clone());
        all
    };
    for node in enumerated {
        let sweep = if node.is_root() {
            Path::parse("*")?
        } else {
            node.child(Segment::Wildcard)?
        };
        device::set(&mut ctx.device_data, sweep, timestamp, None, to_clear)?;
    }

    continue_gpn_crawl(ctx, &reported_objects);
    Ok(())
}

/// Re-queues reported object children whose subtrees a declared pattern
/// still needs, keeping the discovery crawl going without replanning.
fn continue_gpn_crawl(ctx: &mut SessionContext, reported_objects: &[Arc<Path>]) {
    let Some(sync) = ctx.sync_state.as_ref() else {
        return;
    };
    let patterns: Vec<(Arc<Path>, (u32, i64))> = sync
        .gpn_patterns
        .iter()
        .map(|(p, v)| (Arc::clone(p), *v))
        .collect();

    let mut requeue: Vec<Arc<Path>> = Vec::new();
    for child in reported_objects {
        for (pattern, (_, declared)) in &patterns {
            if pattern.len() <= child.len() {
                continue;
            }
            if !pattern.slice(0, child.len()).dealias().covers(child) {
                continue;
            }
            let boundary_seg = match pattern.segment(child.len()) {
                seg if seg.is_exact() => seg.clone(),
                _ => Segment::Wildcard,
            };
            let Ok(boundary) = child.child(boundary_seg) else {
                continue;
            };
            let current = device::effective_timestamp(&ctx.device_data, &boundary);
            if *declared > current {
                requeue.push(Arc::clone(child));
                break;
            }
        }
    }

    if let Some(sync) = ctx.sync_state.as_mut() {
        for child in requeue {
            debug!(path = %child, "GPN crawl descends");
            sync.gpn.insert(child);
        }
    }
}

fn assimilate_gpv(
    ctx: &mut SessionContext,
    request: &crate::models::acs::GetParameterValues,
    parameter_list: &[(String, Literal, XsdType)],
    timestamp: i64,
    to_clear: &mut Vec<ClearEntry>,
) -> Result<()> {
    let requested: HashSet<&str> = request
        .parameter_names
        .iter()
        .map(String::as_str)
        .collect();
    let mut reported: HashSet<&str> = HashSet::new();

    for (name, literal, xsd) in parameter_list {
        if !requested.contains(name.as_str()) {
            warn!(name = %name, "unexpected parameter value");
        }
        reported.insert(name.as_str());
        device::set(
            &mut ctx.device_data,
            Path::parse(name)?,
            timestamp,
            Some(Attributes {
                object: Some((timestamp, false)),
                value: Some((timestamp, (literal.clone(), xsd.clone()))),
                ..Default::default()
            }),
            to_clear,
        )?;
    }

    for name in &request.parameter_names {
        if !reported.contains(name.as_str()) {
            warn!(name = %name, "requested parameter missing from response");
            device::set(
                &mut ctx.device_data,
                Path::parse(name)?,
                timestamp,
                Some(Attributes {
                    object: Some((timestamp, false)),
                    value: Some((
                        timestamp,
                        (Literal::String(String::new()), XsdType::String),
                    )),
                    ..Default::default()
                }),
                to_clear,
            )?;
        }
    }

    if let Some(NextAction::SetInstanceKeys { expected }) = &request.next {
        // Enforce the declared alias keys the device did not adopt.
        let mut fixes: Vec<(String, Literal, XsdType)> = Vec::new();
        for (name, want) in expected {
            let reported_value = parameter_list.iter().find(|(n, _, _)| n == name);
            let matches = reported_value.is_some_and(|(_, lit, _)| {
                lit.to_string() == want.to_string()
            });
            if !matches {
                let xsd = reported_value
                    .map(|(_, _, t)| t.clone())
                    .unwrap_or(XsdType::String);
                match sanitize_parameter_value(want, &xsd) {
                    Ok((lit, ty)) => fixes.push((name.clone(), lit, ty)),
                    Err(e) => warn!(name = %name, "cannot enforce instance key: {e}"),
                }
            }
        }
        if !fixes.is_empty() {
            debug!(count = fixes.len(), "following up with instance key fix");
            ctx.rpc_request = Some(AcsRequest::from(SetParameterValues {
                parameter_list: fixes,
                datetime_milliseconds: ctx.config.datetime_milliseconds,
                boolean_literal: ctx.config.boolean_literal,
                next: None,
            }));
        }
    }
    Ok(())
}

fn assimilate_download(
    ctx: &mut SessionContext,
    request: &crate::models::acs::Download,
    status: u32,
    start_time: Option<i64>,
    complete_time: Option<i64>,
    timestamp: i64,
    to_clear: &mut Vec<ClearEntry>,
) -> Result<()> {
    let instance = Path::parse(&request.instance)?;
    let set_value = |ctx: &mut SessionContext,
                     to_clear: &mut Vec<ClearEntry>,
                     leaf: &str,
                     value: (Literal, XsdType)|
     -> Result<()> {
        device::set(
            &mut ctx.device_data,
            instance.concat(&Path::parse(leaf)?)?,
            timestamp,
            Some(Attributes {
                object: Some((timestamp, false)),
                value: Some((timestamp, value)),
                ..Default::default()
            }),
            to_clear,
        )?;
        Ok(())
    };

    set_value(
        ctx,
        to_clear,
        "Download",
        (Literal::Number(ctx.timestamp), XsdType::DateTime),
    )?;

    if status == 0 {
        set_value(
            ctx,
            to_clear,
            "LastDownload",
            (Literal::Number(ctx.timestamp), XsdType::DateTime),
        )?;
        set_value(
            ctx,
            to_clear,
            "LastFileType",
            (Literal::String(request.file_type.clone()), XsdType::String),
        )?;
        set_value(
            ctx,
            to_clear,
            "LastFileName",
            (Literal::String(request.file_name.clone()), XsdType::String),
        )?;
        set_value(
            ctx,
            to_clear,
            "LastTargetFileName",
            (
                Literal::String(request.target_file_name.clone()),
                XsdType::String,
            ),
        )?;
        set_value(
            ctx,
            to_clear,
            "StartTime",
            (
                Literal::Number(start_time.unwrap_or(ctx.timestamp)),
                XsdType::DateTime,
            ),
        )?;
        set_value(
            ctx,
            to_clear,
            "CompleteTime",
            (
                Literal::Number(complete_time.unwrap_or(ctx.timestamp)),
                XsdType::DateTime,
            ),
        )?;
    } else {
        // The CPE queued the transfer; remember it for TransferComplete.
        let operation = crate::session::Operation {
            name: "Download".to_string(),
            timestamp: ctx.timestamp,
            channels: ctx.channels.clone(),
            args: crate::session::DownloadArgs {
                instance: request.instance.clone(),
                file_type: request.file_type.clone(),
                file_name: request.file_name.clone(),
                target_file_name: request.target_file_name.clone(),
            },
        };
        ctx.operations
            .insert(request.command_key.clone(), operation);
        ctx.operations_touched.insert(request.command_key.clone());
        debug!(command_key = %request.command_key, "download pending");
    }
    Ok(())
}

/// Handles a CWMP fault envelope. `cwmp.9005` (invalid parameter name) is
/// recoverable: the referenced paths are invalidated and the planner tries
/// again; everything else surfaces to the host.
pub fn rpc_fault(
    ctx: &mut SessionContext,
    rpc_id: &str,
    fault: &CpeFault,
) -> Result<Option<Fault>> {
    let Some(request) = ctx.rpc_request.clone() else {
        return Ok(Some(
            Fault::new("invalid_response", "no request in flight")
                .with_timestamp(ctx.timestamp),
        ));
    };
    if rpc_id != ctx.generate_rpc_id() {
        return Ok(Some(
            Fault::new("invalid_response", "fault does not match request")
                .with_timestamp(ctx.timestamp),
        ));
    }

    ctx.rpc_count += 1;
    ctx.rpc_request = None;

    if fault.code() == "9005" {
        let timestamp = ctx.timestamp + ctx.iteration as i64 + 1;
        let mut to_clear: Vec<ClearEntry> = Vec::new();
        for name in request_paths(&request) {
            match Path::parse(&name) {
                Ok(path) => {
                    device::set(&mut ctx.device_data, path, timestamp, None, &mut to_clear)?;
                },
                Err(e) => warn!(name = %name, "unparseable faulted path: {e}"),
            }
        }
        device::apply_clears(&mut ctx.device_data, &to_clear);
        // Replan against the reduced data model.
        ctx.sync_state = None;
        debug!(request = request.method_name(), "recovered from cwmp.9005");
        return Ok(None);
    }

    Ok(Some(Fault::cwmp(
        crate::models::fault::FaultStruct {
            fault_code: fault.code().to_string(),
            fault_string: fault.message().to_string(),
        },
        ctx.timestamp,
    )))
}

/// The parameter/object paths a request referenced, for 9005 invalidation.
fn request_paths(request: &AcsRequest) -> Vec<String> {
    match request {
        AcsRequest::GetParameterNames(r) => {
            vec![r.parameter_path.trim_end_matches('.').to_string()]
        },
        AcsRequest::GetParameterValues(r) => r.parameter_names.clone(),
        AcsRequest::GetParameterAttributes(r) => r.parameter_names.clone(),
        AcsRequest::SetParameterValues(r) => {
            r.parameter_list.iter().map(|(n, _, _)| n.clone()).collect()
        },
        AcsRequest::SetParameterAttributes(r) => {
            r.parameter_list.iter().map(|e| e.name.clone()).collect()
        },
        AcsRequest::AddObject(r) => {
            vec![r.object_name.trim_end_matches('.').to_string()]
        },
        AcsRequest::DeleteObject(r) => {
            vec![r.object_name.trim_end_matches('.').to_string()]
        },
        AcsRequest::Download(r) => vec![r.instance.clone()],
        AcsRequest::Reboot(_) | AcsRequest::FactoryReset(_) => Vec::new(),
    }
}
