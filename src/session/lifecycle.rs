// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session lifecycle beyond the RPC loop: Inform assimilation, transfer
//! completion, operation timeouts, and provision management.

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::{
    device::{self, ClearEntry},
    models::{
        attributes::Attributes,
        cpe::{
            InformRequest, InformResponse, TransferCompleteRequest,
            TransferCompleteResponse,
        },
        fault::{Fault, FaultStruct},
        value::{Literal, XsdType, sanitize_parameter_value},
    },
    path::Path,
    session::{Operation, Provision, SessionContext},
    utils::encode_event_code,
};

/// Outcome of a TransferComplete exchange: the acknowledgment for the CPE,
/// plus the fault and finished operation for the host.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferCompleteOutcome {
    pub response: TransferCompleteResponse,
    pub fault: Option<Fault>,
    pub operation: Option<Operation>,
}

fn string_leaf(timestamp: i64, value: impl Into<String>, writable: bool) -> Attributes {
    Attributes {
        object: Some((timestamp, false)),
        writable: Some((timestamp, writable)),
        value: Some((timestamp, (Literal::String(value.into()), XsdType::String))),
        ..Default::default()
    }
}

fn datetime_leaf(timestamp: i64, when: i64) -> Attributes {
    Attributes {
        object: Some((timestamp, false)),
        writable: Some((timestamp, false)),
        value: Some((timestamp, (Literal::Number(when), XsdType::DateTime))),
        ..Default::default()
    }
}

/// Seeds the data model from an Inform: device identity, reported
/// parameters, and one `Events.*` leaf per event code.
pub fn inform(ctx: &mut SessionContext, request: &InformRequest) -> Result<InformResponse> {
    let timestamp = ctx.timestamp;
    let mut to_clear: Vec<ClearEntry> = Vec::new();

    info!(
        device_id = %ctx.device_id,
        events = ?request.event,
        parameters = request.parameter_list.len(),
        "inform"
    );

    let identity = [
        ("DeviceID.Manufacturer", request.device_id.manufacturer.as_str()),
        ("DeviceID.OUI", request.device_id.oui.as_str()),
        ("DeviceID.ProductClass", request.device_id.product_class.as_str()),
        ("DeviceID.SerialNumber", request.device_id.serial_number.as_str()),
    ];
    for (name, value) in identity {
        device::set(
            &mut ctx.device_data,
            Path::parse(name)?,
            timestamp,
            Some(string_leaf(timestamp, value, false)),
            &mut to_clear,
        )?;
    }

    if ctx.is_new {
        device::set(
            &mut ctx.device_data,
            Path::parse("DeviceID.ID")?,
            timestamp,
            Some(string_leaf(timestamp, ctx.device_id.clone(), false)),
            &mut to_clear,
        )?;
        device::set(
            &mut ctx.device_data,
            Path::parse("Events.Registered")?,
            timestamp,
            Some(datetime_leaf(timestamp, timestamp)),
            &mut to_clear,
        )?;
    }

    device::set(
        &mut ctx.device_data,
        Path::parse("Events.Inform")?,
        timestamp,
        Some(datetime_leaf(timestamp, timestamp)),
        &mut to_clear,
    )?;

    for event in &request.event {
        let leaf = encode_event_code(event);
        if leaf.is_empty() {
            warn!(event, "empty event code skipped");
            continue;
        }
        device::set(
            &mut ctx.device_data,
            Path::parse(&format!("Events.{leaf}"))?,
            timestamp,
            Some(datetime_leaf(timestamp, timestamp)),
            &mut to_clear,
        )?;
    }

    for (name, literal, xsd) in &request.parameter_list {
        let value = sanitize_parameter_value(literal, xsd)
            .with_context(|| format!("inform parameter {name}"))?;
        device::set(
            &mut ctx.device_data,
            Path::parse(name)?,
            timestamp,
            Some(Attributes {
                object: Some((timestamp, false)),
                value: Some((timestamp, value)),
                ..Default::default()
            }),
            &mut to_clear,
        )?;
    }

    device::apply_clears(&mut ctx.device_data, &to_clear);
    Ok(InformResponse { max_envelopes: 1 })
}

fn download_param(ctx: &SessionContext, instance: &Path, leaf: &str) -> Option<Literal> {
    let path = instance.concat(&Path::parse(leaf).ok()?).ok()?;
    let interned = ctx.device_data.paths.get(&path)?;
    ctx.device_data
        .attributes
        .get(&interned)
        .and_then(|a| a.value.as_ref())
        .map(|(_, (lit, _))| lit.clone())
}

fn write_download_result(
    ctx: &mut SessionContext,
    operation: &Operation,
    start_time: Option<i64>,
    complete_time: Option<i64>,
    timestamp: i64,
) -> Result<()> {
    let instance = Path::parse(&operation.args.instance)?;
    let mut to_clear: Vec<ClearEntry> = Vec::new();

    let entries: [(&str, (Literal, XsdType)); 6] = [
        (
            "LastDownload",
            (Literal::Number(operation.timestamp), XsdType::DateTime),
        ),
        (
            "LastFileType",
            (
                Literal::String(operation.args.file_type.clone()),
                XsdType::String,
            ),
        ),
        (
            "LastFileName",
            (
                Literal::String(operation.args.file_name.clone()),
                XsdType::String,
            ),
        ),
        (
            "LastTargetFileName",
            (
                Literal::String(operation.args.target_file_name.clone()),
                XsdType::String,
            ),
        ),
        (
            "StartTime",
            (
                Literal::Number(start_time.unwrap_or(operation.timestamp)),
                XsdType::DateTime,
            ),
        ),
        (
            "CompleteTime",
            (
                Literal::Number(complete_time.unwrap_or(timestamp)),
                XsdType::DateTime,
            ),
        ),
    ];
    for (leaf, value) in entries {
        device::set(
            &mut ctx.device_data,
            instance.concat(&Path::parse(leaf)?)?,
            timestamp,
            Some(Attributes {
                object: Some((timestamp, false)),
                value: Some((timestamp, value)),
                ..Default::default()
            }),
            &mut to_clear,
        )?;
    }
    device::apply_clears(&mut ctx.device_data, &to_clear);
    Ok(())
}

fn revert_download(ctx: &mut SessionContext, operation: &Operation) -> Result<()> {
    let instance = Path::parse(&operation.args.instance)?;
    let last = download_param(ctx, &instance, "LastDownload")
        .unwrap_or(Literal::Number(0));
    let timestamp = ctx.timestamp + ctx.iteration as i64 + 1;
    let mut to_clear: Vec<ClearEntry> = Vec::new();
    device::set(
        &mut ctx.device_data,
        instance.concat(&Path::parse("Download")?)?,
        timestamp,
        Some(Attributes {
            value: Some((timestamp, (last, XsdType::DateTime))),
            ..Default::default()
        }),
        &mut to_clear,
    )?;
    device::apply_clears(&mut ctx.device_data, &to_clear);
    Ok(())
}

/// Completes (or faults) a pending Download operation reported by the CPE.
pub fn transfer_complete(
    ctx: &mut SessionContext,
    request: &TransferCompleteRequest,
) -> Result<TransferCompleteOutcome> {
    let Some(operation) = ctx.operations.get(&request.command_key).cloned() else {
        debug!(command_key = %request.command_key, "unknown transfer, acknowledged");
        return Ok(TransferCompleteOutcome {
            response: TransferCompleteResponse {},
            fault: None,
            operation: None,
        });
    };

    ctx.operations.remove(&request.command_key);
    ctx.operations_touched.insert(request.command_key.clone());

    if let Some(fault_struct) = request
        .fault_struct
        .as_ref()
        .filter(|f| f.fault_code != "0" && !f.fault_code.is_empty())
    {
        warn!(
            command_key = %request.command_key,
            code = %fault_struct.fault_code,
            "transfer failed"
        );
        revert_download(ctx, &operation)?;
        return Ok(TransferCompleteOutcome {
            response: TransferCompleteResponse {},
            fault: Some(Fault::cwmp(fault_struct.clone(), ctx.timestamp)),
            operation: Some(operation),
        });
    }

    let timestamp = ctx.timestamp + ctx.iteration as i64 + 1;
    write_download_result(
        ctx,
        &operation,
        request.start_time,
        request.complete_time,
        timestamp,
    )?;
    info!(command_key = %request.command_key, "transfer complete");
    Ok(TransferCompleteOutcome {
        response: TransferCompleteResponse {},
        fault: None,
        operation: Some(operation),
    })
}

/// Times out pending operations whose deadline has passed. Depending on
/// configuration a timed-out download either completes synthetically or is
/// dropped with a `timeout` fault.
pub fn timeout_operations(ctx: &mut SessionContext) -> Result<Vec<(Fault, Operation)>> {
    let deadline_ms = (ctx.config.download_timeout as i64).saturating_mul(1000);
    let expired: Vec<(String, Operation)> = ctx
        .operations
        .iter()
        .filter(|(_, op)| {
            op.name == "Download" && op.timestamp + deadline_ms <= ctx.timestamp
        })
        .map(|(k, op)| (k.clone(), op.clone()))
        .collect();

    let mut faults = Vec::new();
    for (command_key, operation) in expired {
        if ctx.config.download_success_on_timeout {
            debug!(command_key = %command_key, "download timeout treated as success");
            let synthetic = TransferCompleteRequest {
                command_key: command_key.clone(),
                fault_struct: None,
                start_time: Some(operation.timestamp),
                complete_time: Some(ctx.timestamp),
            };
            transfer_complete(ctx, &synthetic)?;
            continue;
        }

        warn!(command_key = %command_key, "download timed out");
        ctx.operations.remove(&command_key);
        ctx.operations_touched.insert(command_key.clone());
        revert_download(ctx, &operation)?;
        faults.push((
            Fault {
                code: "timeout".to_string(),
                message: "Download operation timed out".to_string(),
                detail: Some(FaultStruct {
                    fault_code: "timeout".to_string(),
                    fault_string: format!("command key {command_key}"),
                }),
                timestamp: ctx.timestamp,
            },
            operation,
        ));
    }
    Ok(faults)
}

/// Resets per-cycle counters after provisions changed mid-session. Any
/// planner progress is rolled back to revision zero so the new provision
/// set replans from scratch.
fn reset_cycle(ctx: &mut SessionContext) {
    let progressed = ctx.revisions != [0] || ctx.rpc_count > 0;

    ctx.sync_state = None;
    ctx.declarations.clear();
    ctx.provisions_ret.clear();
    ctx.virtual_parameters.clear();

    if progressed {
        ctx.device_data.timestamps.collapse(0);
        ctx.device_data.attributes.collapse(0);
        ctx.device_data.set_revision(0);
        ctx.prune_extensions_cache(0);
        ctx.cycle += 1;
        ctx.rpc_count = 0;
        ctx.iteration = ctx.cycle * ctx.max_iterations();
        debug!(cycle = ctx.cycle, "new provision cycle");
    }
    ctx.revisions = vec![0];
}

/// Installs provisions on a channel, deduplicating by value. A provision
/// already present keeps its slot; the channel joins the slot's bitmap
/// alongside the channels that already held it.
pub fn add_provisions(ctx: &mut SessionContext, channel: &str, provisions: &[Provision]) {
    reset_cycle(ctx);
    ctx.channels.entry(channel.to_string()).or_insert(0);

    for provision in provisions {
        let slot = ctx
            .provisions
            .iter()
            .position(|p| p == provision)
            .unwrap_or_else(|| {
                ctx.provisions.push(provision.clone());
                ctx.provisions.len() - 1
            });
        if slot >= u64::BITS as usize {
            warn!(slot, "provision bitmap overflow, channel attribution lost");
            continue;
        }
        if let Some(bits) = ctx.channels.get_mut(channel) {
            *bits |= 1 << slot;
        }
    }
}

/// Removes every provision, virtual parameter, declaration, and extension
/// cache entry from the session.
pub fn clear_provisions(ctx: &mut SessionContext) {
    reset_cycle(ctx);
    ctx.provisions.clear();
    ctx.channels.clear();
    ctx.extensions_cache.clear();
}
