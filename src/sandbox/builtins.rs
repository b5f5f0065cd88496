// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Builtin provisions. When a provision name has no user script in the
//! local cache, the engine runs the builtin of the same name instead.

use anyhow::{Context, Result, bail};
use serde_json::Value as Json;
use tracing::debug;

use crate::{
    device,
    models::{
        attributes::{AttributeTimestamps, AttributeValues},
        value::Literal,
    },
    path::{Path, Segment},
    sandbox::ScriptResult,
    session::{
        SessionContext,
        declaration::{Declaration, InstanceBounds},
    },
    utils::encode_event_code,
};

/// How many levels below a refreshed path the subtree crawl extends.
const REFRESH_FANOUT_DEPTH: usize = 5;

pub const BUILTIN_NAMES: &[&str] = &[
    "refresh",
    "value",
    "tag",
    "reboot",
    "reset",
    "download",
    "instances",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_NAMES.contains(&name)
}

/// Runs the builtin provision `name`. Returns `None` when the name is not a
/// builtin; the caller then dispatches to the sandbox.
pub fn run_builtin(
    session: &SessionContext,
    name: &str,
    args: &[Json],
    start_revision: u32,
    end_revision: u32,
) -> Result<Option<ScriptResult>> {
    let result = match name {
        "refresh" => refresh(session, args)?,
        "value" => value(args)?,
        "tag" => tag(args)?,
        "reboot" => reboot(session)?,
        "reset" => reset(session)?,
        "download" => download(session, args)?,
        "instances" => instances(session, args, start_revision, end_revision)?,
        _ => return Ok(None),
    };
    Ok(Some(result))
}

fn arg_str<'a>(args: &'a [Json], idx: usize, what: &str) -> Result<&'a str> {
    args.get(idx)
        .and_then(Json::as_str)
        .with_context(|| format!("builtin provision expects {what} as argument {idx}"))
}

fn arg_literal(args: &[Json], idx: usize, what: &str) -> Result<Literal> {
    let v = args
        .get(idx)
        .with_context(|| format!("builtin provision expects {what} as argument {idx}"))?;
    json_to_literal(v)
}

fn json_to_literal(v: &Json) -> Result<Literal> {
    match v {
        Json::Bool(b) => Ok(Literal::Bool(*b)),
        Json::Number(n) => n
            .as_i64()
            .map(Literal::Number)
            .context("numeric argument must be an integer"),
        Json::String(s) => Ok(Literal::String(s.clone())),
        other => bail!("unsupported argument {other}"),
    }
}

/// `["refresh", path, age?]` — the path and its subtree must have been
/// discovered and read no earlier than `now - age` (seconds, default 0).
fn refresh(session: &SessionContext, args: &[Json]) -> Result<ScriptResult> {
    let path = Path::parse(arg_str(args, 0, "a parameter path")?)?;
    let age_ms = args
        .get(1)
        .and_then(Json::as_i64)
        .map(|secs| secs.saturating_mul(1000))
        .unwrap_or(0);
    let timestamp = session.timestamp - age_ms;

    let attr_get = AttributeTimestamps {
        object: Some(timestamp),
        writable: Some(timestamp),
        value: Some(timestamp),
        ..Default::default()
    };

    let mut result = ScriptResult::done();
    let mut pattern = path;
    for level in 0.. {
        result.declare.push(Declaration {
            path: pattern.clone(),
            path_get: Some(timestamp),
            path_set: None,
            attr_get: Some(attr_get.clone()),
            attr_set: None,
            defer: true,
        });
        if level == REFRESH_FANOUT_DEPTH || pattern.len() == Path::MAX_DEPTH {
            break;
        }
        pattern = pattern.child(Segment::Wildcard)?;
    }
    Ok(result)
}

/// `["value", path, value]` — the parameter must exist and carry `value`.
fn value(args: &[Json]) -> Result<ScriptResult> {
    let path = Path::parse(arg_str(args, 0, "a parameter path")?)?;
    let declared = arg_literal(args, 1, "a value")?;

    let mut result = ScriptResult::done();
    result.declare.push(Declaration {
        path,
        path_get: Some(1),
        path_set: None,
        attr_get: Some(AttributeTimestamps {
            value: Some(1),
            ..Default::default()
        }),
        attr_set: Some(AttributeValues {
            value: Some(declared),
            ..Default::default()
        }),
        defer: true,
    });
    Ok(result)
}

/// `["tag", tag, present]` — the ACS-side tag must (not) be present.
fn tag(args: &[Json]) -> Result<ScriptResult> {
    let tag = arg_str(args, 0, "a tag name")?;
    let present = args
        .get(1)
        .and_then(Json::as_bool)
        .context("builtin provision tag expects a boolean as argument 1")?;

    let path = Path::parse(&format!("Tags.{}", encode_event_code(tag)))?;
    let mut result = ScriptResult::done();
    result.declare.push(Declaration {
        path,
        path_get: Some(1),
        path_set: None,
        attr_get: Some(AttributeTimestamps {
            value: Some(1),
            ..Default::default()
        }),
        attr_set: Some(AttributeValues {
            value: Some(Literal::Bool(present)),
            ..Default::default()
        }),
        defer: true,
    });
    Ok(result)
}

fn one_shot(session: &SessionContext, root: &str) -> Result<ScriptResult> {
    let mut result = ScriptResult::done();
    result.declare.push(Declaration {
        path: Path::parse(root)?,
        path_get: Some(1),
        path_set: None,
        attr_get: Some(AttributeTimestamps {
            value: Some(1),
            ..Default::default()
        }),
        attr_set: Some(AttributeValues {
            value: Some(Literal::Number(session.timestamp)),
            ..Default::default()
        }),
        defer: true,
    });
    Ok(result)
}

/// `["reboot"]` — the device must have rebooted no earlier than session
/// start.
fn reboot(session: &SessionContext) -> Result<ScriptResult> {
    one_shot(session, "Reboot")
}

/// `["reset"]` — the device must have been factory-reset no earlier than
/// session start.
fn reset(session: &SessionContext) -> Result<ScriptResult> {
    one_shot(session, "FactoryReset")
}

/// `["download", fileType, fileName, targetFileName?]` — a download with
/// these attributes must exist and have run no earlier than session start.
fn download(session: &SessionContext, args: &[Json]) -> Result<ScriptResult> {
    let file_type = arg_str(args, 0, "a file type")?;
    let file_name = arg_str(args, 1, "a file name")?;
    let target = args.get(2).and_then(Json::as_str).unwrap_or("");

    let mut alias = format!("[FileName={file_name},FileType={file_type}");
    if !target.is_empty() {
        alias.push_str(&format!(",TargetFileName={target}"));
    }
    alias.push(']');

    let instance = Path::parse(&format!("Downloads.{alias}"))?;
    let download_param = Path::parse(&format!("Downloads.{alias}.Download"))?;

    let mut result = ScriptResult::done();
    result.declare.push(Declaration {
        path: instance,
        path_get: Some(1),
        path_set: Some(InstanceBounds::exactly(1)),
        attr_get: None,
        attr_set: None,
        defer: true,
    });
    result.declare.push(Declaration {
        path: download_param,
        path_get: Some(1),
        path_set: None,
        attr_get: Some(AttributeTimestamps {
            value: Some(1),
            ..Default::default()
        }),
        attr_set: Some(AttributeValues {
            value: Some(Literal::Number(session.timestamp)),
            ..Default::default()
        }),
        defer: true,
    });
    Ok(result)
}

/// `["instances", path, count]` — the multi-instance object must have
/// exactly `count` instances, or the current count adjusted by `"+n"`/`"-n"`.
fn instances(
    session: &SessionContext,
    args: &[Json],
    start_revision: u32,
    end_revision: u32,
) -> Result<ScriptResult> {
    let mut path = Path::parse(arg_str(args, 0, "an object path")?)?;
    // The bounds apply to the instances, so a bare object path gets a
    // trailing wildcard.
    if path.is_root() || path.segment(path.len() - 1).is_exact() {
        path = path.child(Segment::Wildcard)?;
    }
    let count_arg = args
        .get(1)
        .context("builtin provision instances expects a count as argument 1")?;

    let relative = count_arg
        .as_str()
        .map(|s| s.starts_with('+') || s.starts_with('-'))
        .unwrap_or(false);

    let mut result = ScriptResult::done();

    if relative {
        result.declare.push(Declaration::path_get(path.clone(), 1));
        if end_revision == start_revision {
            // The current instance count is only readable after a revision
            // of discovery; come back once the data is in.
            result.done = false;
            return Ok(result);
        }
        let delta: i64 = count_arg
            .as_str()
            .unwrap_or("0")
            .parse()
            .context("invalid relative instance count")?;
        let current = device::unpack(&session.device_data, &path).len() as i64;
        let target = (current + delta).max(0) as u32;
        debug!(path = %path, current, target, "relative instances resolved");
        result.declare.push(Declaration {
            path,
            path_get: Some(1),
            path_set: Some(InstanceBounds::exactly(target)),
            attr_get: None,
            attr_set: None,
            defer: true,
        });
    } else {
        let count = match count_arg {
            Json::Number(n) => n.as_u64().context("invalid instance count")? as u32,
            Json::String(s) => s.parse().context("invalid instance count")?,
            other => bail!("invalid instance count {other}"),
        };
        result.declare.push(Declaration {
            path,
            path_get: Some(1),
            path_set: Some(InstanceBounds::exactly(count)),
            attr_get: None,
            attr_set: None,
            defer: true,
        });
    }
    Ok(result)
}
