// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use cwmp_session_rs::{
    device,
    models::{
        attributes::Attributes,
        value::{Literal, XsdType},
    },
    path::Path,
    session::{
        self, Provision,
        lifecycle::add_provisions,
        serialize::{deserialize, serialize},
    },
};
use serde_json::json;

use crate::unit_tests::{new_session, services};

#[tokio::test]
async fn serialize_roundtrips_observable_state() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    let t = ctx.timestamp;

    let mut to_clear = Vec::new();
    device::set(
        &mut ctx.device_data,
        Path::parse("A")?,
        t,
        Some(Attributes {
            object: Some((t, true)),
            writable: Some((t, false)),
            ..Default::default()
        }),
        &mut to_clear,
    )?;
    device::set(
        &mut ctx.device_data,
        Path::parse("A.B")?,
        t,
        Some(Attributes {
            object: Some((t, false)),
            value: Some((t, (Literal::Number(7), XsdType::Int))),
            ..Default::default()
        }),
        &mut to_clear,
    )?;
    device::apply_clears(&mut ctx.device_data, &to_clear);

    let tracked = ctx.device_data.paths.add(Path::parse("A.*")?);
    device::track(&mut ctx.device_data, &tracked, "prerequisite");

    add_provisions(
        &mut ctx,
        "default",
        &[Provision::new("refresh", vec![json!("A")])],
    );
    ctx.rpc_count = 3;
    ctx.operations.insert(
        "cafe".to_string(),
        session::Operation {
            name: "Download".to_string(),
            timestamp: t,
            channels: ctx.channels.clone(),
            args: session::DownloadArgs {
                instance: "Downloads.1".to_string(),
                file_type: "1 Firmware Upgrade Image".to_string(),
                file_name: "fw.bin".to_string(),
                target_file_name: String::new(),
            },
        },
    );

    let blob = serialize(&ctx)?;
    let restored = deserialize(&services, &blob).await?;

    assert_eq!(restored.device_id, ctx.device_id);
    assert_eq!(restored.timestamp, ctx.timestamp);
    assert_eq!(restored.provisions, ctx.provisions);
    assert_eq!(restored.channels, ctx.channels);
    assert_eq!(restored.revisions, ctx.revisions);
    assert_eq!(restored.rpc_count, ctx.rpc_count);
    assert_eq!(restored.operations, ctx.operations);
    assert_eq!(restored.config, ctx.config);

    let p = restored
        .device_data
        .paths
        .get(&Path::parse("A.B")?)
        .expect("path re-interned");
    assert_eq!(
        restored.device_data.attributes.get(&p),
        ctx.device_data.attributes.get(&p),
    );

    let pattern = restored
        .device_data
        .paths
        .get(&Path::parse("A.*")?)
        .expect("pattern re-interned");
    assert!(
        restored
            .device_data
            .trackers
            .get(&pattern)
            .is_some_and(|m| m.contains_key("prerequisite")),
        "trackers survive the roundtrip"
    );

    // Serialization is deterministic.
    assert_eq!(blob, serialize(&restored)?);
    Ok(())
}

#[tokio::test]
async fn in_flight_request_survives_the_roundtrip() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;

    ctx.rpc_request = Some(cwmp_session_rs::models::acs::AcsRequest::from(
        cwmp_session_rs::models::acs::GetParameterValues {
            parameter_names: vec!["A.B".to_string()],
            next: None,
        },
    ));

    let blob = serialize(&ctx)?;
    let restored = deserialize(&services, &blob).await?;
    assert_eq!(restored.rpc_request, ctx.rpc_request);
    assert!(restored.sync_state.is_none(), "planner state is ephemeral");
    Ok(())
}
