// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashSet;

use anyhow::Result;
use cwmp_session_rs::{
    device,
    models::{
        attributes::{AttributeTimestamps, AttributeValues, Attributes},
        value::{Literal, XsdType},
    },
    path::Path,
    session::{
        declaration::{Declaration, InstanceBounds},
        declarations::run_declarations,
    },
};

use crate::unit_tests::{new_session, services};

fn declare_value(path: &str, value: Literal) -> Declaration {
    Declaration {
        path: Path::parse(path).expect("path"),
        path_get: Some(1),
        path_set: None,
        attr_get: Some(AttributeTimestamps {
            value: Some(1),
            ..Default::default()
        }),
        attr_set: Some(AttributeValues {
            value: Some(value),
            ..Default::default()
        }),
        defer: false,
    }
}

#[tokio::test]
async fn reboot_and_factory_reset_land_in_sync_state() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    let t = ctx.timestamp;

    let decs = vec![
        declare_value("Reboot", Literal::Number(t)),
        declare_value("FactoryReset", Literal::Number(t - 5)),
    ];
    run_declarations(&mut ctx, &decs, &HashSet::new())?;

    let sync = ctx.sync_state.as_ref().expect("sync state");
    assert_eq!(sync.reboot, Some(t));
    assert_eq!(sync.factory_reset, Some(t - 5));
    Ok(())
}

#[tokio::test]
async fn tags_are_collected_with_truthiness() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;

    let decs = vec![
        declare_value("Tags.provisioned", Literal::Bool(true)),
        declare_value("Tags.legacy", Literal::String("false".into())),
    ];
    run_declarations(&mut ctx, &decs, &HashSet::new())?;

    let sync = ctx.sync_state.as_ref().expect("sync state");
    let tags: Vec<(String, bool)> = sync
        .tags
        .iter()
        .map(|(p, v)| (p.to_string(), *v))
        .collect();
    assert!(tags.contains(&("Tags.provisioned".to_string(), true)));
    assert!(tags.contains(&("Tags.legacy".to_string(), false)));
    Ok(())
}

#[tokio::test]
async fn downloads_split_into_trigger_and_values() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    let t = ctx.timestamp;

    let decs = vec![
        declare_value("Downloads.1.Download", Literal::Number(t)),
        declare_value("Downloads.1.FileType", Literal::String("3 Vendor Configuration File".into())),
    ];
    run_declarations(&mut ctx, &decs, &HashSet::new())?;

    let sync = ctx.sync_state.as_ref().expect("sync state");
    assert_eq!(sync.downloads_download.len(), 1);
    assert_eq!(sync.downloads_values.len(), 1);
    Ok(())
}

#[tokio::test]
async fn virtual_parameter_declarations_are_split_off() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;

    let vparams: HashSet<String> = ["rssi".to_string()].into_iter().collect();
    let decs = vec![declare_value("VirtualParameters.rssi", Literal::Number(42))];
    let vpd = run_declarations(&mut ctx, &decs, &vparams)?;

    assert_eq!(vpd.len(), 1);
    assert_eq!(vpd[0].path.to_string(), "VirtualParameters.rssi");
    assert!(vpd[0].attr_set.is_some());
    Ok(())
}

#[tokio::test]
async fn unknown_boundary_queues_objectness_refresh() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;

    let decs = vec![Declaration::value_get(
        Path::parse("Device.DeviceInfo.SoftwareVersion")?,
        ctx.timestamp,
    )];
    run_declarations(&mut ctx, &decs, &HashSet::new())?;

    let sync = ctx.sync_state.as_ref().expect("sync state");
    assert!(
        sync.refresh
            .object
            .keys()
            .any(|p| p.to_string() == "Device"),
        "discovery must start at the unknown root"
    );
    assert!(
        sync.refresh
            .value
            .keys()
            .any(|p| p.to_string() == "Device.DeviceInfo.SoftwareVersion"),
        "the value demand stays queued until the leaf is known"
    );
    Ok(())
}

#[tokio::test]
async fn instance_bounds_plan_creation_against_known_parent() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    let t = ctx.timestamp;

    let mut to_clear = Vec::new();
    device::set(
        &mut ctx.device_data,
        Path::parse("IF")?,
        t,
        Some(Attributes {
            object: Some((t, true)),
            writable: Some((t, true)),
            ..Default::default()
        }),
        &mut to_clear,
    )?;
    device::set(&mut ctx.device_data, Path::parse("IF.*")?, t, None, &mut to_clear)?;
    device::apply_clears(&mut ctx.device_data, &to_clear);

    let decs = vec![Declaration {
        path: Path::parse("IF.[Name=wan0]")?,
        path_get: None,
        path_set: Some(InstanceBounds::exactly(1)),
        attr_get: None,
        attr_set: None,
        defer: false,
    }];
    run_declarations(&mut ctx, &decs, &HashSet::new())?;

    let sync = ctx.sync_state.as_ref().expect("sync state");
    let parent = ctx.device_data.paths.get(&Path::parse("IF")?).expect("IF");
    let planned = sync
        .instances_to_create
        .get(&parent)
        .expect("creation planned");
    assert_eq!(planned.len(), 1);
    let keys = planned.iter().next().expect("keys");
    assert_eq!(keys.get("Name").map(String::as_str), Some("wan0"));
    Ok(())
}

#[tokio::test]
async fn deferred_values_do_not_open_new_plan_entries() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    let t = ctx.timestamp;

    let mut to_clear = Vec::new();
    device::set(
        &mut ctx.device_data,
        Path::parse("X")?,
        t,
        Some(Attributes {
            object: Some((t, false)),
            writable: Some((t, true)),
            value: Some((t, (Literal::String("a".into()), XsdType::String))),
            ..Default::default()
        }),
        &mut to_clear,
    )?;
    device::apply_clears(&mut ctx.device_data, &to_clear);

    let mut dec = declare_value("X", Literal::String("b".into()));
    dec.defer = true;
    run_declarations(&mut ctx, &[dec], &HashSet::new())?;

    let sync = ctx.sync_state.as_ref().expect("sync state");
    assert!(sync.spv.is_empty(), "deferred attrSet must not plan an SPV");
    Ok(())
}
