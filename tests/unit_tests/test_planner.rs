// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashSet;

use anyhow::Result;
use cwmp_session_rs::{
    device,
    models::{
        acs::AcsRequest,
        attributes::{AttributeTimestamps, AttributeValues, Attributes},
        value::{Literal, XsdType},
    },
    path::Path,
    session::{
        SessionContext,
        declaration::Declaration,
        declarations::run_declarations,
        rpc_plan::{generate_get_rpc_request, generate_set_rpc_request},
    },
};

use crate::unit_tests::{new_session, services, services_with_config};

fn seed_leaf(
    ctx: &mut SessionContext,
    path: &str,
    value: &str,
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
            value: Some((t, (Literal::String(value.into()), XsdType::String))),
            ..Default::default()
        }),
        &mut to_clear,
    )?;
    device::apply_clears(&mut ctx.device_data, &to_clear);
    Ok(())
}

fn seed_object(ctx: &mut SessionContext, path: &str, writable: bool) -> Result<()> {
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

#[tokio::test]
async fn unknown_root_becomes_single_hop_gpn() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;

    let decs = vec![Declaration::value_get(
        Path::parse("InternetGatewayDevice.DeviceInfo.SoftwareVersion")?,
        ctx.timestamp,
    )];
    run_declarations(&mut ctx, &decs, &HashSet::new())?;

    let request = generate_get_rpc_request(&mut ctx)?.expect("a read is planned");
    match request {
        AcsRequest::GetParameterNames(gpn) => {
            assert_eq!(gpn.parameter_path, "InternetGatewayDevice.");
            assert!(gpn.next_level);
        },
        other => panic!("expected GetParameterNames, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn gpv_only_covers_known_stale_leaves_and_batches() -> Result<()> {
    let services = services_with_config(&[("cwmp.gpvBatchSize", "2")]);
    let mut ctx = new_session(&services).await;
    let t = ctx.timestamp;

    seed_object(&mut ctx, "D", false)?;
    for leaf in ["D.A", "D.B", "D.C"] {
        let mut to_clear = Vec::new();
        device::set(
            &mut ctx.device_data,
            Path::parse(leaf)?,
            t,
            Some(Attributes {
                object: Some((t, false)),
                writable: Some((t, true)),
                ..Default::default()
            }),
            &mut to_clear,
        )?;
        device::apply_clears(&mut ctx.device_data, &to_clear);
    }

    let decs = vec![Declaration {
        path: Path::parse("D.*")?,
        path_get: Some(1),
        path_set: None,
        attr_get: Some(AttributeTimestamps {
            value: Some(t),
            ..Default::default()
        }),
        attr_set: None,
        defer: false,
    }];
    run_declarations(&mut ctx, &decs, &HashSet::new())?;

    let request = generate_get_rpc_request(&mut ctx)?.expect("a read is planned");
    match request {
        AcsRequest::GetParameterValues(gpv) => {
            assert_eq!(gpv.parameter_names.len(), 2, "batch size caps the request");
            for name in &gpv.parameter_names {
                let p = ctx
                    .device_data
                    .paths
                    .get(&Path::parse(name)?)
                    .expect("interned");
                let attrs = ctx.device_data.attributes.get(&p).expect("known");
                assert_eq!(attrs.is_object(), Some(false));
            }
        },
        other => panic!("expected GetParameterValues, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn spv_skips_values_already_converged() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    seed_leaf(&mut ctx, "X.V", "1.0", true)?;
    seed_object(&mut ctx, "X", false)?;

    let decs = vec![Declaration {
        path: Path::parse("X.V")?,
        path_get: Some(1),
        path_set: None,
        attr_get: None,
        attr_set: Some(AttributeValues {
            value: Some(Literal::String("1.0".into())),
            ..Default::default()
        }),
        defer: false,
    }];
    run_declarations(&mut ctx, &decs, &HashSet::new())?;

    assert!(generate_set_rpc_request(&mut ctx)?.is_none(), "no-op SPV suppressed");

    ctx.sync_state = None;
    let decs = vec![Declaration {
        path: Path::parse("X.V")?,
        path_get: Some(1),
        path_set: None,
        attr_get: None,
        attr_set: Some(AttributeValues {
            value: Some(Literal::String("1.1".into())),
            ..Default::default()
        }),
        defer: false,
    }];
    run_declarations(&mut ctx, &decs, &HashSet::new())?;

    let request = generate_set_rpc_request(&mut ctx)?.expect("SPV planned");
    match request {
        AcsRequest::SetParameterValues(spv) => {
            assert_eq!(
                spv.parameter_list,
                vec![(
                    "X.V".to_string(),
                    Literal::String("1.1".into()),
                    XsdType::String
                )]
            );
        },
        other => panic!("expected SetParameterValues, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn spv_respects_writability_unless_configured() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    seed_leaf(&mut ctx, "Y.V", "a", false)?;
    seed_object(&mut ctx, "Y", false)?;

    let decs = vec![Declaration {
        path: Path::parse("Y.V")?,
        path_get: Some(1),
        path_set: None,
        attr_get: None,
        attr_set: Some(AttributeValues {
            value: Some(Literal::String("b".into())),
            ..Default::default()
        }),
        defer: false,
    }];
    run_declarations(&mut ctx, &decs, &HashSet::new())?;
    assert!(
        generate_set_rpc_request(&mut ctx)?.is_none(),
        "read-only parameter must not be set"
    );

    ctx.config.skip_writable_check = true;
    let request = generate_set_rpc_request(&mut ctx)?;
    assert!(
        matches!(request, Some(AcsRequest::SetParameterValues(_))),
        "skipWritableCheck bypasses the guard"
    );
    Ok(())
}

#[tokio::test]
async fn delete_object_requires_writable_instance() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    let t = ctx.timestamp;

    seed_object(&mut ctx, "IF", true)?;
    seed_object(&mut ctx, "IF.1", false)?;
    seed_object(&mut ctx, "IF.2", true)?;
    let mut to_clear = Vec::new();
    device::set(&mut ctx.device_data, Path::parse("IF.*")?, t, None, &mut to_clear)?;
    device::apply_clears(&mut ctx.device_data, &to_clear);

    let decs = vec![Declaration {
        path: Path::parse("IF.*")?,
        path_get: None,
        path_set: Some(cwmp_session_rs::session::declaration::InstanceBounds::range(
            0, 1,
        )),
        attr_get: None,
        attr_set: None,
        defer: false,
    }];
    run_declarations(&mut ctx, &decs, &HashSet::new())?;

    let request = generate_set_rpc_request(&mut ctx)?.expect("a delete is planned");
    match request {
        AcsRequest::DeleteObject(del) => {
            assert_eq!(del.object_name, "IF.2.", "only the writable instance goes");
        },
        other => panic!("expected DeleteObject, got {other:?}"),
    }
    Ok(())
}
