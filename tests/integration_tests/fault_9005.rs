// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use cwmp_session_rs::{
    device,
    models::{
        acs::AcsRequest,
        attributes::Attributes,
        cpe::{CpeFault, CpeResponse},
        fault::FaultStruct,
    },
    path::Path,
    session::{self, declaration::Declaration, driver::DriverResult},
};

use crate::integration_tests::common::{
    basic_inform, expect_done, new_session, respond, seed_object, services,
};

fn seed_bare_leaf(ctx: &mut cwmp_session_rs::SessionContext, path: &str) -> Result<()> {
    let t = ctx.timestamp;
    let mut to_clear = Vec::new();
    device::set(
        &mut ctx.device_data,
        Path::parse(path)?,
        t,
        Some(Attributes {
            object: Some((t, false)),
            writable: Some((t, false)),
            ..Default::default()
        }),
        &mut to_clear,
    )?;
    device::apply_clears(&mut ctx.device_data, &to_clear);
    Ok(())
}

#[tokio::test]
async fn fault_9005_invalidates_and_recovers() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    session::inform(&mut ctx, &basic_inform())?;
    seed_object(&mut ctx, "Foo", false)?;
    seed_bare_leaf(&mut ctx, "Foo.Bar")?;

    let declarations = vec![Declaration::value_get(
        Path::parse("Foo.Bar")?,
        ctx.timestamp,
    )];
    let (rpc_id, request) =
        match session::rpc_request(&services, &mut ctx, Some(declarations)).await? {
            DriverResult::Request { rpc_id, request } => (rpc_id, request),
            other => panic!("expected a request, got {other:?}"),
        };
    match &request {
        AcsRequest::GetParameterValues(gpv) => {
            assert_eq!(gpv.parameter_names, vec!["Foo.Bar".to_string()]);
        },
        other => panic!("expected GetParameterValues, got {other:?}"),
    }

    // The CPE rejects the name; the engine recovers locally.
    let fault = session::rpc_fault(
        &mut ctx,
        &rpc_id,
        &CpeFault {
            fault_code: "Client".to_string(),
            fault_string: "CWMP fault".to_string(),
            detail: Some(FaultStruct {
                fault_code: "9005".to_string(),
                fault_string: "Invalid parameter name".to_string(),
            }),
        },
    )?;
    assert!(fault.is_none(), "9005 is recoverable");

    let gone = ctx
        .device_data
        .paths
        .get(&Path::parse("Foo.Bar")?)
        .expect("still interned");
    assert!(
        !ctx.device_data.attributes.has(&gone),
        "the faulted parameter is invalidated"
    );

    // The planner re-verifies through the parent listing, learns the
    // parameter is gone, and completes.
    let (rpc_id, request) = match session::rpc_request(&services, &mut ctx, None).await? {
        DriverResult::Request { rpc_id, request } => (rpc_id, request),
        other => panic!("expected a replanned request, got {other:?}"),
    };
    match &request {
        AcsRequest::GetParameterNames(gpn) => {
            assert_eq!(gpn.parameter_path, "Foo.");
        },
        other => panic!("expected GetParameterNames, got {other:?}"),
    }
    respond(
        &mut ctx,
        &rpc_id,
        CpeResponse::GetParameterNamesResponse {
            parameter_list: Vec::new(),
        },
    )?;

    expect_done(&services, &mut ctx).await?;
    Ok(())
}

#[tokio::test]
async fn other_faults_surface_with_cwmp_prefix() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    session::inform(&mut ctx, &basic_inform())?;
    seed_object(&mut ctx, "Foo", false)?;
    seed_bare_leaf(&mut ctx, "Foo.Bar")?;

    let declarations = vec![Declaration::value_get(
        Path::parse("Foo.Bar")?,
        ctx.timestamp,
    )];
    let (rpc_id, _) =
        match session::rpc_request(&services, &mut ctx, Some(declarations)).await? {
            DriverResult::Request { rpc_id, request } => (rpc_id, request),
            other => panic!("expected a request, got {other:?}"),
        };

    let fault = session::rpc_fault(
        &mut ctx,
        &rpc_id,
        &CpeFault {
            fault_code: "Server".to_string(),
            fault_string: "CWMP fault".to_string(),
            detail: Some(FaultStruct {
                fault_code: "9002".to_string(),
                fault_string: "Internal error".to_string(),
            }),
        },
    )?
    .expect("fault surfaces");
    assert_eq!(fault.code, "cwmp.9002");
    assert_eq!(fault.message, "Internal error");
    Ok(())
}

#[tokio::test]
async fn mismatched_rpc_id_is_rejected() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    session::inform(&mut ctx, &basic_inform())?;
    seed_object(&mut ctx, "Foo", false)?;
    seed_bare_leaf(&mut ctx, "Foo.Bar")?;

    let declarations = vec![Declaration::value_get(
        Path::parse("Foo.Bar")?,
        ctx.timestamp,
    )];
    let _ = session::rpc_request(&services, &mut ctx, Some(declarations)).await?;

    let fault = session::rpc_response(
        &mut ctx,
        "deadbeef0000",
        &CpeResponse::GetParameterValuesResponse {
            parameter_list: Vec::new(),
        },
    )?
    .expect("mismatch is a fault");
    assert_eq!(fault.code, "invalid_response");
    Ok(())
}
