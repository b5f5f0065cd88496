// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use cwmp_session_rs::{
    models::{
        acs::AcsRequest,
        cpe::{CpeResponse, ParameterInfo},
        value::{Literal, XsdType},
    },
    session::{self, Provision},
};
use serde_json::json;

use crate::integration_tests::common::{
    basic_inform, expect_done, expect_request, new_session, respond, services,
    stored_value,
};

const SOFTWARE_VERSION: &str = "InternetGatewayDevice.DeviceInfo.SoftwareVersion";

#[tokio::test]
async fn refresh_discovers_then_reads() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    session::inform(&mut ctx, &basic_inform())?;

    session::add_provisions(
        &mut ctx,
        "default",
        &[Provision::new("refresh", vec![json!(SOFTWARE_VERSION)])],
    );

    // Discovery starts at the deepest undiscovered ancestor.
    let (rpc_id, request) = expect_request(&services, &mut ctx).await?;
    match &request {
        AcsRequest::GetParameterNames(gpn) => {
            assert_eq!(gpn.parameter_path, "InternetGatewayDevice.");
            assert!(gpn.next_level);
        },
        other => panic!("expected GetParameterNames, got {other:?}"),
    }

    respond(
        &mut ctx,
        &rpc_id,
        CpeResponse::GetParameterNamesResponse {
            parameter_list: vec![
                ParameterInfo {
                    name: "InternetGatewayDevice".into(),
                    object: true,
                    writable: false,
                },
                ParameterInfo {
                    name: "InternetGatewayDevice.DeviceInfo".into(),
                    object: true,
                    writable: false,
                },
                ParameterInfo {
                    name: SOFTWARE_VERSION.into(),
                    object: false,
                    writable: false,
                },
            ],
        },
    )?;

    // The discovered leaf is read next.
    let (rpc_id, request) = expect_request(&services, &mut ctx).await?;
    match &request {
        AcsRequest::GetParameterValues(gpv) => {
            assert_eq!(gpv.parameter_names, vec![SOFTWARE_VERSION.to_string()]);
        },
        other => panic!("expected GetParameterValues, got {other:?}"),
    }

    respond(
        &mut ctx,
        &rpc_id,
        CpeResponse::GetParameterValuesResponse {
            parameter_list: vec![(
                SOFTWARE_VERSION.to_string(),
                Literal::String("1.2.3".into()),
                XsdType::String,
            )],
        },
    )?;

    expect_done(&services, &mut ctx).await?;
    assert_eq!(
        stored_value(&ctx, SOFTWARE_VERSION),
        Some((Literal::String("1.2.3".into()), XsdType::String))
    );
    Ok(())
}

#[tokio::test]
async fn rerunning_a_satisfied_refresh_is_quiet() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    session::inform(&mut ctx, &basic_inform())?;

    session::add_provisions(
        &mut ctx,
        "default",
        &[Provision::new("refresh", vec![json!(SOFTWARE_VERSION)])],
    );

    let (rpc_id, _) = expect_request(&services, &mut ctx).await?;
    respond(
        &mut ctx,
        &rpc_id,
        CpeResponse::GetParameterNamesResponse {
            parameter_list: vec![
                ParameterInfo {
                    name: "InternetGatewayDevice".into(),
                    object: true,
                    writable: false,
                },
                ParameterInfo {
                    name: "InternetGatewayDevice.DeviceInfo".into(),
                    object: true,
                    writable: false,
                },
                ParameterInfo {
                    name: SOFTWARE_VERSION.into(),
                    object: false,
                    writable: false,
                },
            ],
        },
    )?;
    let (rpc_id, _) = expect_request(&services, &mut ctx).await?;
    respond(
        &mut ctx,
        &rpc_id,
        CpeResponse::GetParameterValuesResponse {
            parameter_list: vec![(
                SOFTWARE_VERSION.to_string(),
                Literal::String("1.2.3".into()),
                XsdType::String,
            )],
        },
    )?;
    expect_done(&services, &mut ctx).await?;

    // The same declarations against fresh data plan nothing new.
    expect_done(&services, &mut ctx).await?;
    Ok(())
}
