// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use cwmp_session_rs::{
    models::{
        acs::AcsRequest,
        cpe::CpeResponse,
        value::{Literal, XsdType},
    },
    session::{self, Provision},
};
use serde_json::json;

use crate::integration_tests::common::{
    basic_inform, expect_done, expect_request, new_session, respond, seed_leaf,
    seed_object, services, stored_value,
};

const VERSION: &str = "Device.Config.Version";

fn value_provision(value: &str) -> Provision {
    Provision::new("value", vec![json!(VERSION), json!(value)])
}

#[tokio::test]
async fn matching_value_emits_no_spv() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    session::inform(&mut ctx, &basic_inform())?;
    seed_object(&mut ctx, "Device", false)?;
    seed_object(&mut ctx, "Device.Config", false)?;
    seed_leaf(
        &mut ctx,
        VERSION,
        (Literal::String("1.0".into()), XsdType::String),
        true,
    )?;

    session::add_provisions(&mut ctx, "default", &[value_provision("1.0")]);
    expect_done(&services, &mut ctx).await?;
    Ok(())
}

#[tokio::test]
async fn differing_value_converges_once() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    session::inform(&mut ctx, &basic_inform())?;
    seed_object(&mut ctx, "Device", false)?;
    seed_object(&mut ctx, "Device.Config", false)?;
    seed_leaf(
        &mut ctx,
        VERSION,
        (Literal::String("1.0".into()), XsdType::String),
        true,
    )?;

    session::add_provisions(&mut ctx, "default", &[value_provision("1.1")]);

    let (rpc_id, request) = expect_request(&services, &mut ctx).await?;
    match &request {
        AcsRequest::SetParameterValues(spv) => {
            assert_eq!(
                spv.parameter_list,
                vec![(
                    VERSION.to_string(),
                    Literal::String("1.1".into()),
                    XsdType::String
                )]
            );
        },
        other => panic!("expected SetParameterValues, got {other:?}"),
    }
    respond(
        &mut ctx,
        &rpc_id,
        CpeResponse::SetParameterValuesResponse { status: 0 },
    )?;
    expect_done(&services, &mut ctx).await?;
    assert_eq!(
        stored_value(&ctx, VERSION),
        Some((Literal::String("1.1".into()), XsdType::String))
    );

    // Re-installing the same provision finds the device converged.
    session::add_provisions(&mut ctx, "default", &[value_provision("1.1")]);
    expect_done(&services, &mut ctx).await?;
    Ok(())
}
