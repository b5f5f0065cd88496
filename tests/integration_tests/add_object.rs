// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use cwmp_session_rs::{
    models::{
        acs::{AcsRequest, NextAction},
        cpe::CpeResponse,
        value::{Literal, XsdType},
    },
    path::Path,
    session::{
        self,
        declaration::{Declaration, InstanceBounds},
    },
};

use crate::integration_tests::common::{
    basic_inform, expect_done, new_session, respond, seed_enumeration, seed_object,
    services, stored_value,
};

fn keyed_instance_declaration() -> Declaration {
    Declaration {
        path: Path::parse("IF.[Name=wan0]").expect("path"),
        path_get: None,
        path_set: Some(InstanceBounds::exactly(1)),
        attr_get: None,
        attr_set: None,
        defer: false,
    }
}

async fn request_with(
    services: &cwmp_session_rs::Services,
    ctx: &mut cwmp_session_rs::SessionContext,
    declarations: Option<Vec<Declaration>>,
) -> Result<(String, AcsRequest)> {
    match session::rpc_request(services, ctx, declarations).await? {
        session::driver::DriverResult::Request { rpc_id, request } => {
            Ok((rpc_id, request))
        },
        other => anyhow::bail!("expected a request, got {other:?}"),
    }
}

#[tokio::test]
async fn add_object_enforces_declared_keys() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    session::inform(&mut ctx, &basic_inform())?;
    seed_object(&mut ctx, "IF", true)?;
    seed_enumeration(&mut ctx, "IF.*")?;

    // The keyed instance does not exist, so one gets created.
    let (rpc_id, request) =
        request_with(&services, &mut ctx, Some(vec![keyed_instance_declaration()]))
            .await?;
    match &request {
        AcsRequest::AddObject(add) => {
            assert_eq!(add.object_name, "IF.");
            assert_eq!(
                add.instance_values,
                vec![("Name".to_string(), "wan0".to_string())]
            );
            assert_eq!(add.next, Some(NextAction::GetInstanceKeys));
        },
        other => panic!("expected AddObject, got {other:?}"),
    }

    respond(
        &mut ctx,
        &rpc_id,
        CpeResponse::AddObjectResponse {
            instance_number: 3,
            status: 0,
        },
    )?;

    // The engine reads the key back before trusting it.
    let (rpc_id, request) = request_with(&services, &mut ctx, None).await?;
    match &request {
        AcsRequest::GetParameterValues(gpv) => {
            assert_eq!(gpv.parameter_names, vec!["IF.3.Name".to_string()]);
            assert!(matches!(gpv.next, Some(NextAction::SetInstanceKeys { .. })));
        },
        other => panic!("expected GetParameterValues, got {other:?}"),
    }

    // The device chose a different name; the engine corrects it.
    respond(
        &mut ctx,
        &rpc_id,
        CpeResponse::GetParameterValuesResponse {
            parameter_list: vec![(
                "IF.3.Name".to_string(),
                Literal::String("other".into()),
                XsdType::String,
            )],
        },
    )?;

    let (rpc_id, request) = request_with(&services, &mut ctx, None).await?;
    match &request {
        AcsRequest::SetParameterValues(spv) => {
            assert_eq!(
                spv.parameter_list,
                vec![(
                    "IF.3.Name".to_string(),
                    Literal::String("wan0".into()),
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
        stored_value(&ctx, "IF.3.Name"),
        Some((Literal::String("wan0".into()), XsdType::String))
    );
    Ok(())
}
