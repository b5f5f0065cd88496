// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use cwmp_session_rs::{
    models::value::{Literal, XsdType},
    session,
};

use crate::integration_tests::common::{
    basic_inform, expect_done, new_session, services, stored_value,
};

#[tokio::test]
async fn empty_inform_completes_without_rpcs() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;

    let response = session::inform(&mut ctx, &basic_inform())?;
    assert_eq!(response.max_envelopes, 1);

    expect_done(&services, &mut ctx).await?;

    assert_eq!(
        stored_value(&ctx, "DeviceID.Manufacturer"),
        Some((Literal::String("M".into()), XsdType::String))
    );
    assert_eq!(
        stored_value(&ctx, "Events.0_BOOTSTRAP"),
        Some((Literal::Number(ctx.timestamp), XsdType::DateTime))
    );
    assert_eq!(
        stored_value(&ctx, "Events.Inform"),
        Some((Literal::Number(ctx.timestamp), XsdType::DateTime))
    );
    Ok(())
}

#[tokio::test]
async fn new_session_registers_device() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    ctx.is_new = true;

    session::inform(&mut ctx, &basic_inform())?;
    expect_done(&services, &mut ctx).await?;

    assert_eq!(
        stored_value(&ctx, "DeviceID.ID"),
        Some((Literal::String("test-device".into()), XsdType::String))
    );
    assert!(stored_value(&ctx, "Events.Registered").is_some());
    Ok(())
}
