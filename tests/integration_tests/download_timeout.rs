// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use cwmp_session_rs::{
    models::{
        cpe::TransferCompleteRequest,
        fault::FaultStruct,
        value::{Literal, XsdType},
    },
    session::{self, DownloadArgs, Operation},
};

use crate::integration_tests::common::{
    basic_inform, new_session, seed_leaf, seed_object, services, services_with_config,
    stored_value,
};

fn pending_download(ctx: &mut cwmp_session_rs::SessionContext) -> Result<()> {
    seed_object(ctx, "Downloads", true)?;
    seed_object(ctx, "Downloads.1", true)?;
    seed_leaf(
        ctx,
        "Downloads.1.Download",
        (Literal::Number(ctx.timestamp), XsdType::DateTime),
        true,
    )?;
    seed_leaf(
        ctx,
        "Downloads.1.LastDownload",
        (Literal::Number(1000), XsdType::DateTime),
        true,
    )?;

    ctx.operations.insert(
        "key-1".to_string(),
        Operation {
            name: "Download".to_string(),
            timestamp: ctx.timestamp,
            channels: ctx.channels.clone(),
            args: DownloadArgs {
                instance: "Downloads.1".to_string(),
                file_type: "1 Firmware Upgrade Image".to_string(),
                file_name: "fw.bin".to_string(),
                target_file_name: String::new(),
            },
        },
    );
    Ok(())
}

#[tokio::test]
async fn expired_download_faults_and_reverts() -> Result<()> {
    let services = services_with_config(&[("cwmp.downloadTimeout", "60")]);
    let mut ctx = new_session(&services).await;
    session::inform(&mut ctx, &basic_inform())?;
    pending_download(&mut ctx)?;

    // Advance the session clock past the deadline.
    ctx.timestamp += 60 * 1000 + 1;

    let faults = session::timeout_operations(&mut ctx)?;
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].0.code, "timeout");
    assert!(ctx.operations.is_empty());
    assert!(ctx.operations_touched.contains("key-1"));
    assert_eq!(
        stored_value(&ctx, "Downloads.1.Download"),
        Some((Literal::Number(1000), XsdType::DateTime)),
        "the trigger reverts to the last completed download"
    );
    Ok(())
}

#[tokio::test]
async fn timeout_can_synthesize_success() -> Result<()> {
    let services = services_with_config(&[
        ("cwmp.downloadTimeout", "60"),
        ("cwmp.downloadSuccessOnTimeout", "true"),
    ]);
    let mut ctx = new_session(&services).await;
    session::inform(&mut ctx, &basic_inform())?;
    pending_download(&mut ctx)?;

    ctx.timestamp += 60 * 1000 + 1;

    let faults = session::timeout_operations(&mut ctx)?;
    assert!(faults.is_empty());
    assert!(ctx.operations.is_empty());
    assert_eq!(
        stored_value(&ctx, "Downloads.1.LastFileName"),
        Some((Literal::String("fw.bin".into()), XsdType::String))
    );
    Ok(())
}

#[tokio::test]
async fn failed_transfer_reverts_and_surfaces_cwmp_fault() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    session::inform(&mut ctx, &basic_inform())?;
    pending_download(&mut ctx)?;

    let outcome = session::transfer_complete(
        &mut ctx,
        &TransferCompleteRequest {
            command_key: "key-1".to_string(),
            fault_struct: Some(FaultStruct {
                fault_code: "9010".to_string(),
                fault_string: "Download failure".to_string(),
            }),
            start_time: None,
            complete_time: None,
        },
    )?;

    let fault = outcome.fault.expect("fault surfaced");
    assert_eq!(fault.code, "cwmp.9010");
    assert!(ctx.operations.is_empty());
    assert_eq!(
        stored_value(&ctx, "Downloads.1.Download"),
        Some((Literal::Number(1000), XsdType::DateTime))
    );
    Ok(())
}

#[tokio::test]
async fn unknown_transfer_is_acknowledged() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;
    session::inform(&mut ctx, &basic_inform())?;

    let outcome = session::transfer_complete(
        &mut ctx,
        &TransferCompleteRequest {
            command_key: "never-seen".to_string(),
            fault_struct: None,
            start_time: None,
            complete_time: None,
        },
    )?;
    assert!(outcome.fault.is_none());
    assert!(outcome.operation.is_none());
    Ok(())
}
