// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use cwmp_session_rs::session::{Provision, add_provisions, clear_provisions};
use serde_json::json;

use crate::unit_tests::{new_session, services};

fn refresh_provision(path: &str) -> Provision {
    Provision::new("refresh", vec![json!(path)])
}

#[tokio::test]
async fn duplicate_provisions_share_a_slot() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;

    add_provisions(&mut ctx, "default", &[refresh_provision("Device.")]);
    let first = (ctx.provisions.clone(), ctx.channels.clone());

    add_provisions(&mut ctx, "default", &[refresh_provision("Device.")]);
    assert_eq!(ctx.provisions, first.0);
    assert_eq!(ctx.channels, first.1);

    // A second channel installing the same provision joins the same slot.
    add_provisions(&mut ctx, "bootstrap", &[refresh_provision("Device.")]);
    assert_eq!(ctx.provisions.len(), 1);
    assert_eq!(ctx.channels.get("default"), Some(&1));
    assert_eq!(ctx.channels.get("bootstrap"), Some(&1));
    Ok(())
}

#[tokio::test]
async fn channel_bitmaps_track_slots() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;

    add_provisions(
        &mut ctx,
        "default",
        &[refresh_provision("A."), refresh_provision("B.")],
    );
    add_provisions(&mut ctx, "inform", &[refresh_provision("B.")]);

    assert_eq!(ctx.provisions.len(), 2);
    assert_eq!(ctx.channels.get("default"), Some(&0b11));
    assert_eq!(ctx.channels.get("inform"), Some(&0b10));
    Ok(())
}

#[tokio::test]
async fn clear_provisions_leaves_nothing_behind() -> Result<()> {
    let services = services();
    let mut ctx = new_session(&services).await;

    add_provisions(&mut ctx, "default", &[refresh_provision("Device.")]);
    ctx.extensions_cache
        .insert("0:lookup".to_string(), json!("cached"));

    clear_provisions(&mut ctx);

    assert!(ctx.provisions.is_empty());
    assert!(ctx.channels.is_empty());
    assert!(ctx.declarations.is_empty());
    assert!(ctx.virtual_parameters.is_empty());
    assert!(ctx.extensions_cache.is_empty());
    assert_eq!(ctx.revisions, vec![0]);
    Ok(())
}
