// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod cache;
pub mod cfg;
pub mod device;
pub mod models;
pub mod path;
pub mod sandbox;
pub mod session;
pub mod utils;

pub use session::{
    SessionContext, Services, init,
    driver::{DriverResult, rpc_fault, rpc_request, rpc_response},
    lifecycle::{
        add_provisions, clear_provisions, inform, timeout_operations,
        transfer_complete,
    },
    serialize::{deserialize, serialize},
};
