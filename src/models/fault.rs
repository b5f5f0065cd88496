// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inner CWMP fault structure as reported by a CPE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultStruct {
    pub fault_code: String,
    pub fault_string: String,
}

/// A session fault surfaced to the host.
///
/// The `code` strings are part of the engine's contract and are matched
/// verbatim by the host: `cwmp.<nnnn>`, `script.<ErrorName>`, `script`,
/// `timeout`, `invalid_response`, `too_many_rpcs`, `deeply_nested_vparams`,
/// `too_many_cycles`, `too_many_commits`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Fault {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<FaultStruct>,
    pub timestamp: i64,
}

impl Fault {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
            timestamp: 0,
        }
    }

    /// Fault raised for a CPE-reported CWMP fault code.
    pub fn cwmp(detail: FaultStruct, timestamp: i64) -> Self {
        Self {
            code: format!("cwmp.{}", detail.fault_code),
            message: detail.fault_string.clone(),
            detail: Some(detail),
            timestamp,
        }
    }

    /// Fault raised when a sandboxed script threw.
    pub fn script_error(error_name: &str, message: impl Into<String>) -> Self {
        Self::new(format!("script.{error_name}"), message)
    }

    /// Fault raised when a virtual parameter returned an invalid shape.
    pub fn script_invalid(message: impl Into<String>) -> Self {
        Self::new("script", message)
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}
