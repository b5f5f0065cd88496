// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde::{Deserialize, Serialize};

use crate::models::{
    acs::{AcsRequest, RpcMethod},
    fault::FaultStruct,
    value::{Literal, XsdType},
};

/// `DeviceIdStruct` of an Inform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdStruct {
    pub manufacturer: String,
    pub oui: String,
    pub product_class: String,
    pub serial_number: String,
}

/// Inbound Inform request, already decoded by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformRequest {
    pub device_id: DeviceIdStruct,
    /// Raw event codes, e.g. `"0 BOOTSTRAP"`.
    pub event: Vec<String>,
    pub parameter_list: Vec<(String, Literal, XsdType)>,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InformResponse {
    pub max_envelopes: u32,
}

/// Inbound TransferComplete request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferCompleteRequest {
    pub command_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_struct: Option<FaultStruct>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransferCompleteResponse {}

/// One entry of a GetParameterNames reply. Objectness is derived from the
/// trailing dot by the wire codec before the entry reaches the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub name: String,
    pub object: bool,
    pub writable: bool,
}

/// One entry of a GetParameterAttributes reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterAttribute {
    pub name: String,
    pub notification: u8,
    pub access_list: Vec<String>,
}

/// CPE replies to ACS requests, already decoded by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CpeResponse {
    GetParameterNamesResponse {
        parameter_list: Vec<ParameterInfo>,
    },
    GetParameterValuesResponse {
        parameter_list: Vec<(String, Literal, XsdType)>,
    },
    GetParameterAttributesResponse {
        parameter_list: Vec<ParameterAttribute>,
    },
    SetParameterValuesResponse {
        status: u32,
    },
    SetParameterAttributesResponse,
    AddObjectResponse {
        instance_number: u64,
        status: u32,
    },
    DeleteObjectResponse {
        status: u32,
    },
    DownloadResponse {
        status: u32,
        start_time: Option<i64>,
        complete_time: Option<i64>,
    },
    RebootResponse,
    FactoryResetResponse,
}

impl CpeResponse {
    pub fn method_name(&self) -> &'static str {
        match self {
            CpeResponse::GetParameterNamesResponse { .. } => "GetParameterNames",
            CpeResponse::GetParameterValuesResponse { .. } => "GetParameterValues",
            CpeResponse::GetParameterAttributesResponse { .. } => {
                "GetParameterAttributes"
            },
            CpeResponse::SetParameterValuesResponse { .. } => "SetParameterValues",
            CpeResponse::SetParameterAttributesResponse => "SetParameterAttributes",
            CpeResponse::AddObjectResponse { .. } => "AddObject",
            CpeResponse::DeleteObjectResponse { .. } => "DeleteObject",
            CpeResponse::DownloadResponse { .. } => "Download",
            CpeResponse::RebootResponse => "Reboot",
            CpeResponse::FactoryResetResponse => "FactoryReset",
        }
    }

    /// True when this reply answers `request`.
    pub fn answers(&self, request: &AcsRequest) -> bool {
        self.method_name() == request.method_name()
    }
}

/// A CWMP fault envelope returned by the CPE in place of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpeFault {
    pub fault_code: String,
    pub fault_string: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<FaultStruct>,
}

impl CpeFault {
    /// The CWMP fault code, preferring the detail structure when present.
    pub fn code(&self) -> &str {
        self.detail
            .as_ref()
            .map_or(self.fault_code.as_str(), |d| d.fault_code.as_str())
    }

    pub fn message(&self) -> &str {
        self.detail
            .as_ref()
            .map_or(self.fault_string.as_str(), |d| d.fault_string.as_str())
    }
}
