// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::models::value::{Literal, XsdType};

/// Common surface of every ACS-to-CPE request the planner can emit.
///
/// Only the payload shape is modeled here; XML envelope encoding is the
/// transport's concern.
#[enum_dispatch]
pub trait RpcMethod {
    /// The CWMP method name carried in the envelope.
    fn method_name(&self) -> &'static str;
}

/// Continuation attached to a request so the response handler knows how to
/// carry a multi-RPC sequence forward (the AddObject → read keys → fix keys
/// chain).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NextAction {
    /// After AddObject: read the alias key parameters of the new instance.
    GetInstanceKeys,
    /// After the key read: set the keys that did not come back as declared.
    SetInstanceKeys {
        expected: Vec<(String, Literal)>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetParameterNames {
    /// Partial path (with trailing dot) or empty string for the root.
    pub parameter_path: String,
    pub next_level: bool,
}

impl RpcMethod for GetParameterNames {
    fn method_name(&self) -> &'static str {
        "GetParameterNames"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetParameterValues {
    pub parameter_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<NextAction>,
}

impl RpcMethod for GetParameterValues {
    fn method_name(&self) -> &'static str {
        "GetParameterValues"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetParameterAttributes {
    pub parameter_names: Vec<String>,
}

impl RpcMethod for GetParameterAttributes {
    fn method_name(&self) -> &'static str {
        "GetParameterAttributes"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetParameterValues {
    pub parameter_list: Vec<(String, Literal, XsdType)>,
    /// Keep milliseconds when formatting xsd:dateTime values.
    pub datetime_milliseconds: bool,
    /// Emit booleans as `true`/`false` rather than `1`/`0`.
    pub boolean_literal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<NextAction>,
}

impl RpcMethod for SetParameterValues {
    fn method_name(&self) -> &'static str {
        "SetParameterValues"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetAttributesEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_list: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetParameterAttributes {
    pub parameter_list: Vec<SetAttributesEntry>,
}

impl RpcMethod for SetParameterAttributes {
    fn method_name(&self) -> &'static str {
        "SetParameterAttributes"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddObject {
    /// Parent object path with trailing dot.
    pub object_name: String,
    /// Alias key values the new instance must carry (relative key path →
    /// declared value).
    pub instance_values: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<NextAction>,
}

impl RpcMethod for AddObject {
    fn method_name(&self) -> &'static str {
        "AddObject"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteObject {
    /// Instance path with trailing dot.
    pub object_name: String,
}

impl RpcMethod for DeleteObject {
    fn method_name(&self) -> &'static str {
        "DeleteObject"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Download {
    pub command_key: String,
    /// The `Downloads.{i}` instance this download was declared on.
    pub instance: String,
    pub file_type: String,
    pub file_name: String,
    pub target_file_name: String,
}

impl RpcMethod for Download {
    fn method_name(&self) -> &'static str {
        "Download"
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Reboot {}

impl RpcMethod for Reboot {
    fn method_name(&self) -> &'static str {
        "Reboot"
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FactoryReset {}

impl RpcMethod for FactoryReset {
    fn method_name(&self) -> &'static str {
        "FactoryReset"
    }
}

/// The full request vocabulary the session driver can hand to the transport.
#[enum_dispatch(RpcMethod)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AcsRequest {
    GetParameterNames,
    GetParameterValues,
    GetParameterAttributes,
    SetParameterValues,
    SetParameterAttributes,
    AddObject,
    DeleteObject,
    Download,
    Reboot,
    FactoryReset,
}