// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use anyhow::{Result, bail};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Scalar parameter literal as carried on the wire and in the data model.
///
/// `xsd:dateTime` values travel as epoch milliseconds (`Number`) inside the
/// engine and are only formatted at the RPC boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Number(i64),
    String(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Number(n) => write!(f, "{n}"),
            Literal::String(s) => f.write_str(s),
        }
    }
}

/// The XSD types a CPE parameter may carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum XsdType {
    String,
    Int,
    UnsignedInt,
    Boolean,
    DateTime,
    Base64,
    HexBinary,
    /// A type string reported by a CPE that the engine does not interpret;
    /// preserved verbatim so it round-trips.
    Other(String),
}

impl XsdType {
    /// Parses a type string. Both `xsd:dateTime` and the lower-case spelling
    /// some scripts produce map to [`XsdType::DateTime`].
    pub fn parse(s: &str) -> Self {
        match s {
            "xsd:string" => XsdType::String,
            "xsd:int" => XsdType::Int,
            "xsd:unsignedInt" => XsdType::UnsignedInt,
            "xsd:boolean" => XsdType::Boolean,
            "xsd:dateTime" => XsdType::DateTime,
            "xsd:datetime" => {
                warn!("lower-case xsd:datetime seen, treating as xsd:dateTime");
                XsdType::DateTime
            },
            "xsd:base64" => XsdType::Base64,
            "xsd:hexBinary" => XsdType::HexBinary,
            other => XsdType::Other(other.to_string()),
        }
    }

    /// True for the closed set of types a virtual parameter may return.
    pub fn is_known(&self) -> bool {
        !matches!(self, XsdType::Other(_))
    }
}

impl fmt::Display for XsdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            XsdType::String => "xsd:string",
            XsdType::Int => "xsd:int",
            XsdType::UnsignedInt => "xsd:unsignedInt",
            XsdType::Boolean => "xsd:boolean",
            XsdType::DateTime => "xsd:dateTime",
            XsdType::Base64 => "xsd:base64",
            XsdType::HexBinary => "xsd:hexBinary",
            XsdType::Other(o) => o,
        };
        f.write_str(s)
    }
}

/// `(literal, xsdType)` pair as stored under the `value` attribute.
pub type ParameterValue = (Literal, XsdType);

/// Coerces `value` to `target` type, rejecting mismatches instead of
/// stringifying them.
///
/// This is the single place where declared values are reconciled with the
/// type the device reported for a parameter, so a provision may declare
/// `"1"` against an `xsd:int` parameter and still produce a well-typed SPV.
pub fn sanitize_parameter_value(
    value: &Literal,
    target: &XsdType,
) -> Result<ParameterValue> {
    let coerced = match target {
        XsdType::Boolean => match value {
            Literal::Bool(b) => Literal::Bool(*b),
            Literal::Number(0) => Literal::Bool(false),
            Literal::Number(1) => Literal::Bool(true),
            Literal::String(s) => match s.as_str() {
                "true" | "1" => Literal::Bool(true),
                "false" | "0" => Literal::Bool(false),
                _ => bail!("cannot coerce {s:?} to xsd:boolean"),
            },
            Literal::Number(n) => bail!("cannot coerce {n} to xsd:boolean"),
        },
        XsdType::Int => match value {
            Literal::Number(n) => Literal::Number(*n),
            Literal::String(s) => Literal::Number(
                s.trim()
                    .parse::<i64>()
                    .map_err(|_| anyhow::anyhow!("cannot coerce {s:?} to xsd:int"))?,
            ),
            Literal::Bool(b) => bail!("cannot coerce {b} to xsd:int"),
        },
        XsdType::UnsignedInt => match value {
            Literal::Number(n) if *n >= 0 => Literal::Number(*n),
            Literal::Number(n) => bail!("cannot coerce {n} to xsd:unsignedInt"),
            Literal::String(s) => {
                let n = s.trim().parse::<u64>().map_err(|_| {
                    anyhow::anyhow!("cannot coerce {s:?} to xsd:unsignedInt")
                })?;
                Literal::Number(i64::try_from(n)?)
            },
            Literal::Bool(b) => bail!("cannot coerce {b} to xsd:unsignedInt"),
        },
        XsdType::DateTime => match value {
            Literal::Number(ms) => Literal::Number(*ms),
            Literal::String(s) => Literal::Number(parse_datetime_ms(s)?),
            Literal::Bool(b) => bail!("cannot coerce {b} to xsd:dateTime"),
        },
        XsdType::String | XsdType::Base64 | XsdType::HexBinary => match value {
            Literal::String(s) => Literal::String(s.clone()),
            other => bail!("cannot coerce {other} to {target}"),
        },
        XsdType::Other(t) => match value {
            Literal::String(s) => Literal::String(s.clone()),
            other => bail!("cannot coerce {other} to unrecognized type {t}"),
        },
    };
    Ok((coerced, target.clone()))
}

/// Parses an RFC 3339 / ISO 8601 date string into epoch milliseconds.
pub fn parse_datetime_ms(s: &str) -> Result<i64> {
    let dt = DateTime::parse_from_rfc3339(s)
        .map_err(|e| anyhow::anyhow!("cannot parse {s:?} as xsd:dateTime: {e}"))?;
    Ok(dt.with_timezone(&Utc).timestamp_millis())
}

/// Formats epoch milliseconds as the RFC 3339 string carried on the wire.
/// Milliseconds are stripped unless `keep_millis` is set.
pub fn format_datetime_ms(ms: i64, keep_millis: bool) -> String {
    let dt = Utc
        .timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    if keep_millis {
        dt.to_rfc3339_opts(SecondsFormat::Millis, true)
    } else {
        dt.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Interprets a declared literal as a point in time (used by `Reboot`,
/// `FactoryReset` and `Downloads.*.Download` declarations).
pub fn literal_to_ms(value: &Literal) -> Result<i64> {
    match value {
        Literal::Number(ms) => Ok(*ms),
        Literal::String(s) => parse_datetime_ms(s),
        Literal::Bool(b) => bail!("cannot interpret {b} as a timestamp"),
    }
}
