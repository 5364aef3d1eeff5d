//! Per-field value transforms.
//!
//! Each field of a measurement group names one transform in the configuration
//! file. The set is closed: names are resolved to a [`Transform`] when the
//! configuration is loaded, so an unknown name stops the daemon at startup
//! instead of failing mid-poll.

use crate::decoder::RawValue;
use crate::lookup::EnumTable;
use crate::point::FieldValue;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A decoded integer has no entry in its enumeration table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown code {code} for {table}")]
pub struct UnknownEnumCode {
    /// Table that was consulted
    pub table: EnumTable,
    /// Code read from the device
    pub code: i64,
}

impl UnknownEnumCode {
    /// Label written in place of the missing one.
    pub fn fallback_label(&self) -> String {
        format!("UNKNOWN-{}", self.code)
    }
}

/// Transform applied to one decoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Fixed point with one decimal: `x / 10`
    Scale10,
    /// Fixed point with two decimals: `x / 100`
    Scale100,
    /// Integer pass-through
    AsInt,
    /// Value unchanged
    AsIs,
    /// Enumeration code to label
    Lookup(EnumTable),
}

impl Transform {
    /// Configuration name of the transform.
    pub fn name(self) -> &'static str {
        match self {
            Transform::Scale10 => "fixed_point_to_float_10",
            Transform::Scale100 => "fixed_point_to_float_100",
            Transform::AsInt => "as_int",
            Transform::AsIs => "as_is",
            Transform::Lookup(table) => table.transform_name(),
        }
    }

    /// Apply the transform to a decoded value.
    pub fn apply(self, raw: RawValue) -> Result<FieldValue, UnknownEnumCode> {
        let value = match self {
            Transform::Scale10 => FieldValue::Float(raw.as_f64() / 10.0),
            Transform::Scale100 => FieldValue::Float(raw.as_f64() / 100.0),
            Transform::AsInt => FieldValue::Int(raw.as_i64()),
            Transform::AsIs => match raw {
                RawValue::F32(v) => FieldValue::Float(f64::from(v)),
                RawValue::F64(v) => FieldValue::Float(v),
                other => FieldValue::Int(other.as_i64()),
            },
            Transform::Lookup(table) => {
                let code = raw.as_i64();
                let label = table.label(code).ok_or(UnknownEnumCode { table, code })?;
                FieldValue::Text(label.to_string())
            }
        };
        Ok(value)
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Transform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed_point_to_float_10" => Ok(Transform::Scale10),
            "fixed_point_to_float_100" => Ok(Transform::Scale100),
            "as_int" => Ok(Transform::AsInt),
            "as_is" => Ok(Transform::AsIs),
            other => other
                .parse::<EnumTable>()
                .map(Transform::Lookup)
                .map_err(|_| format!("Unknown transform '{other}'")),
        }
    }
}
