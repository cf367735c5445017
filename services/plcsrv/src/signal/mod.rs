//! Signal definitions and values
//!
//! A signal is one named process variable mapped onto coils or holding
//! registers. Definitions arrive as loosely typed JSON records from the
//! configuration backend, so deserialization here is deliberately forgiving.

pub mod codec;
pub mod registry;

use std::fmt;

use common::serde_helpers::{
    bool_true, deserialize_bool_flexible, deserialize_i64_flexible, deserialize_i64_or_one,
    deserialize_string_flexible, one_i64,
};
use serde::{Deserialize, Deserializer, Serialize};

pub use codec::{CodecOptions, WordOrder};
pub use registry::{AddressMode, RegistryEvent, RegistryOptions, SignalRegistry};

// ============================================================================
// Enumerations
// ============================================================================

/// Whether the signal may be written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Read,
    Write,
}

impl Direction {
    /// `write` (any case) is writable, everything else is read-only
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("write") {
            Direction::Write
        } else {
            Direction::Read
        }
    }
}

impl<'de> Deserialize<'de> for Direction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_string_flexible(deserializer).map(|s| Direction::parse(&s))
    }
}

/// Modbus table a signal lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalKind {
    Coil,
    #[default]
    HoldingRegister,
}

impl SignalKind {
    /// `1` or `coil` selects coils; anything else is a holding register
    pub fn parse(s: &str) -> Self {
        let t = s.trim();
        if t == "1" || t.eq_ignore_ascii_case("coil") || t.eq_ignore_ascii_case("coils") {
            SignalKind::Coil
        } else {
            SignalKind::HoldingRegister
        }
    }
}

impl<'de> Deserialize<'de> for SignalKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_string_flexible(deserializer).map(|s| SignalKind::parse(&s))
    }
}

/// Value encoding on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataType {
    Bit,
    #[default]
    Word,
    Float32,
    Int32,
    Float64,
    Int64,
    /// Anything else; decoded as the first raw word
    Other(String),
}

impl DataType {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "bit" | "bool" => DataType::Bit,
            "word" | "uint16" => DataType::Word,
            "float32" | "float" => DataType::Float32,
            "int32" => DataType::Int32,
            "float64" | "double" => DataType::Float64,
            "int64" => DataType::Int64,
            _ => DataType::Other(s.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DataType::Bit => "bit",
            DataType::Word => "word",
            DataType::Float32 => "float32",
            DataType::Int32 => "int32",
            DataType::Float64 => "float64",
            DataType::Int64 => "int64",
            DataType::Other(s) => s,
        }
    }

    /// Registers the type needs to decode fully, if fixed
    pub fn register_width(&self) -> Option<u16> {
        match self {
            DataType::Bit | DataType::Word => Some(1),
            DataType::Float32 | DataType::Int32 => Some(2),
            DataType::Float64 | DataType::Int64 => Some(4),
            DataType::Other(_) => None,
        }
    }
}

impl From<String> for DataType {
    fn from(s: String) -> Self {
        DataType::parse(&s)
    }
}

impl From<DataType> for String {
    fn from(t: DataType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Definition
// ============================================================================

/// One monitored or controlled process variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDefinition {
    #[serde(default, deserialize_with = "deserialize_i64_flexible")]
    pub id: i64,

    #[serde(rename = "deviceId", default, deserialize_with = "deserialize_i64_flexible")]
    pub device_id: i64,

    /// Unique key used by callers
    #[serde(rename = "signalCode", default, deserialize_with = "deserialize_string_flexible")]
    pub code: String,

    #[serde(rename = "signalName", default, deserialize_with = "deserialize_string_flexible")]
    pub name: String,

    #[serde(rename = "signalType", default)]
    pub direction: Direction,

    #[serde(rename = "registerType", default)]
    pub kind: SignalKind,

    /// Register or coil start address
    #[serde(rename = "registerAddress", default, deserialize_with = "deserialize_i64_flexible")]
    pub address: i64,

    #[serde(rename = "dataType", default)]
    pub data_type: DataType,

    #[serde(
        rename = "registerCount",
        default = "one_i64",
        deserialize_with = "deserialize_i64_or_one"
    )]
    pub register_count: i64,

    /// Decimal places for scaled words
    #[serde(
        rename = "scaleFactor",
        default = "one_i64",
        deserialize_with = "deserialize_i64_or_one"
    )]
    pub scale_factor: i64,

    /// Alternate holding register address in legacy addressing mode
    #[serde(rename = "offsetValue", default, deserialize_with = "deserialize_i64_flexible")]
    pub offset_value: i64,

    #[serde(default, deserialize_with = "deserialize_string_flexible")]
    pub unit: String,

    /// Vendor memory area; empty means `address` is already a Modbus address
    #[serde(rename = "plcAreaType", default, deserialize_with = "deserialize_string_flexible")]
    pub area_type: String,

    #[serde(rename = "paramGroup", default, deserialize_with = "deserialize_string_flexible")]
    pub param_group: String,

    #[serde(
        rename = "isActive",
        default = "bool_true",
        deserialize_with = "deserialize_bool_flexible"
    )]
    pub is_active: bool,
}

impl Default for SignalDefinition {
    fn default() -> Self {
        Self {
            id: 0,
            device_id: 0,
            code: String::new(),
            name: String::new(),
            direction: Direction::Read,
            kind: SignalKind::HoldingRegister,
            address: 0,
            data_type: DataType::Word,
            register_count: 1,
            scale_factor: 1,
            offset_value: 0,
            unit: String::new(),
            area_type: String::new(),
            param_group: String::new(),
            is_active: true,
        }
    }
}

impl SignalDefinition {
    pub fn is_writable(&self) -> bool {
        self.direction == Direction::Write
    }

    /// Structural checks applied on load
    pub fn check(&self) -> Result<(), String> {
        if self.code.trim().is_empty() {
            return Err("empty signal code".to_string());
        }
        if self.address < 0 {
            return Err(format!("negative address {}", self.address));
        }
        if !matches!(self.register_count, 1 | 2 | 4) {
            return Err(format!(
                "register count {} not in {{1, 2, 4}}",
                self.register_count
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Value
// ============================================================================

/// Decoded signal value.
///
/// Serializes untagged, so a bridge sees plain JSON `true` / `500` / `12.34`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl SignalValue {
    pub fn as_bool(&self) -> bool {
        match *self {
            SignalValue::Bool(b) => b,
            SignalValue::Int(i) => i != 0,
            SignalValue::Float(f) => f != 0.0,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match *self {
            SignalValue::Bool(b) => i64::from(b),
            SignalValue::Int(i) => i,
            SignalValue::Float(f) => f as i64,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            SignalValue::Bool(b) => f64::from(u8::from(b)),
            SignalValue::Int(i) => i as f64,
            SignalValue::Float(f) => f,
        }
    }
}

// Floats compare by bit pattern so a NaN reading does not look like a change
// on every poll.
impl PartialEq for SignalValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SignalValue::Bool(a), SignalValue::Bool(b)) => a == b,
            (SignalValue::Int(a), SignalValue::Int(b)) => a == b,
            (SignalValue::Float(a), SignalValue::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl From<bool> for SignalValue {
    fn from(b: bool) -> Self {
        SignalValue::Bool(b)
    }
}

impl From<i64> for SignalValue {
    fn from(i: i64) -> Self {
        SignalValue::Int(i)
    }
}

impl From<f64> for SignalValue {
    fn from(f: f64) -> Self {
        SignalValue::Float(f)
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Bool(b) => write!(f, "{}", b),
            SignalValue::Int(i) => write!(f, "{}", i),
            SignalValue::Float(v) => write!(f, "{}", v),
        }
    }
}
