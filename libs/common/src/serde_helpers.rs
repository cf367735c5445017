//! Shared Serde deserializers
//!
//! Upstream configuration records are loosely typed: the same field may arrive as
//! a JSON number, a numeric string, or an empty string. These helpers accept all
//! of those shapes:
//! - `null` / `""` → field default
//! - String number `"123"` → 123
//! - Native number `123` → 123

use serde::{Deserialize, Deserializer};

// ============================================================================
// Default Value Functions (for serde #[serde(default = "...")] attributes)
// ============================================================================

/// Default value: true
pub fn bool_true() -> bool {
    true
}

/// Default value: 1
pub fn one_i64() -> i64 {
    1
}

// ============================================================================
// Custom Deserializers
// ============================================================================

/// Boolean field that accepts native booleans, 0/1, and strings
///
/// - JSON boolean: true, false
/// - JSON integer: 0 (false), 1 (true)
/// - String: "1"/"0", "true"/"false", "yes"/"no" (case-insensitive), "" (false)
pub fn deserialize_bool_flexible<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrStringOrInt {
        Bool(bool),
        Int(i64),
        String(String),
    }

    match BoolOrStringOrInt::deserialize(deserializer)? {
        BoolOrStringOrInt::Bool(b) => Ok(b),
        BoolOrStringOrInt::Int(i) => match i {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(D::Error::custom(format!(
                "Invalid integer value {}, expected 0 or 1",
                i
            ))),
        },
        BoolOrStringOrInt::String(s) => {
            let t = s.trim();
            if t == "1" || t.eq_ignore_ascii_case("true") || t.eq_ignore_ascii_case("yes") {
                Ok(true)
            } else if t.is_empty()
                || t == "0"
                || t.eq_ignore_ascii_case("false")
                || t.eq_ignore_ascii_case("no")
            {
                Ok(false)
            } else {
                Err(D::Error::custom(format!(
                    "Invalid boolean value '{}', expected: 1/0, true/false, yes/no, or boolean",
                    s
                )))
            }
        },
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(i64),
    Float(f64),
    String(String),
}

fn parse_i64<E: serde::de::Error>(raw: Option<IntOrString>) -> Result<Option<i64>, E> {
    match raw {
        None => Ok(None),
        Some(IntOrString::Int(i)) => Ok(Some(i)),
        Some(IntOrString::Float(f)) if f.fract() == 0.0 => Ok(Some(f as i64)),
        Some(IntOrString::Float(f)) => Err(E::custom(format!(
            "Invalid integer value {}, fractional part not allowed",
            f
        ))),
        Some(IntOrString::String(s)) => {
            let t = s.trim();
            if t.is_empty() {
                Ok(None)
            } else {
                t.parse::<i64>()
                    .map(Some)
                    .map_err(|e| E::custom(format!("Invalid integer '{}': {}", s, e)))
            }
        },
    }
}

/// Integer field that accepts numbers or numeric strings; blank or null becomes 0
pub fn deserialize_i64_flexible<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<IntOrString>::deserialize(deserializer)?;
    Ok(parse_i64::<D::Error>(raw)?.unwrap_or(0))
}

/// Same as [`deserialize_i64_flexible`] but blank or null becomes 1
pub fn deserialize_i64_or_one<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<IntOrString>::deserialize(deserializer)?;
    Ok(parse_i64::<D::Error>(raw)?.unwrap_or(1))
}

/// String field that also accepts numbers and booleans; null becomes empty
pub fn deserialize_string_flexible<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        String(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    Ok(match Option::<Loose>::deserialize(deserializer)? {
        None => String::new(),
        Some(Loose::String(s)) => s,
        Some(Loose::Int(i)) => i.to_string(),
        Some(Loose::Float(f)) => f.to_string(),
        Some(Loose::Bool(b)) => b.to_string(),
    })
}
