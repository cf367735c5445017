//! Register codec for signal values
//!
//! Decoding and encoding are inverses of each other for every supported type:
//!
//! | type      | words | value                                          |
//! |-----------|-------|------------------------------------------------|
//! | `bit`     | 1     | non-zero → true                                |
//! | `word`    | 1     | unsigned 16-bit, scaled by 10^scaleFactor      |
//! | `float32` | 2     | IEEE-754 single, configurable word order       |
//! | `int32`   | 2     | signed 32-bit, same word order as `float32`    |
//! | `float64` | 4     | IEEE-754 double, most significant word first   |
//! | `int64`   | 4     | signed 64-bit, most significant word first     |
//! | other     | any   | first raw word                                 |
//!
//! A reply shorter than the type needs decodes as the first raw word instead of
//! failing.

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{DataType, SignalDefinition, SignalValue};
use crate::error::{PlcError, Result};

/// Order of the two 16-bit halves of a 32-bit value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// `[low, high]`
    #[default]
    LowFirst,
    /// `[high, low]`
    HighFirst,
}

/// Codec settings shared by every signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecOptions {
    pub word_order: WordOrder,
    /// Treat `scaleFactor = 1` as "no scaling" (the record default) instead of
    /// one decimal place
    pub unit_scale_is_identity: bool,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            word_order: WordOrder::LowFirst,
            unit_scale_is_identity: true,
        }
    }
}

/// Absorbs binary representation error before truncating, so 12.34 * 100
/// lands on 1234 and not 1233.
const TRUNCATE_EPSILON: f64 = 1e-9;

/// Signal value codec
pub struct SignalCodec;

impl SignalCodec {
    /// Decimal places applied to `word` signals, if any
    pub fn decimal_places(def: &SignalDefinition, options: &CodecOptions) -> Option<i32> {
        match def.scale_factor {
            sf if sf <= 0 => None,
            1 if options.unit_scale_is_identity => None,
            sf => Some(sf.min(i64::from(i32::MAX)) as i32),
        }
    }

    /// Raw words (or 0/1 coil states) to a typed value
    pub fn decode(
        def: &SignalDefinition,
        raw: &[u16],
        options: &CodecOptions,
    ) -> Result<SignalValue> {
        let Some(&first) = raw.first() else {
            return Err(PlcError::decode(format!("{}: no data", def.code)));
        };
        let fallback = SignalValue::Int(i64::from(first));

        let value = match &def.data_type {
            DataType::Bit => SignalValue::Bool(first != 0),
            DataType::Word => match Self::decimal_places(def, options) {
                Some(places) => SignalValue::Float(f64::from(first) / 10f64.powi(places)),
                None => SignalValue::Int(i64::from(first)),
            },
            DataType::Float32 => match raw {
                [a, b, ..] => {
                    let bits = join32(*a, *b, options.word_order);
                    SignalValue::Float(f64::from(f32::from_bits(bits)))
                },
                _ => fallback,
            },
            DataType::Int32 => match raw {
                [a, b, ..] => SignalValue::Int(i64::from(join32(*a, *b, options.word_order) as i32)),
                _ => fallback,
            },
            DataType::Float64 => match raw {
                [a, b, c, d, ..] => SignalValue::Float(f64::from_bits(join64([*a, *b, *c, *d]))),
                _ => fallback,
            },
            DataType::Int64 => match raw {
                [a, b, c, d, ..] => SignalValue::Int(join64([*a, *b, *c, *d]) as i64),
                _ => fallback,
            },
            DataType::Other(_) => fallback,
        };

        trace!(code = %def.code, ?raw, %value, "decoded");
        Ok(value)
    }

    /// Typed value to raw words (coil signals use 0/1).
    ///
    /// Fails with a validation error, before anything reaches the wire, when the
    /// value is not finite or does not fit the signal's type. Fractions are
    /// truncated toward zero.
    pub fn encode(
        def: &SignalDefinition,
        value: &SignalValue,
        options: &CodecOptions,
    ) -> Result<Vec<u16>> {
        if !matches!(def.data_type, DataType::Bit) && !value.as_f64().is_finite() {
            return Err(PlcError::validation(format!(
                "{}: cannot write non-finite value {}",
                def.code, value
            )));
        }
        let out_of_range = || {
            PlcError::validation(format!(
                "{}: value {} out of range for {}",
                def.code, value, def.data_type
            ))
        };

        let words = match &def.data_type {
            DataType::Bit => vec![u16::from(value.as_bool())],
            DataType::Word => {
                let scaled = match Self::decimal_places(def, options) {
                    Some(places) => value.as_f64() * 10f64.powi(places),
                    None => value.as_f64(),
                };
                let word = truncate(scaled);
                if !(0.0..=f64::from(u16::MAX)).contains(&word) {
                    return Err(out_of_range());
                }
                vec![word as u16]
            },
            DataType::Float32 => {
                let single = value.as_f64() as f32;
                if !single.is_finite() {
                    return Err(out_of_range());
                }
                split32(single.to_bits(), options.word_order)
            },
            DataType::Int32 => {
                let int = whole(value)
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(out_of_range)?;
                split32(int as u32, options.word_order)
            },
            DataType::Float64 => split64(value.as_f64().to_bits()),
            DataType::Int64 => split64(whole(value).ok_or_else(out_of_range)? as u64),
            DataType::Other(_) => {
                let raw = whole(value)
                    .and_then(|v| u16::try_from(v).ok())
                    .ok_or_else(out_of_range)?;
                vec![raw]
            },
        };
        Ok(words)
    }
}

fn truncate(v: f64) -> f64 {
    if v >= 0.0 {
        (v + TRUNCATE_EPSILON).trunc()
    } else {
        (v - TRUNCATE_EPSILON).trunc()
    }
}

/// Integer part of a finite value, if it fits an i64
fn whole(value: &SignalValue) -> Option<i64> {
    match *value {
        SignalValue::Float(f) => {
            let t = truncate(f);
            // 2^63 is exact as f64, i64::MAX is not
            (t >= -(2f64.powi(63)) && t < 2f64.powi(63)).then_some(t as i64)
        },
        _ => Some(value.as_i64()),
    }
}

fn join32(first: u16, second: u16, order: WordOrder) -> u32 {
    let (high, low) = match order {
        WordOrder::LowFirst => (second, first),
        WordOrder::HighFirst => (first, second),
    };
    (u32::from(high) << 16) | u32::from(low)
}

fn split32(bits: u32, order: WordOrder) -> Vec<u16> {
    let high = (bits >> 16) as u16;
    let low = (bits & 0xFFFF) as u16;
    match order {
        WordOrder::LowFirst => vec![low, high],
        WordOrder::HighFirst => vec![high, low],
    }
}

fn join64(words: [u16; 4]) -> u64 {
    words
        .iter()
        .fold(0u64, |acc, w| (acc << 16) | u64::from(*w))
}

fn split64(bits: u64) -> Vec<u16> {
    (0..4)
        .rev()
        .map(|i| ((bits >> (i * 16)) & 0xFFFF) as u16)
        .collect()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn def(data_type: DataType, scale_factor: i64) -> SignalDefinition {
        SignalDefinition {
            code: "S".to_string(),
            data_type,
            scale_factor,
            ..Default::default()
        }
    }

    fn round_trip(d: &SignalDefinition, v: SignalValue, options: &CodecOptions) -> SignalValue {
        let words = SignalCodec::encode(d, &v, options).unwrap();
        SignalCodec::decode(d, &words, options).unwrap()
    }

    // ========================================================================
    // Word scaling
    // ========================================================================

    #[test]
    fn test_word_two_decimal_places() {
        let options = CodecOptions::default();
        let d = def(DataType::Word, 2);
        assert_eq!(SignalCodec::encode(&d, &SignalValue::Float(12.34), &options).unwrap(), vec![1234]);
        let back = round_trip(&d, SignalValue::Float(12.34), &options);
        assert!((back.as_f64() - 12.34).abs() < 1e-9);
    }

    #[test]
    fn test_word_unit_scale_is_raw() {
        let options = CodecOptions::default();
        let d = def(DataType::Word, 1);
        assert_eq!(SignalCodec::decode(&d, &[500], &options).unwrap(), SignalValue::Int(500));
        assert_eq!(SignalCodec::encode(&d, &SignalValue::Int(500), &options).unwrap(), vec![500]);
    }

    #[test]
    fn test_word_unit_scale_as_one_decimal() {
        let options = CodecOptions {
            unit_scale_is_identity: false,
            ..Default::default()
        };
        let d = def(DataType::Word, 1);
        assert_eq!(SignalCodec::decode(&d, &[505], &options).unwrap(), SignalValue::Float(50.5));
        assert_eq!(SignalCodec::encode(&d, &SignalValue::Float(50.5), &options).unwrap(), vec![505]);
    }

    #[test]
    fn test_word_zero_scale_and_unsigned() {
        let options = CodecOptions::default();
        let d = def(DataType::Word, 0);
        assert_eq!(
            SignalCodec::decode(&d, &[0xFFFF], &options).unwrap(),
            SignalValue::Int(65535)
        );
        // Truncation, not rounding
        assert_eq!(SignalCodec::encode(&d, &SignalValue::Float(7.9), &options).unwrap(), vec![7]);
    }

    // ========================================================================
    // Wide types
    // ========================================================================

    #[test]
    fn test_float32_round_trip_both_orders() {
        for order in [WordOrder::LowFirst, WordOrder::HighFirst] {
            let options = CodecOptions {
                word_order: order,
                ..Default::default()
            };
            let d = def(DataType::Float32, 1);
            for v in [0.0f32, -1.5, 3.14159, f32::MAX, f32::MIN_POSITIVE, 1.0e-20] {
                let back = round_trip(&d, SignalValue::Float(f64::from(v)), &options);
                assert_eq!(back, SignalValue::Float(f64::from(v)));
            }
        }
    }

    #[test]
    fn test_float32_word_order_layout() {
        let d = def(DataType::Float32, 1);
        // 1.0f32 = 0x3F80_0000
        let low_first = CodecOptions::default();
        assert_eq!(
            SignalCodec::encode(&d, &SignalValue::Float(1.0), &low_first).unwrap(),
            vec![0x0000, 0x3F80]
        );
        let high_first = CodecOptions {
            word_order: WordOrder::HighFirst,
            ..Default::default()
        };
        assert_eq!(
            SignalCodec::decode(&d, &[0x3F80, 0x0000], &high_first).unwrap(),
            SignalValue::Float(1.0)
        );
    }

    #[test]
    fn test_int32_sign() {
        let options = CodecOptions::default();
        let d = def(DataType::Int32, 1);
        assert_eq!(SignalCodec::encode(&d, &SignalValue::Int(-2), &options).unwrap(), vec![0xFFFE, 0xFFFF]);
        assert_eq!(round_trip(&d, SignalValue::Int(-123_456), &options), SignalValue::Int(-123_456));
    }

    #[test]
    fn test_64_bit_most_significant_first() {
        let options = CodecOptions::default();
        let d = def(DataType::Int64, 1);
        assert_eq!(
            SignalCodec::encode(&d, &SignalValue::Int(0x0001_0002_0003_0004), &options).unwrap(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(round_trip(&d, SignalValue::Int(-1), &options), SignalValue::Int(-1));

        let d = def(DataType::Float64, 1);
        assert_eq!(
            round_trip(&d, SignalValue::Float(-273.15), &options),
            SignalValue::Float(-273.15)
        );
    }

    // ========================================================================
    // Bits and fallbacks
    // ========================================================================

    #[test]
    fn test_bit_round_trip() {
        let options = CodecOptions::default();
        let d = def(DataType::Bit, 1);
        for b in [true, false] {
            assert_eq!(round_trip(&d, SignalValue::Bool(b), &options), SignalValue::Bool(b));
        }
        assert_eq!(SignalCodec::decode(&d, &[7], &options).unwrap(), SignalValue::Bool(true));
    }

    #[test]
    fn test_short_reply_falls_back_to_first_word() {
        let options = CodecOptions::default();
        assert_eq!(
            SignalCodec::decode(&def(DataType::Float32, 1), &[9], &options).unwrap(),
            SignalValue::Int(9)
        );
        assert_eq!(
            SignalCodec::decode(&def(DataType::Int64, 1), &[1, 2, 3], &options).unwrap(),
            SignalValue::Int(1)
        );
    }

    #[test]
    fn test_unknown_type_passes_first_word_through() {
        let options = CodecOptions::default();
        let d = def(DataType::Other("bcd".to_string()), 3);
        assert_eq!(SignalCodec::decode(&d, &[0x1234, 9], &options).unwrap(), SignalValue::Int(0x1234));
        assert_eq!(SignalCodec::encode(&d, &SignalValue::Float(42.9), &options).unwrap(), vec![42]);
    }

    // ========================================================================
    // Values that do not fit
    // ========================================================================

    fn rejected(d: &SignalDefinition, v: SignalValue) -> bool {
        matches!(
            SignalCodec::encode(d, &v, &CodecOptions::default()),
            Err(PlcError::ValidationError(_))
        )
    }

    #[test]
    fn test_word_rejects_values_outside_u16() {
        let d = def(DataType::Word, 0);
        assert!(rejected(&d, SignalValue::Int(65536)));
        assert!(rejected(&d, SignalValue::Int(-1)));
        assert!(rejected(&d, SignalValue::Float(-0.5 - 1.0)));
        assert_eq!(
            SignalCodec::encode(&d, &SignalValue::Int(65535), &CodecOptions::default()).unwrap(),
            vec![65535]
        );
        // Fractions below one truncate to zero rather than failing
        assert_eq!(
            SignalCodec::encode(&d, &SignalValue::Float(-0.5), &CodecOptions::default()).unwrap(),
            vec![0]
        );

        // Range is checked after scaling
        let d = def(DataType::Word, 2);
        assert!(rejected(&d, SignalValue::Float(655.36)));
        assert_eq!(
            SignalCodec::encode(&d, &SignalValue::Float(655.35), &CodecOptions::default()).unwrap(),
            vec![65535]
        );
    }

    #[test]
    fn test_non_finite_values_rejected() {
        for data_type in [
            DataType::Word,
            DataType::Float32,
            DataType::Int32,
            DataType::Float64,
            DataType::Int64,
        ] {
            let d = def(data_type, 0);
            assert!(rejected(&d, SignalValue::Float(f64::NAN)), "{}", d.data_type);
            assert!(rejected(&d, SignalValue::Float(f64::INFINITY)), "{}", d.data_type);
        }
        // A bit only asks whether the value is non-zero
        assert_eq!(
            SignalCodec::encode(
                &def(DataType::Bit, 0),
                &SignalValue::Float(f64::NAN),
                &CodecOptions::default()
            )
            .unwrap(),
            vec![1]
        );
    }

    #[test]
    fn test_wide_types_reject_overflow() {
        assert!(rejected(&def(DataType::Int32, 0), SignalValue::Int(i64::from(i32::MAX) + 1)));
        assert!(rejected(&def(DataType::Int32, 0), SignalValue::Float(-3.0e9)));
        assert!(rejected(&def(DataType::Float32, 0), SignalValue::Float(1.0e39)));
        assert!(rejected(&def(DataType::Int64, 0), SignalValue::Float(1.0e19)));
        assert!(rejected(&def(DataType::Other("bcd".to_string()), 0), SignalValue::Int(-1)));
    }

    #[test]
    fn test_empty_reply_is_decode_failure() {
        let options = CodecOptions::default();
        assert!(matches!(
            SignalCodec::decode(&def(DataType::Word, 1), &[], &options),
            Err(PlcError::DecodeFailure(_))
        ));
    }
}
