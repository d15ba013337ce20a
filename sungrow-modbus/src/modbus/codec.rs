//! Conversions between raw Modbus words and typed values.
//!
//! Everything here is pure; the only side effect is a `warn!` when a decoded number falls outside
//! the bounds declared for its field. Out-of-range values are still returned.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;

use super::register::{Field, FieldKind, ValueMap};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Number(Decimal),
    Text(String),
    Bool(bool),
}

impl Value {
    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<Decimal> for Value {
    fn from(n: Decimal) -> Self {
        Value::Number(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Reinterprets a word as two's complement.
pub fn to_signed16(word: u16) -> i16 {
    word as i16
}

/// Combines a big-endian word pair into a signed 32-bit integer.
pub fn combine32(high: u16, low: u16) -> i32 {
    (((high as u32) << 16) | (low as u32)) as i32
}

/// Packs each word as two big-endian bytes and decodes them as UTF-8, dropping invalid sequences
/// and trimming NUL padding and whitespace.
pub fn decode_string(words: &[u16]) -> String {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();

    let mut decoded = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        decoded.push_str(chunk.valid());
    }

    decoded
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_owned()
}

pub fn get_bit(value: u16, position: u8) -> bool {
    (value >> position) & 1 == 1
}

pub fn set_bit(value: u16, position: u8, on: bool) -> u16 {
    let mask = 1 << position;
    if on {
        value | mask
    } else {
        value & !mask
    }
}

/// Applies a scale factor. A scale of 0 or 1 keeps the integer as-is.
pub fn scale(raw: i64, scale: Decimal) -> Decimal {
    if scale.is_zero() || scale == Decimal::ONE {
        Decimal::from(raw)
    } else {
        (Decimal::from(raw) * scale).normalize()
    }
}

/// Decodes one or two words as an integer: one word honours `signed`, two words are always a
/// signed 32-bit value (high word first).
pub fn decode_integer(words: &[u16], signed: bool) -> Option<i64> {
    match *words {
        [word] if signed => Some(to_signed16(word) as i64),
        [word] => Some(word as i64),
        [high, low] => Some(combine32(high, low) as i64),
        _ => None,
    }
}

pub fn map_value(map: &ValueMap, code: i64) -> String {
    let mapped = match map {
        ValueMap::Table(table) => table.get(&code).cloned(),
        ValueMap::Lookup(lookup) => lookup(code),
    };
    mapped.unwrap_or_else(|| format!("Unknown ({code})"))
}

/// Outcome of a bounds check, mostly useful to tests; callers only need the logging side effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bounds {
    Within,
    BelowMinimum,
    AboveMaximum,
}

pub fn check_bounds(
    name: &str,
    value: Decimal,
    min: Option<Decimal>,
    max: Option<Decimal>,
) -> Bounds {
    match (min, max) {
        (Some(min), _) if value < min => {
            warn!(name, %value, %min, "Value below minimum");
            Bounds::BelowMinimum
        }
        (_, Some(max)) if value > max => {
            warn!(name, %value, %max, "Value above maximum");
            Bounds::AboveMaximum
        }
        _ => Bounds::Within,
    }
}

impl Field {
    /// Decodes this field from exactly `self.width` words.
    pub fn decode(&self, words: &[u16]) -> Option<Value> {
        if words.len() != self.width as usize {
            return None;
        }

        match self.kind {
            FieldKind::String => Some(Value::Text(decode_string(words))),
            FieldKind::Bit { bit } => Some(Value::Bool(get_bit(words[0], bit))),
            FieldKind::Enum { ref map } => {
                decode_integer(words, false).map(|code| Value::Text(map_value(map, code)))
            }
            FieldKind::Numeric {
                scale: factor,
                signed,
            } => {
                let value = scale(decode_integer(words, signed)?, factor);
                check_bounds(&self.name, value, self.min, self.max);
                Some(Value::Number(value))
            }
        }
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn combine32_examples() {
    assert_eq!(combine32(0x0001, 0x0002), 65538);
    assert_eq!(combine32(0xFFFF, 0xFFFF), -1);
    assert_eq!(combine32(0x0000, 0x0000), 0);
    assert_eq!(combine32(0x8000, 0x0000), i32::MIN);
}

#[test]
fn decode_string_trims_padding() {
    assert_eq!(decode_string(&[0x4142, 0x4300]), "ABC");
    assert_eq!(decode_string(&[0x2041, 0x4220, 0x0000]), "AB");
    assert_eq!(decode_string(&[0x0000, 0x0000]), "");
}

#[test]
fn decode_string_drops_invalid_bytes() {
    // 0xFF is never valid UTF-8
    assert_eq!(decode_string(&[0x41FF, 0x4200]), "AB");
}

#[test]
fn bit_helpers() {
    assert_eq!(set_bit(0b1010, 0, true), 0b1011);
    assert_eq!(set_bit(0b1011, 1, false), 0b1001);
    assert_eq!(set_bit(0b1011, 3, true), 0b1011);
    assert!(get_bit(0b10000, 4));
    assert!(!get_bit(0b10000, 3));
}

#[test]
fn single_word_signed_and_scaled() {
    assert_eq!(decode_integer(&[65535], true), Some(-1));
    assert_eq!(decode_integer(&[65535], false), Some(65535));
    assert_eq!(decode_integer(&[1, 2, 3], false), None);
    assert_eq!(scale(500, Decimal::new(1, 1)), Decimal::from(50));
    assert_eq!(scale(-7, Decimal::ZERO), Decimal::from(-7));
    assert_eq!(scale(1234, Decimal::new(1, 2)), Decimal::new(1234, 2));
}

#[test]
fn value_map_placeholder() {
    let map = ValueMap::Table([(0, "Stopped".to_owned()), (1, "Running".to_owned())].into());
    assert_eq!(map_value(&map, 1), "Running");
    assert_eq!(map_value(&map, 9), "Unknown (9)");

    let lookup = ValueMap::Lookup(|code| (code == 3).then(|| "Three".to_owned()));
    assert_eq!(map_value(&lookup, 3), "Three");
    assert_eq!(map_value(&lookup, 4), "Unknown (4)");
}

#[test]
fn bounds_are_reported_but_not_enforced() {
    let min = Some(Decimal::ZERO);
    let max = Some(Decimal::from(100));
    assert_eq!(check_bounds("soc", Decimal::from(50), min, max), Bounds::Within);
    assert_eq!(check_bounds("soc", Decimal::ZERO, min, max), Bounds::Within);
    assert_eq!(check_bounds("soc", Decimal::from(100), min, max), Bounds::Within);
    assert_eq!(check_bounds("soc", Decimal::from(-1), min, max), Bounds::BelowMinimum);
    assert_eq!(check_bounds("soc", Decimal::from(500), min, max), Bounds::AboveMaximum);
    assert_eq!(check_bounds("soc", Decimal::from(500), min, None), Bounds::Within);

    let field = Field::numeric("soc", 13022, 1, Decimal::ONE, true).with_bounds(min, max);
    assert_eq!(field.decode(&[65535]), Some(Value::Number(Decimal::from(-1))));
}

#[test]
fn field_decoding_by_kind() {
    let serial = Field::string("serial", 4990, 2);
    assert_eq!(serial.decode(&[0x4142, 0x4300]), Some(Value::Text("ABC".into())));
    assert_eq!(serial.decode(&[0x4142]), None);

    let flag = Field::bit("export_limited", 13086, 4);
    assert_eq!(flag.decode(&[0b10000]), Some(Value::Bool(true)));

    let state = Field::mapped(
        "state",
        13000,
        ValueMap::Table([(0x40, "Running".to_owned())].into()),
    );
    assert_eq!(state.decode(&[0x40]), Some(Value::Text("Running".into())));
    assert_eq!(state.decode(&[0x41]), Some(Value::Text("Unknown (65)".into())));

    let energy = Field::numeric("total", 13002, 2, Decimal::new(1, 1), false);
    assert_eq!(
        energy.decode(&[0x0001, 0x0002]),
        Some(Value::Number(Decimal::new(65538, 1)))
    );
}
