//! Register block decoding.
//!
//! Modbus delivers holding registers as 16-bit words in big-endian order. A
//! measurement group describes how the concatenated bytes of its register
//! block are laid out with a compact format descriptor:
//!
//! ```text
//! ">hhHHiI"   big-endian: i16, i16, u16, u16, i32 (two registers), u32
//! ">4h2x"     four i16 followed by two pad bytes
//! ```
//!
//! Supported codes:
//!
//! | code | type | bytes |
//! |------|------|-------|
//! | `x`  | pad (no value) | 1 |
//! | `b` / `B` | i8 / u8 | 1 |
//! | `?`  | bool | 1 |
//! | `h` / `H` | i16 / u16 | 2 |
//! | `i` / `I`, `l` / `L` | i32 / u32 | 4 |
//! | `q` / `Q` | i64 / u64 | 8 |
//! | `f` / `d` | f32 / f64 | 4 / 8 |
//!
//! The optional prefix selects the byte order: `>` or `!` big-endian, `<`
//! little-endian. Without a prefix the layout is big-endian. Native orders
//! (`@`, `=`) are rejected because they depend on the host. No alignment
//! padding is ever inserted.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while parsing a layout or decoding a register block.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Invalid layout '{layout}': {reason}")]
    InvalidLayout { layout: String, reason: String },

    #[error("Layout '{layout}' spans {layout_bytes} bytes but {received_bytes} bytes were received")]
    LengthMismatch {
        layout: String,
        layout_bytes: usize,
        received_bytes: usize,
    },

    #[error("Layout '{layout}' holds {expected} values, got {actual}")]
    ValueCountMismatch {
        layout: String,
        expected: usize,
        actual: usize,
    },
}

/// Byte order of multi-byte items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first (Modbus native)
    BigEndian,
    /// Least significant byte first
    LittleEndian,
}

/// One item of a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// Pad byte, produces no value
    Pad,
    /// Signed 8-bit integer
    I8,
    /// Unsigned 8-bit integer
    U8,
    /// Boolean stored in one byte
    Bool,
    /// Signed 16-bit integer (one register)
    I16,
    /// Unsigned 16-bit integer (one register)
    U16,
    /// Signed 32-bit integer (two registers)
    I32,
    /// Unsigned 32-bit integer (two registers)
    U32,
    /// Signed 64-bit integer (four registers)
    I64,
    /// Unsigned 64-bit integer (four registers)
    U64,
    /// IEEE 754 single precision (two registers)
    F32,
    /// IEEE 754 double precision (four registers)
    F64,
}

impl ItemKind {
    fn from_code(code: char) -> Option<Self> {
        let kind = match code {
            'x' => ItemKind::Pad,
            'b' => ItemKind::I8,
            'B' => ItemKind::U8,
            '?' => ItemKind::Bool,
            'h' => ItemKind::I16,
            'H' => ItemKind::U16,
            'i' | 'l' => ItemKind::I32,
            'I' | 'L' => ItemKind::U32,
            'q' => ItemKind::I64,
            'Q' => ItemKind::U64,
            'f' => ItemKind::F32,
            'd' => ItemKind::F64,
            _ => return None,
        };
        Some(kind)
    }

    /// Size of the item in bytes.
    pub fn size(self) -> usize {
        match self {
            ItemKind::Pad | ItemKind::I8 | ItemKind::U8 | ItemKind::Bool => 1,
            ItemKind::I16 | ItemKind::U16 => 2,
            ItemKind::I32 | ItemKind::U32 | ItemKind::F32 => 4,
            ItemKind::I64 | ItemKind::U64 | ItemKind::F64 => 8,
        }
    }
}

/// A single value read from a register block, before any transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue {
    /// Any signed integer item
    Signed(i64),
    /// Any unsigned integer item
    Unsigned(u64),
    /// Single precision float, kept as `f32` so its bits survive re-encoding
    F32(f32),
    /// Double precision float
    F64(f64),
    /// Boolean item
    Bool(bool),
}

impl RawValue {
    /// Integer view of the value. Floats are truncated toward zero.
    pub fn as_i64(self) -> i64 {
        match self {
            RawValue::Signed(v) => v,
            RawValue::Unsigned(v) => v as i64,
            RawValue::F32(v) => v as i64,
            RawValue::F64(v) => v as i64,
            RawValue::Bool(v) => i64::from(v),
        }
    }

    /// Floating point view of the value.
    pub fn as_f64(self) -> f64 {
        match self {
            RawValue::Signed(v) => v as f64,
            RawValue::Unsigned(v) => v as f64,
            RawValue::F32(v) => f64::from(v),
            RawValue::F64(v) => v,
            RawValue::Bool(v) => f64::from(u8::from(v)),
        }
    }

    fn as_u64(self) -> u64 {
        match self {
            RawValue::Unsigned(v) => v,
            other => other.as_i64() as u64,
        }
    }

    fn as_bool(self) -> bool {
        match self {
            RawValue::Bool(v) => v,
            other => other.as_i64() != 0,
        }
    }
}

/// Parsed binary layout of a register block.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    descriptor: String,
    order: ByteOrder,
    items: Vec<ItemKind>,
}

impl Layout {
    /// Parse a format descriptor such as `">hhHH2x"`.
    pub fn parse(descriptor: &str) -> Result<Self, DecodeError> {
        let invalid = |reason: String| DecodeError::InvalidLayout {
            layout: descriptor.to_string(),
            reason,
        };

        let mut chars = descriptor.chars().filter(|c| !c.is_whitespace()).peekable();

        let order = match chars.peek() {
            Some('>') | Some('!') => {
                chars.next();
                ByteOrder::BigEndian
            }
            Some('<') => {
                chars.next();
                ByteOrder::LittleEndian
            }
            Some(c @ ('@' | '=')) => {
                return Err(invalid(format!(
                    "native byte order '{c}' is not supported, use '>' or '<'"
                )));
            }
            _ => ByteOrder::BigEndian,
        };

        let mut items = Vec::new();
        let mut repeat: Option<usize> = None;
        for c in chars {
            if let Some(digit) = c.to_digit(10) {
                let current = repeat.unwrap_or(0);
                repeat = Some(
                    current
                        .checked_mul(10)
                        .and_then(|v| v.checked_add(digit as usize))
                        .ok_or_else(|| invalid("repeat count overflow".to_string()))?,
                );
                continue;
            }

            let kind = ItemKind::from_code(c)
                .ok_or_else(|| invalid(format!("unsupported format code '{c}'")))?;
            let count = repeat.take().unwrap_or(1);
            items.extend(std::iter::repeat(kind).take(count));
        }

        if repeat.is_some() {
            return Err(invalid("repeat count without format code".to_string()));
        }

        Ok(Self {
            descriptor: descriptor.to_string(),
            order,
            items,
        })
    }

    /// The descriptor this layout was parsed from.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Byte order of multi-byte items.
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// All items, pads included.
    pub fn items(&self) -> &[ItemKind] {
        &self.items
    }

    /// Total number of bytes covered by the layout.
    pub fn byte_len(&self) -> usize {
        self.items.iter().map(|kind| kind.size()).sum()
    }

    /// Number of values a decode produces (pad bytes excluded).
    pub fn value_count(&self) -> usize {
        self.items
            .iter()
            .filter(|kind| **kind != ItemKind::Pad)
            .count()
    }

    /// Number of 16-bit registers the layout covers, if it is register aligned.
    pub fn register_count(&self) -> Option<usize> {
        let len = self.byte_len();
        (len % 2 == 0).then_some(len / 2)
    }

    /// Encode values back into register words.
    ///
    /// This is the inverse of [`decode`]. Pad bytes are written as zero and
    /// booleans as `0`/`1`.
    pub fn encode(&self, values: &[RawValue]) -> Result<Vec<u16>, DecodeError> {
        if values.len() != self.value_count() {
            return Err(DecodeError::ValueCountMismatch {
                layout: self.descriptor.clone(),
                expected: self.value_count(),
                actual: values.len(),
            });
        }
        let Some(_) = self.register_count() else {
            return Err(DecodeError::InvalidLayout {
                layout: self.descriptor.clone(),
                reason: format!("odd byte length {}", self.byte_len()),
            });
        };

        let little = self.order == ByteOrder::LittleEndian;
        let mut buf = BytesMut::with_capacity(self.byte_len());
        let mut values = values.iter().copied();

        for kind in &self.items {
            let value = if *kind == ItemKind::Pad {
                RawValue::Unsigned(0)
            } else {
                // Length was checked above
                let Some(value) = values.next() else { break };
                value
            };
            match (kind, little) {
                (ItemKind::Pad, _) => buf.put_u8(0),
                (ItemKind::I8, _) => buf.put_i8(value.as_i64() as i8),
                (ItemKind::U8, _) => buf.put_u8(value.as_u64() as u8),
                (ItemKind::Bool, _) => buf.put_u8(u8::from(value.as_bool())),
                (ItemKind::I16, false) => buf.put_i16(value.as_i64() as i16),
                (ItemKind::I16, true) => buf.put_i16_le(value.as_i64() as i16),
                (ItemKind::U16, false) => buf.put_u16(value.as_u64() as u16),
                (ItemKind::U16, true) => buf.put_u16_le(value.as_u64() as u16),
                (ItemKind::I32, false) => buf.put_i32(value.as_i64() as i32),
                (ItemKind::I32, true) => buf.put_i32_le(value.as_i64() as i32),
                (ItemKind::U32, false) => buf.put_u32(value.as_u64() as u32),
                (ItemKind::U32, true) => buf.put_u32_le(value.as_u64() as u32),
                (ItemKind::I64, false) => buf.put_i64(value.as_i64()),
                (ItemKind::I64, true) => buf.put_i64_le(value.as_i64()),
                (ItemKind::U64, false) => buf.put_u64(value.as_u64()),
                (ItemKind::U64, true) => buf.put_u64_le(value.as_u64()),
                (ItemKind::F32, false) => buf.put_f32(to_f32(value)),
                (ItemKind::F32, true) => buf.put_f32_le(to_f32(value)),
                (ItemKind::F64, false) => buf.put_f64(value.as_f64()),
                (ItemKind::F64, true) => buf.put_f64_le(value.as_f64()),
            }
        }

        let mut bytes = buf.freeze();
        let mut words = Vec::with_capacity(bytes.len() / 2);
        while bytes.remaining() >= 2 {
            words.push(bytes.get_u16());
        }
        Ok(words)
    }
}

fn to_f32(value: RawValue) -> f32 {
    match value {
        RawValue::F32(v) => v,
        other => other.as_f64() as f32,
    }
}

impl FromStr for Layout {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Layout::parse(s)
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descriptor)
    }
}

/// Decode a block of register words according to `layout`.
///
/// The words are concatenated big-endian (Modbus wire order) and the resulting
/// bytes are reinterpreted item by item.
pub fn decode(words: &[u16], layout: &Layout) -> Result<Vec<RawValue>, DecodeError> {
    let received_bytes = words.len() * 2;
    if layout.byte_len() != received_bytes {
        return Err(DecodeError::LengthMismatch {
            layout: layout.descriptor.clone(),
            layout_bytes: layout.byte_len(),
            received_bytes,
        });
    }

    let mut raw = BytesMut::with_capacity(received_bytes);
    for word in words {
        raw.put_u16(*word);
    }
    let mut buf = raw.freeze();

    let little = layout.order == ByteOrder::LittleEndian;
    let mut values = Vec::with_capacity(layout.value_count());
    for kind in &layout.items {
        let value = match (kind, little) {
            (ItemKind::Pad, _) => {
                buf.advance(1);
                continue;
            }
            (ItemKind::I8, _) => RawValue::Signed(i64::from(buf.get_i8())),
            (ItemKind::U8, _) => RawValue::Unsigned(u64::from(buf.get_u8())),
            (ItemKind::Bool, _) => RawValue::Bool(buf.get_u8() != 0),
            (ItemKind::I16, false) => RawValue::Signed(i64::from(buf.get_i16())),
            (ItemKind::I16, true) => RawValue::Signed(i64::from(buf.get_i16_le())),
            (ItemKind::U16, false) => RawValue::Unsigned(u64::from(buf.get_u16())),
            (ItemKind::U16, true) => RawValue::Unsigned(u64::from(buf.get_u16_le())),
            (ItemKind::I32, false) => RawValue::Signed(i64::from(buf.get_i32())),
            (ItemKind::I32, true) => RawValue::Signed(i64::from(buf.get_i32_le())),
            (ItemKind::U32, false) => RawValue::Unsigned(u64::from(buf.get_u32())),
            (ItemKind::U32, true) => RawValue::Unsigned(u64::from(buf.get_u32_le())),
            (ItemKind::I64, false) => RawValue::Signed(buf.get_i64()),
            (ItemKind::I64, true) => RawValue::Signed(buf.get_i64_le()),
            (ItemKind::U64, false) => RawValue::Unsigned(buf.get_u64()),
            (ItemKind::U64, true) => RawValue::Unsigned(buf.get_u64_le()),
            (ItemKind::F32, false) => RawValue::F32(buf.get_f32()),
            (ItemKind::F32, true) => RawValue::F32(buf.get_f32_le()),
            (ItemKind::F64, false) => RawValue::F64(buf.get_f64()),
            (ItemKind::F64, true) => RawValue::F64(buf.get_f64_le()),
        };
        values.push(value);
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn parse_simple_layout() {
        let layout = Layout::parse(">hhH").unwrap();
        assert_eq!(layout.byte_order(), ByteOrder::BigEndian);
        assert_eq!(
            layout.items(),
            &[ItemKind::I16, ItemKind::I16, ItemKind::U16]
        );
        assert_eq!(layout.byte_len(), 6);
        assert_eq!(layout.value_count(), 3);
        assert_eq!(layout.register_count(), Some(3));
    }

    #[test]
    fn parse_repeat_counts_and_pads() {
        let layout = Layout::parse("< 3h 2x i").unwrap();
        assert_eq!(layout.byte_order(), ByteOrder::LittleEndian);
        assert_eq!(layout.byte_len(), 3 * 2 + 2 + 4);
        assert_eq!(layout.value_count(), 4);
    }

    #[test]
    fn parse_defaults_to_big_endian() {
        let layout = Layout::parse("HH").unwrap();
        assert_eq!(layout.byte_order(), ByteOrder::BigEndian);
    }

    #[test]
    fn parse_rejects_bad_descriptors() {
        assert!(matches!(
            Layout::parse("@hh"),
            Err(DecodeError::InvalidLayout { .. })
        ));
        assert!(matches!(
            Layout::parse(">h10s"),
            Err(DecodeError::InvalidLayout { .. })
        ));
        assert!(matches!(
            Layout::parse(">hh3"),
            Err(DecodeError::InvalidLayout { .. })
        ));
    }

    #[test]
    fn decode_signed_and_unsigned_words() {
        let layout = Layout::parse(">hH").unwrap();
        let values = decode(&[0xFFFE, 0xFFFE], &layout).unwrap();
        assert_eq!(values, vec![RawValue::Signed(-2), RawValue::Unsigned(65534)]);
    }

    #[test]
    fn decode_32_bit_values_span_two_registers() {
        let layout = Layout::parse(">iI").unwrap();
        let values = decode(&[0xFFFF, 0xFF9C, 0x0001, 0x0000], &layout).unwrap();
        assert_eq!(
            values,
            vec![RawValue::Signed(-100), RawValue::Unsigned(65536)]
        );
    }

    #[test]
    fn decode_little_endian_layout() {
        let layout = Layout::parse("<H").unwrap();
        let values = decode(&[0x3412], &layout).unwrap();
        assert_eq!(values, vec![RawValue::Unsigned(0x1234)]);
    }

    #[test]
    fn decode_float_and_pad() {
        let layout = Layout::parse(">2xhf").unwrap();
        let bits = 21.5f32.to_bits();
        let words = [0x0000, 215, (bits >> 16) as u16, bits as u16];
        let values = decode(&words, &layout).unwrap();
        assert_eq!(values, vec![RawValue::Signed(215), RawValue::F32(21.5)]);
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let layout = Layout::parse(">hhh").unwrap();
        let err = decode(&[1, 2], &layout).unwrap_err();
        assert_eq!(
            err,
            DecodeError::LengthMismatch {
                layout: ">hhh".to_string(),
                layout_bytes: 6,
                received_bytes: 4,
            }
        );
    }

    #[test]
    fn encode_checks_value_count() {
        let layout = Layout::parse(">hh").unwrap();
        assert!(matches!(
            layout.encode(&[RawValue::Signed(1)]),
            Err(DecodeError::ValueCountMismatch { expected: 2, actual: 1, .. })
        ));
    }

    #[test]
    fn decode_encode_round_trip_is_bit_exact() {
        // Pads and bools are lossy by nature and are excluded here
        const CODES: &[&str] = &["b", "B", "h", "H", "i", "I", "q", "Q", "f", "d"];
        let mut rng = rand::thread_rng();

        for _ in 0..500 {
            let order = if rng.gen_bool(0.5) { ">" } else { "<" };
            let mut descriptor = order.to_string();
            for _ in 0..rng.gen_range(1..8) {
                descriptor.push_str(CODES[rng.gen_range(0..CODES.len())]);
            }
            let mut layout = Layout::parse(&descriptor).unwrap();
            if layout.register_count().is_none() {
                descriptor.push('B');
                layout = Layout::parse(&descriptor).unwrap();
            }

            let count = layout.register_count().unwrap();
            let words: Vec<u16> = (0..count).map(|_| rng.gen()).collect();

            let values = decode(&words, &layout).unwrap();
            assert_eq!(values.len(), layout.value_count());
            let encoded = layout.encode(&values).unwrap();
            assert_eq!(encoded, words, "round trip failed for '{descriptor}'");
        }
    }
}
