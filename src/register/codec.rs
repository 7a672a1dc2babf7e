//! Wire byte handling: register/byte packing, byte-order normalization and
//! per-type decoding.
//!
//! Registers travel big-endian, so a run of words maps onto a byte buffer by
//! concatenating each word's high then low byte. Multi-byte values are then
//! rearranged per [`ByteOrder`] before interpretation. Every ordering is its
//! own inverse, so the same transform serves decode and encode.

use crate::register::Value;
use crate::types::{ByteOrder, DataType};

pub fn registers_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| match *pair {
            [hi, lo] => u16::from_be_bytes([hi, lo]),
            [hi] => u16::from_be_bytes([hi, 0]),
            _ => 0,
        })
        .collect()
}

pub fn reorder(bytes: &[u8], order: ByteOrder) -> Vec<u8> {
    match order {
        ByteOrder::AbCd => bytes.to_vec(),
        ByteOrder::CdAb => bytes.chunks(2).rev().flatten().copied().collect(),
        ByteOrder::BaDc => bytes
            .chunks(2)
            .flat_map(|pair| pair.iter().rev())
            .copied()
            .collect(),
        ByteOrder::DcBa => bytes.iter().rev().copied().collect(),
    }
}

fn take<const N: usize>(bytes: &[u8], order: ByteOrder) -> Result<[u8; N], String> {
    if bytes.len() < N {
        return Err(format!("expected {N} bytes, got {}", bytes.len()));
    }
    let ordered = reorder(&bytes[..N], order);
    let mut out = [0u8; N];
    out.copy_from_slice(&ordered);
    Ok(out)
}

/// Interprets wire bytes as a value of `data_type`.
pub fn decode(bytes: &[u8], data_type: DataType, order: ByteOrder) -> Result<Value, String> {
    if bytes.is_empty() {
        return Err("no data".to_string());
    }
    let value = match data_type {
        DataType::Bit => Value::Bit(bytes.iter().any(|b| *b != 0)),
        DataType::Byte => Value::Byte(if bytes.len() >= 2 { bytes[1] } else { bytes[0] }),
        DataType::Word => Value::Word(u16::from_be_bytes(take(bytes, order)?)),
        DataType::Int16 => Value::Int16(i16::from_be_bytes(take(bytes, order)?)),
        DataType::DWord => Value::DWord(u32::from_be_bytes(take(bytes, order)?)),
        DataType::DInt32 => Value::DInt32(i32::from_be_bytes(take(bytes, order)?)),
        DataType::Float32 => Value::Float32(f32::from_be_bytes(take(bytes, order)?)),
        DataType::Float64 => Value::Float64(f64::from_be_bytes(take(bytes, order)?)),
        DataType::String => {
            let text: String = bytes
                .iter()
                .take_while(|b| **b != 0)
                .map(|b| char::from(*b))
                .collect();
            Value::String(text)
        }
        DataType::WString => {
            let units: Vec<u16> = bytes_to_registers(bytes)
                .into_iter()
                .take_while(|u| *u != 0)
                .collect();
            Value::WString(String::from_utf16_lossy(&units))
        }
    };
    Ok(value)
}

/// Serializes `value` into wire bytes. Text is padded with NULs (or cut) to
/// `string_length` registers.
pub fn encode(value: &Value, order: ByteOrder, string_length: u16) -> Vec<u8> {
    let text_bytes = usize::from(string_length) * 2;
    match value {
        Value::Bit(b) => vec![0, u8::from(*b)],
        Value::Byte(v) => vec![0, *v],
        Value::Word(v) => reorder(&v.to_be_bytes(), order),
        Value::Int16(v) => reorder(&v.to_be_bytes(), order),
        Value::DWord(v) => reorder(&v.to_be_bytes(), order),
        Value::DInt32(v) => reorder(&v.to_be_bytes(), order),
        Value::Float32(v) => reorder(&v.to_be_bytes(), order),
        Value::Float64(v) => reorder(&v.to_be_bytes(), order),
        Value::String(s) => {
            let mut out: Vec<u8> = s
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect();
            out.resize(text_bytes, 0);
            out
        }
        Value::WString(s) => {
            let mut out: Vec<u8> = s.encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
            out.resize(text_bytes, 0);
            out
        }
    }
}
