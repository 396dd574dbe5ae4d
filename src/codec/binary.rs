//! MessagePack wire primitives over a growable buffer
//!
//! Writers take `&mut Vec<u8>` plus the offset to write at and return the
//! number of bytes written. The vector's length is the addressable capacity
//! and is grown (doubling) before every write; the caller tracks the logical
//! length through the offsets it accumulates. Readers take a slice whose
//! length is the logical end of the data and return `(value, bytes_read)`.
//!
//! Encoders always pick the narrowest representation. Decoders accept every
//! legal width for a logical value, and never read past the end of the slice.

use rmp::Marker;

use crate::error::{CodecError, Result};

/// Largest buffer length the codec will grow to.
///
/// Bounded by the signed 32-bit length field of the compression frame.
pub const MAX_BUFFER_LEN: usize = i32::MAX as usize;

const MIN_GROWTH: usize = 256;

/// Coarse classification of the value starting at a given tag byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WireType {
    Nil,
    Boolean,
    Integer,
    Float,
    String,
    Binary,
    Array,
    Map,
    Extension,
}

/// Extension-format header: application type code plus data length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtensionHeader {
    pub type_code: i8,
    pub length: u32,
}

/// Make room for `append_len` bytes at `offset`, preserving the written prefix.
pub fn ensure_capacity(bytes: &mut Vec<u8>, offset: usize, append_len: usize) -> Result<()> {
    let required = offset
        .checked_add(append_len)
        .ok_or(CodecError::Capacity {
            requested: usize::MAX,
        })?;
    if required <= bytes.len() {
        return Ok(());
    }
    if required > MAX_BUFFER_LEN {
        return Err(CodecError::Capacity {
            requested: required,
        });
    }

    let doubled = bytes.len().saturating_mul(2).max(MIN_GROWTH);
    let new_len = required.max(doubled).min(MAX_BUFFER_LEN);
    bytes.resize(new_len, 0);
    Ok(())
}

/// Copy raw bytes into the buffer at `offset`.
pub fn write_raw(bytes: &mut Vec<u8>, offset: usize, src: &[u8]) -> Result<usize> {
    ensure_capacity(bytes, offset, src.len())?;
    bytes[offset..offset + src.len()].copy_from_slice(src);
    Ok(src.len())
}

fn write_marker(bytes: &mut Vec<u8>, offset: usize, marker: Marker) -> Result<usize> {
    write_raw(bytes, offset, &[marker.to_u8()])
}

fn write_marked(bytes: &mut Vec<u8>, offset: usize, marker: Marker, payload: &[u8]) -> Result<usize> {
    ensure_capacity(bytes, offset, 1 + payload.len())?;
    bytes[offset] = marker.to_u8();
    bytes[offset + 1..offset + 1 + payload.len()].copy_from_slice(payload);
    Ok(1 + payload.len())
}

pub fn write_nil(bytes: &mut Vec<u8>, offset: usize) -> Result<usize> {
    write_marker(bytes, offset, Marker::Null)
}

pub fn write_bool(bytes: &mut Vec<u8>, offset: usize, value: bool) -> Result<usize> {
    write_marker(bytes, offset, if value { Marker::True } else { Marker::False })
}

/// Write a signed integer in its narrowest form.
///
/// Non-negative values use the unsigned families, as MessagePack encoders
/// conventionally do.
pub fn write_i64(bytes: &mut Vec<u8>, offset: usize, value: i64) -> Result<usize> {
    if value >= 0 {
        return write_u64(bytes, offset, value as u64);
    }
    if value >= -32 {
        write_marker(bytes, offset, Marker::FixNeg(value as i8))
    } else if value >= i8::MIN as i64 {
        write_marked(bytes, offset, Marker::I8, &(value as i8).to_be_bytes())
    } else if value >= i16::MIN as i64 {
        write_marked(bytes, offset, Marker::I16, &(value as i16).to_be_bytes())
    } else if value >= i32::MIN as i64 {
        write_marked(bytes, offset, Marker::I32, &(value as i32).to_be_bytes())
    } else {
        write_marked(bytes, offset, Marker::I64, &value.to_be_bytes())
    }
}

/// Write an unsigned integer in its narrowest form.
pub fn write_u64(bytes: &mut Vec<u8>, offset: usize, value: u64) -> Result<usize> {
    if value < 128 {
        write_marker(bytes, offset, Marker::FixPos(value as u8))
    } else if value <= u8::MAX as u64 {
        write_marked(bytes, offset, Marker::U8, &[value as u8])
    } else if value <= u16::MAX as u64 {
        write_marked(bytes, offset, Marker::U16, &(value as u16).to_be_bytes())
    } else if value <= u32::MAX as u64 {
        write_marked(bytes, offset, Marker::U32, &(value as u32).to_be_bytes())
    } else {
        write_marked(bytes, offset, Marker::U64, &value.to_be_bytes())
    }
}

/// Write an `int32` in its 5-byte form regardless of magnitude.
pub fn write_i32_force_i32_block(bytes: &mut Vec<u8>, offset: usize, value: i32) -> Result<usize> {
    write_marked(bytes, offset, Marker::I32, &value.to_be_bytes())
}

pub fn write_f32(bytes: &mut Vec<u8>, offset: usize, value: f32) -> Result<usize> {
    write_marked(bytes, offset, Marker::F32, &value.to_be_bytes())
}

pub fn write_f64(bytes: &mut Vec<u8>, offset: usize, value: f64) -> Result<usize> {
    write_marked(bytes, offset, Marker::F64, &value.to_be_bytes())
}

fn length_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| CodecError::Capacity { requested: len })
}

pub fn write_string(bytes: &mut Vec<u8>, offset: usize, value: &str) -> Result<usize> {
    let data = value.as_bytes();
    let len = length_u32(data.len())?;
    let header = if len < 32 {
        write_marker(bytes, offset, Marker::FixStr(len as u8))?
    } else if len <= u8::MAX as u32 {
        write_marked(bytes, offset, Marker::Str8, &[len as u8])?
    } else if len <= u16::MAX as u32 {
        write_marked(bytes, offset, Marker::Str16, &(len as u16).to_be_bytes())?
    } else {
        write_marked(bytes, offset, Marker::Str32, &len.to_be_bytes())?
    };
    Ok(header + write_raw(bytes, offset + header, data)?)
}

pub fn write_bin(bytes: &mut Vec<u8>, offset: usize, value: &[u8]) -> Result<usize> {
    let len = length_u32(value.len())?;
    let header = if len <= u8::MAX as u32 {
        write_marked(bytes, offset, Marker::Bin8, &[len as u8])?
    } else if len <= u16::MAX as u32 {
        write_marked(bytes, offset, Marker::Bin16, &(len as u16).to_be_bytes())?
    } else {
        write_marked(bytes, offset, Marker::Bin32, &len.to_be_bytes())?
    };
    Ok(header + write_raw(bytes, offset + header, value)?)
}

pub fn write_array_header(bytes: &mut Vec<u8>, offset: usize, count: u32) -> Result<usize> {
    if count < 16 {
        write_marker(bytes, offset, Marker::FixArray(count as u8))
    } else if count <= u16::MAX as u32 {
        write_marked(bytes, offset, Marker::Array16, &(count as u16).to_be_bytes())
    } else {
        write_marked(bytes, offset, Marker::Array32, &count.to_be_bytes())
    }
}

pub fn write_map_header(bytes: &mut Vec<u8>, offset: usize, count: u32) -> Result<usize> {
    if count < 16 {
        write_marker(bytes, offset, Marker::FixMap(count as u8))
    } else if count <= u16::MAX as u32 {
        write_marked(bytes, offset, Marker::Map16, &(count as u16).to_be_bytes())
    } else {
        write_marked(bytes, offset, Marker::Map32, &count.to_be_bytes())
    }
}

/// Write an extension header in its narrowest form.
pub fn write_extension_header(
    bytes: &mut Vec<u8>,
    offset: usize,
    type_code: i8,
    length: u32,
) -> Result<usize> {
    let code = type_code as u8;
    match length {
        1 => write_marked(bytes, offset, Marker::FixExt1, &[code]),
        2 => write_marked(bytes, offset, Marker::FixExt2, &[code]),
        4 => write_marked(bytes, offset, Marker::FixExt4, &[code]),
        8 => write_marked(bytes, offset, Marker::FixExt8, &[code]),
        16 => write_marked(bytes, offset, Marker::FixExt16, &[code]),
        len if len <= u8::MAX as u32 => write_marked(bytes, offset, Marker::Ext8, &[len as u8, code]),
        len if len <= u16::MAX as u32 => {
            let [hi, lo] = (len as u16).to_be_bytes();
            write_marked(bytes, offset, Marker::Ext16, &[hi, lo, code])
        }
        len => write_extension_header_force_ext32(bytes, offset, type_code, len),
    }
}

/// Write an `ext32` header (always 6 bytes) regardless of length.
pub fn write_extension_header_force_ext32(
    bytes: &mut Vec<u8>,
    offset: usize,
    type_code: i8,
    length: u32,
) -> Result<usize> {
    let [a, b, c, d] = length.to_be_bytes();
    write_marked(bytes, offset, Marker::Ext32, &[a, b, c, d, type_code as u8])
}

fn take(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    let available = bytes.len().saturating_sub(offset);
    if len > available {
        return Err(CodecError::Truncated {
            offset,
            needed: len,
            available,
        });
    }
    Ok(&bytes[offset..offset + len])
}

fn take_array<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(take(bytes, offset, N)?);
    Ok(out)
}

fn read_marker(bytes: &[u8], offset: usize) -> Result<Marker> {
    let [b] = take_array::<1>(bytes, offset)?;
    Ok(Marker::from_u8(b))
}

/// Classify the value whose tag byte sits at `offset`.
pub fn classify(bytes: &[u8], offset: usize) -> Result<WireType> {
    let wire = match read_marker(bytes, offset)? {
        Marker::Null => WireType::Nil,
        Marker::True | Marker::False => WireType::Boolean,
        Marker::FixPos(_)
        | Marker::FixNeg(_)
        | Marker::U8
        | Marker::U16
        | Marker::U32
        | Marker::U64
        | Marker::I8
        | Marker::I16
        | Marker::I32
        | Marker::I64 => WireType::Integer,
        Marker::F32 | Marker::F64 => WireType::Float,
        Marker::FixStr(_) | Marker::Str8 | Marker::Str16 | Marker::Str32 => WireType::String,
        Marker::Bin8 | Marker::Bin16 | Marker::Bin32 => WireType::Binary,
        Marker::FixArray(_) | Marker::Array16 | Marker::Array32 => WireType::Array,
        Marker::FixMap(_) | Marker::Map16 | Marker::Map32 => WireType::Map,
        Marker::FixExt1
        | Marker::FixExt2
        | Marker::FixExt4
        | Marker::FixExt8
        | Marker::FixExt16
        | Marker::Ext8
        | Marker::Ext16
        | Marker::Ext32 => WireType::Extension,
        Marker::Reserved => return Err(CodecError::format(offset, "reserved tag byte 0xc1")),
    };
    Ok(wire)
}

pub fn is_nil(bytes: &[u8], offset: usize) -> Result<bool> {
    Ok(matches!(read_marker(bytes, offset)?, Marker::Null))
}

pub fn read_nil(bytes: &[u8], offset: usize) -> Result<usize> {
    match read_marker(bytes, offset)? {
        Marker::Null => Ok(1),
        other => Err(unexpected(offset, "nil", other)),
    }
}

pub fn read_bool(bytes: &[u8], offset: usize) -> Result<(bool, usize)> {
    match read_marker(bytes, offset)? {
        Marker::True => Ok((true, 1)),
        Marker::False => Ok((false, 1)),
        other => Err(unexpected(offset, "boolean", other)),
    }
}

fn unexpected(offset: usize, expected: &str, found: Marker) -> CodecError {
    CodecError::format(
        offset,
        format!("expected {expected}, found tag 0x{:02x}", found.to_u8()),
    )
}

/// Any MessagePack integer, widened without loss.
#[derive(Clone, Copy)]
enum Integer {
    Signed(i64),
    Unsigned(u64),
}

fn read_integer(bytes: &[u8], offset: usize) -> Result<(Integer, usize)> {
    let body = offset + 1;
    let read = match read_marker(bytes, offset)? {
        Marker::FixPos(v) => (Integer::Unsigned(v as u64), 1),
        Marker::FixNeg(v) => (Integer::Signed(v as i64), 1),
        Marker::U8 => (Integer::Unsigned(take_array::<1>(bytes, body)?[0] as u64), 2),
        Marker::U16 => (Integer::Unsigned(u16::from_be_bytes(take_array(bytes, body)?) as u64), 3),
        Marker::U32 => (Integer::Unsigned(u32::from_be_bytes(take_array(bytes, body)?) as u64), 5),
        Marker::U64 => (Integer::Unsigned(u64::from_be_bytes(take_array(bytes, body)?)), 9),
        Marker::I8 => (Integer::Signed(i8::from_be_bytes(take_array(bytes, body)?) as i64), 2),
        Marker::I16 => (Integer::Signed(i16::from_be_bytes(take_array(bytes, body)?) as i64), 3),
        Marker::I32 => (Integer::Signed(i32::from_be_bytes(take_array(bytes, body)?) as i64), 5),
        Marker::I64 => (Integer::Signed(i64::from_be_bytes(take_array(bytes, body)?)), 9),
        other => return Err(unexpected(offset, "integer", other)),
    };
    Ok(read)
}

pub fn read_i64(bytes: &[u8], offset: usize) -> Result<(i64, usize)> {
    match read_integer(bytes, offset)? {
        (Integer::Signed(v), size) => Ok((v, size)),
        (Integer::Unsigned(v), size) => i64::try_from(v)
            .map(|v| (v, size))
            .map_err(|_| CodecError::format(offset, format!("{v} overflows i64"))),
    }
}

pub fn read_u64(bytes: &[u8], offset: usize) -> Result<(u64, usize)> {
    match read_integer(bytes, offset)? {
        (Integer::Unsigned(v), size) => Ok((v, size)),
        (Integer::Signed(v), size) => u64::try_from(v)
            .map(|v| (v, size))
            .map_err(|_| CodecError::format(offset, format!("{v} is negative"))),
    }
}

/// Read any integer encoding whose value fits in an `i32`.
pub fn read_i32(bytes: &[u8], offset: usize) -> Result<(i32, usize)> {
    let (v, size) = read_i64(bytes, offset)?;
    let v = i32::try_from(v).map_err(|_| CodecError::format(offset, format!("{v} overflows i32")))?;
    Ok((v, size))
}

pub fn read_f64(bytes: &[u8], offset: usize) -> Result<(f64, usize)> {
    match read_marker(bytes, offset)? {
        Marker::F32 => Ok((f32::from_be_bytes(take_array(bytes, offset + 1)?) as f64, 5)),
        Marker::F64 => Ok((f64::from_be_bytes(take_array(bytes, offset + 1)?), 9)),
        other => Err(unexpected(offset, "float", other)),
    }
}

pub fn read_f32(bytes: &[u8], offset: usize) -> Result<(f32, usize)> {
    match read_marker(bytes, offset)? {
        Marker::F32 => Ok((f32::from_be_bytes(take_array(bytes, offset + 1)?), 5)),
        other => Err(unexpected(offset, "float32", other)),
    }
}

/// Read a big-endian length prefix of 1, 2 or 4 bytes.
pub(crate) fn read_length(bytes: &[u8], offset: usize, width: usize) -> Result<u32> {
    Ok(match width {
        1 => take_array::<1>(bytes, offset)?[0] as u32,
        2 => u16::from_be_bytes(take_array(bytes, offset)?) as u32,
        _ => u32::from_be_bytes(take_array(bytes, offset)?),
    })
}

fn read_str_bytes(bytes: &[u8], offset: usize) -> Result<(&[u8], usize)> {
    let (len, header) = match read_marker(bytes, offset)? {
        Marker::FixStr(len) => (len as u32, 1),
        Marker::Str8 => (read_length(bytes, offset + 1, 1)?, 2),
        Marker::Str16 => (read_length(bytes, offset + 1, 2)?, 3),
        Marker::Str32 => (read_length(bytes, offset + 1, 4)?, 5),
        other => return Err(unexpected(offset, "string", other)),
    };
    let data = take(bytes, offset + header, len as usize)?;
    Ok((data, header + len as usize))
}

pub fn read_str(bytes: &[u8], offset: usize) -> Result<(&str, usize)> {
    let (data, size) = read_str_bytes(bytes, offset)?;
    let s = std::str::from_utf8(data)
        .map_err(|e| CodecError::format(offset, format!("string is not valid UTF-8: {e}")))?;
    Ok((s, size))
}

pub fn read_string(bytes: &[u8], offset: usize) -> Result<(String, usize)> {
    let (s, size) = read_str(bytes, offset)?;
    Ok((s.to_owned(), size))
}

pub fn read_bin(bytes: &[u8], offset: usize) -> Result<(&[u8], usize)> {
    let (len, header) = match read_marker(bytes, offset)? {
        Marker::Bin8 => (read_length(bytes, offset + 1, 1)?, 2),
        Marker::Bin16 => (read_length(bytes, offset + 1, 2)?, 3),
        Marker::Bin32 => (read_length(bytes, offset + 1, 4)?, 5),
        other => return Err(unexpected(offset, "binary", other)),
    };
    let data = take(bytes, offset + header, len as usize)?;
    Ok((data, header + len as usize))
}

pub fn read_array_header(bytes: &[u8], offset: usize) -> Result<(u32, usize)> {
    match read_marker(bytes, offset)? {
        Marker::FixArray(n) => Ok((n as u32, 1)),
        Marker::Array16 => Ok((read_length(bytes, offset + 1, 2)?, 3)),
        Marker::Array32 => Ok((read_length(bytes, offset + 1, 4)?, 5)),
        other => Err(unexpected(offset, "array", other)),
    }
}

pub fn read_map_header(bytes: &[u8], offset: usize) -> Result<(u32, usize)> {
    match read_marker(bytes, offset)? {
        Marker::FixMap(n) => Ok((n as u32, 1)),
        Marker::Map16 => Ok((read_length(bytes, offset + 1, 2)?, 3)),
        Marker::Map32 => Ok((read_length(bytes, offset + 1, 4)?, 5)),
        other => Err(unexpected(offset, "map", other)),
    }
}

pub fn read_extension_header(bytes: &[u8], offset: usize) -> Result<(ExtensionHeader, usize)> {
    let (length, header) = match read_marker(bytes, offset)? {
        Marker::FixExt1 => (1, 1),
        Marker::FixExt2 => (2, 1),
        Marker::FixExt4 => (4, 1),
        Marker::FixExt8 => (8, 1),
        Marker::FixExt16 => (16, 1),
        Marker::Ext8 => (read_length(bytes, offset + 1, 1)?, 2),
        Marker::Ext16 => (read_length(bytes, offset + 1, 2)?, 3),
        Marker::Ext32 => (read_length(bytes, offset + 1, 4)?, 5),
        other => return Err(unexpected(offset, "extension", other)),
    };
    let [code] = take_array::<1>(bytes, offset + header)?;
    Ok((
        ExtensionHeader {
            type_code: code as i8,
            length,
        },
        header + 1,
    ))
}

/// What follows a tag byte on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Layout {
    /// A fixed number of body bytes.
    Fixed(usize),
    /// A big-endian length prefix of `width` bytes, then `length + extra` bytes.
    Prefixed { width: usize, extra: usize },
    /// `count * per_item` nested values, count known from the tag itself.
    Items { count: u32, per_item: u32 },
    /// A `width`-byte count prefix, then `count * per_item` nested values.
    CountedItems { width: usize, per_item: u32 },
    Invalid,
}

pub(crate) fn layout(marker: Marker) -> Layout {
    match marker {
        Marker::Null | Marker::True | Marker::False | Marker::FixPos(_) | Marker::FixNeg(_) => {
            Layout::Fixed(0)
        }
        Marker::U8 | Marker::I8 => Layout::Fixed(1),
        Marker::U16 | Marker::I16 => Layout::Fixed(2),
        Marker::U32 | Marker::I32 | Marker::F32 => Layout::Fixed(4),
        Marker::U64 | Marker::I64 | Marker::F64 => Layout::Fixed(8),
        Marker::FixStr(n) => Layout::Fixed(n as usize),
        Marker::Str8 | Marker::Bin8 => Layout::Prefixed { width: 1, extra: 0 },
        Marker::Str16 | Marker::Bin16 => Layout::Prefixed { width: 2, extra: 0 },
        Marker::Str32 | Marker::Bin32 => Layout::Prefixed { width: 4, extra: 0 },
        Marker::FixArray(n) => Layout::Items {
            count: n as u32,
            per_item: 1,
        },
        Marker::Array16 => Layout::CountedItems { width: 2, per_item: 1 },
        Marker::Array32 => Layout::CountedItems { width: 4, per_item: 1 },
        Marker::FixMap(n) => Layout::Items {
            count: n as u32,
            per_item: 2,
        },
        Marker::Map16 => Layout::CountedItems { width: 2, per_item: 2 },
        Marker::Map32 => Layout::CountedItems { width: 4, per_item: 2 },
        Marker::FixExt1 => Layout::Fixed(2),
        Marker::FixExt2 => Layout::Fixed(3),
        Marker::FixExt4 => Layout::Fixed(5),
        Marker::FixExt8 => Layout::Fixed(9),
        Marker::FixExt16 => Layout::Fixed(17),
        Marker::Ext8 => Layout::Prefixed { width: 1, extra: 1 },
        Marker::Ext16 => Layout::Prefixed { width: 2, extra: 1 },
        Marker::Ext32 => Layout::Prefixed { width: 4, extra: 1 },
        Marker::Reserved => Layout::Invalid,
    }
}

/// Size in bytes of the complete value (including nested values) at `offset`.
pub fn read_next(bytes: &[u8], offset: usize) -> Result<usize> {
    let mut cursor = offset;
    let mut pending: u64 = 1;
    while pending > 0 {
        pending -= 1;
        let tag_offset = cursor;
        let marker = read_marker(bytes, cursor)?;
        cursor += 1;
        match layout(marker) {
            Layout::Fixed(n) => {
                take(bytes, cursor, n)?;
                cursor += n;
            }
            Layout::Prefixed { width, extra } => {
                let len = read_length(bytes, cursor, width)? as usize + extra;
                cursor += width;
                take(bytes, cursor, len)?;
                cursor += len;
            }
            Layout::Items { count, per_item } => pending += count as u64 * per_item as u64,
            Layout::CountedItems { width, per_item } => {
                let count = read_length(bytes, cursor, width)?;
                cursor += width;
                pending += count as u64 * per_item as u64;
            }
            Layout::Invalid => {
                return Err(CodecError::format(tag_offset, "reserved tag byte 0xc1"))
            }
        }
    }
    Ok(cursor - offset)
}
