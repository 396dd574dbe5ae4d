//! Top-level encode/decode helpers
//!
//! - `*_msgpack`: plain MessagePack through a given resolver
//! - `to_lz4` / `from_lz4`: compression framing through the process default
//!   resolver ([`default_resolver`])

use std::io::{Read, Write};

use super::buffer::{BufferPool, DEFAULT_MINIMUM_LENGTH};
use super::envelope::Lz4Serializer;
use super::resolver::{default_resolver, FormatterResolver};
use super::stream::{self, ReadMode};
use crate::error::Result;

/// Encode `value` as MessagePack, without compression framing.
///
/// # Examples
/// ```
/// use msgpack_lz4::{to_msgpack, FormatterResolver, StandardResolver};
///
/// let standard = StandardResolver::new();
/// let resolver: &dyn FormatterResolver = &standard;
/// assert_eq!(to_msgpack(&1000i32, resolver).unwrap(), vec![0xcd, 0x03, 0xe8]);
/// ```
pub fn to_msgpack<T: 'static>(value: &T, resolver: &dyn FormatterResolver) -> Result<Vec<u8>> {
    let formatter = resolver.get_formatter_with_verify::<T>()?;
    let mut scratch = BufferPool::shared().rent(DEFAULT_MINIMUM_LENGTH);
    let len = formatter.serialize(&mut scratch, 0, value, resolver)?;
    Ok(scratch[..len].to_vec())
}

/// Encode `value` as MessagePack into `writer`.
pub fn write_msgpack<T, W>(writer: &mut W, value: &T, resolver: &dyn FormatterResolver) -> Result<()>
where
    T: 'static,
    W: Write + ?Sized,
{
    let formatter = resolver.get_formatter_with_verify::<T>()?;
    let mut scratch = BufferPool::shared().rent(DEFAULT_MINIMUM_LENGTH);
    let len = formatter.serialize(&mut scratch, 0, value, resolver)?;
    writer.write_all(&scratch[..len])?;
    Ok(())
}

/// Decode a MessagePack value. Trailing bytes are ignored.
///
/// # Examples
/// ```
/// use msgpack_lz4::{from_msgpack, FormatterResolver, StandardResolver};
///
/// let standard = StandardResolver::new();
/// let resolver: &dyn FormatterResolver = &standard;
/// // the same value in a wider encoding than an encoder would pick
/// let value: i32 = from_msgpack(&[0xd3, 0, 0, 0, 0, 0, 0, 0x03, 0xe8], resolver).unwrap();
/// assert_eq!(value, 1000);
/// ```
pub fn from_msgpack<T: 'static>(bytes: &[u8], resolver: &dyn FormatterResolver) -> Result<T> {
    let formatter = resolver.get_formatter_with_verify::<T>()?;
    let (value, _) = formatter.deserialize(bytes, 0, resolver)?;
    Ok(value)
}

/// Read and decode one MessagePack value from `reader`.
pub fn read_msgpack<T, R>(reader: &mut R, resolver: &dyn FormatterResolver, mode: ReadMode) -> Result<T>
where
    T: 'static,
    R: Read + ?Sized,
{
    match mode {
        ReadMode::Buffered => {
            let mut buffer = BufferPool::shared().rent(DEFAULT_MINIMUM_LENGTH);
            let len = stream::fill_from_reader(reader, &mut buffer)?;
            from_msgpack(&buffer[..len], resolver)
        }
        ReadMode::Strict => from_msgpack(&stream::read_message_block(reader)?, resolver),
    }
}

/// Encode with compression framing, using the default resolver.
///
/// # Examples
/// ```
/// use msgpack_lz4::{from_lz4, to_lz4};
///
/// let words: Vec<String> = (0..50).map(|i| format!("word{}", i % 5)).collect();
/// let bytes = to_lz4(&words).unwrap();
/// let decoded: Vec<String> = from_lz4(&bytes).unwrap();
/// assert_eq!(decoded, words);
/// ```
pub fn to_lz4<T: 'static>(value: &T) -> Result<Vec<u8>> {
    let resolver = default_resolver();
    Lz4Serializer::default().serialize(value, &*resolver)
}

/// Decode framed or unframed bytes, using the default resolver.
pub fn from_lz4<T: 'static>(bytes: &[u8]) -> Result<T> {
    let resolver = default_resolver();
    Lz4Serializer::default().deserialize(bytes, &*resolver)
}
