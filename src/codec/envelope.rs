//! LZ4 compression frame
//!
//! A MessagePack payload of [`NOT_COMPRESSION_SIZE`] bytes or more is
//! LZ4-block-compressed and wrapped in an extension value with type code
//! [`EXTENSION_TYPE_CODE`]. Shorter payloads pass through unchanged, and a
//! decoder tells the two apart by the leading tag byte.
//!
//! ```text
//! offset  bytes  field
//! 0       1      0xc9 (ext32, even when a narrower header would fit)
//! 1..5    4      big-endian extension length = compressed length + 5
//! 5       1      type code 99
//! 6..11   5      0xd2 + big-endian i32 uncompressed length
//! 11..    N      LZ4 block
//! ```
//!
//! Both header fields have a fixed width so the frame can be written with
//! the compressed bytes landing at a known offset and the header patched in
//! afterwards.

use std::borrow::Cow;
use std::io::{Read, Write};
use std::sync::Arc;

use lz4_flex::block::{compress_into, decompress_into, get_maximum_output_size};

use super::binary::{self, WireType};
use super::buffer::{BufferPool, PooledBuffer, DEFAULT_MINIMUM_LENGTH};
use super::options::SerializerOptions;
use super::resolver::{Formatter, FormatterResolver};
use super::stream::{self, ReadMode};
use crate::error::{CodecError, Result};

/// Extension type code reserved for compression frames.
pub const EXTENSION_TYPE_CODE: i8 = 99;

/// Payloads shorter than this are never framed.
pub const NOT_COMPRESSION_SIZE: usize = 64;

const EXT32_HEADER_LEN: usize = 6;
const LENGTH_FIELD_LEN: usize = 5;

/// Fixed bytes ahead of the compressed payload.
pub const FRAME_HEADER_LEN: usize = EXT32_HEADER_LEN + LENGTH_FIELD_LEN;

/// A compression frame found in a byte slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Position of the frame's leading tag in the source slice.
    pub offset: usize,
    /// Declared length of the decompressed payload.
    pub uncompressed_len: usize,
    /// The LZ4 block.
    pub compressed: &'a [u8],
    /// Bytes the whole frame occupies, header included.
    pub frame_len: usize,
}

impl Frame<'_> {
    /// Decompress into `out`, which must be exactly `uncompressed_len` long.
    pub fn decompress_into(&self, out: &mut [u8]) -> Result<()> {
        let written = decompress_into(self.compressed, out)?;
        if written != self.uncompressed_len {
            return Err(CodecError::format(
                self.offset,
                format!(
                    "frame declares {} uncompressed bytes, block holds {}",
                    self.uncompressed_len, written
                ),
            ));
        }
        Ok(())
    }

    /// Decompress into a new buffer of exactly the declared length.
    pub fn decompress(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.uncompressed_len];
        self.decompress_into(&mut out)?;
        Ok(out)
    }
}

/// Largest output an LZ4 block of `compressed_len` bytes can decode to.
fn max_decompressed_len(compressed_len: usize) -> usize {
    compressed_len.saturating_mul(255).saturating_add(16)
}

/// Locate a compression frame at `offset`.
///
/// `Ok(None)` when the value there is anything other than an extension with
/// the reserved type code. A declared length the block could never expand
/// to is rejected here, before any buffer is sized from it.
pub fn parse_frame(bytes: &[u8], offset: usize) -> Result<Option<Frame<'_>>> {
    if !matches!(binary::classify(bytes, offset), Ok(WireType::Extension)) {
        return Ok(None);
    }
    let (header, header_len) = binary::read_extension_header(bytes, offset)?;
    if header.type_code != EXTENSION_TYPE_CODE {
        return Ok(None);
    }

    let body = offset + header_len;
    let (uncompressed, length_len) = binary::read_i32(bytes, body)?;
    let uncompressed_len = usize::try_from(uncompressed)
        .map_err(|_| CodecError::format(body, format!("negative uncompressed length {uncompressed}")))?;
    let ext_len = header.length as usize;
    let compressed_len = ext_len
        .checked_sub(length_len)
        .ok_or_else(|| CodecError::format(offset, "extension shorter than its length field"))?;

    let start = body + length_len;
    let available = bytes.len().saturating_sub(start);
    if compressed_len > available {
        return Err(CodecError::Truncated {
            offset: start,
            needed: compressed_len,
            available,
        });
    }
    if uncompressed_len > max_decompressed_len(compressed_len) {
        return Err(CodecError::format(
            body,
            format!("frame declares {uncompressed_len} uncompressed bytes for a {compressed_len} byte block"),
        ));
    }
    Ok(Some(Frame {
        offset,
        uncompressed_len,
        compressed: &bytes[start..start + compressed_len],
        frame_len: header_len + ext_len,
    }))
}

/// Compress `raw` into a frame at `offset` in `dest`; returns the frame length.
///
/// The LZ4 block is written straight into `dest` past the reserved header.
pub fn write_frame(dest: &mut Vec<u8>, offset: usize, raw: &[u8]) -> Result<usize> {
    let uncompressed = i32::try_from(raw.len()).map_err(|_| CodecError::Capacity {
        requested: raw.len(),
    })?;
    let max_compressed = get_maximum_output_size(raw.len());
    binary::ensure_capacity(dest, offset, FRAME_HEADER_LEN + max_compressed)?;

    let start = offset + FRAME_HEADER_LEN;
    let compressed_len = compress_into(raw, &mut dest[start..start + max_compressed])?;
    let ext_len = u32::try_from(compressed_len + LENGTH_FIELD_LEN).map_err(|_| CodecError::Capacity {
        requested: compressed_len,
    })?;

    binary::write_extension_header_force_ext32(dest, offset, EXTENSION_TYPE_CODE, ext_len)?;
    binary::write_i32_force_i32_block(dest, offset + EXT32_HEADER_LEN, uncompressed)?;
    trace_event!("framed {} bytes into {}", raw.len(), FRAME_HEADER_LEN + compressed_len);
    Ok(FRAME_HEADER_LEN + compressed_len)
}

/// Undo compression framing.
///
/// Framed input is decompressed into a new buffer of exactly the declared
/// length; anything else is returned borrowed, unchanged.
pub fn decode(bytes: &[u8]) -> Result<Cow<'_, [u8]>> {
    match parse_frame(bytes, 0)? {
        Some(frame) => frame.decompress().map(Cow::Owned),
        None => Ok(Cow::Borrowed(bytes)),
    }
}

/// Serializer that frames large payloads with LZ4.
///
/// # Examples
/// ```
/// use msgpack_lz4::{FormatterResolver, Lz4Serializer, StandardResolver};
///
/// let standard = StandardResolver::new();
/// let resolver: &dyn FormatterResolver = &standard;
/// let serializer = Lz4Serializer::default();
///
/// let text = "abc".repeat(100);
/// let bytes = serializer.serialize(&text, resolver).unwrap();
/// assert_eq!(bytes[0], 0xc9);
/// assert!(bytes.len() < text.len());
///
/// let decoded: String = serializer.deserialize(&bytes, resolver).unwrap();
/// assert_eq!(decoded, text);
/// ```
#[derive(Clone, Copy)]
pub struct Lz4Serializer<'p> {
    pool: &'p BufferPool,
    options: SerializerOptions,
}

impl Lz4Serializer<'static> {
    /// A serializer renting from the process-wide pool.
    pub fn new(options: SerializerOptions) -> Self {
        Self::with_pool(BufferPool::shared(), options)
    }
}

impl Default for Lz4Serializer<'static> {
    fn default() -> Self {
        Self::new(SerializerOptions::default())
    }
}

impl<'p> Lz4Serializer<'p> {
    pub fn with_pool(pool: &'p BufferPool, options: SerializerOptions) -> Self {
        Self { pool, options }
    }

    pub fn options(&self) -> &SerializerOptions {
        &self.options
    }

    fn rent(&self, minimum_length: usize) -> PooledBuffer<'p> {
        self.pool.rent_with(
            minimum_length.max(self.options.minimum_buffer_length),
            self.options.clear_buffers_on_return,
        )
    }

    /// Encode `value` and hand the final bytes, framed or not, to `emit`.
    fn encode_with<T, R>(
        &self,
        value: &T,
        resolver: &dyn FormatterResolver,
        emit: impl FnOnce(&[u8]) -> Result<R>,
    ) -> Result<R>
    where
        T: 'static,
    {
        let formatter = resolver.get_formatter_with_verify::<T>()?;
        let mut scratch = self.rent(0);
        let len = formatter.serialize(&mut scratch, 0, value, resolver)?;
        if len < self.options.compression_threshold {
            trace_event!("{} byte payload below threshold, not framed", len);
            return emit(&scratch[..len]);
        }

        let mut framed = self.rent(FRAME_HEADER_LEN + get_maximum_output_size(len));
        let framed_len = write_frame(&mut framed, 0, &scratch[..len])?;
        emit(&framed[..framed_len])
    }

    pub fn serialize<T: 'static>(&self, value: &T, resolver: &dyn FormatterResolver) -> Result<Vec<u8>> {
        self.encode_with(value, resolver, |bytes| Ok(bytes.to_vec()))
    }

    pub fn serialize_to_writer<T, W>(
        &self,
        writer: &mut W,
        value: &T,
        resolver: &dyn FormatterResolver,
    ) -> Result<()>
    where
        T: 'static,
        W: Write + ?Sized,
    {
        self.encode_with(value, resolver, |bytes| {
            writer.write_all(bytes)?;
            Ok(())
        })
    }

    /// Encode `value` into `bytes` at `offset`; returns the bytes written.
    ///
    /// The LZ4 block is compressed directly into `bytes`.
    pub fn serialize_to_block<T: 'static>(
        &self,
        bytes: &mut Vec<u8>,
        offset: usize,
        value: &T,
        resolver: &dyn FormatterResolver,
    ) -> Result<usize> {
        let formatter = resolver.get_formatter_with_verify::<T>()?;
        let mut scratch = self.rent(0);
        let len = formatter.serialize(&mut scratch, 0, value, resolver)?;
        if len < self.options.compression_threshold {
            return binary::write_raw(bytes, offset, &scratch[..len]);
        }
        write_frame(bytes, offset, &scratch[..len])
    }

    /// Frame an already encoded MessagePack payload.
    pub fn to_lz4_binary(&self, msgpack: &[u8]) -> Result<Vec<u8>> {
        if msgpack.len() < self.options.compression_threshold {
            return Ok(msgpack.to_vec());
        }
        let mut framed = self.rent(FRAME_HEADER_LEN + get_maximum_output_size(msgpack.len()));
        let framed_len = write_frame(&mut framed, 0, msgpack)?;
        Ok(framed[..framed_len].to_vec())
    }

    /// Decode a value, decompressing first if the input is framed.
    pub fn deserialize<T: 'static>(&self, bytes: &[u8], resolver: &dyn FormatterResolver) -> Result<T> {
        let formatter = resolver.get_formatter_with_verify::<T>()?;
        match parse_frame(bytes, 0)? {
            Some(frame) => {
                let mut buffer = self.rent(frame.uncompressed_len);
                let raw = &mut buffer[..frame.uncompressed_len];
                frame.decompress_into(raw)?;
                let (value, _) = formatter.deserialize(raw, 0, resolver)?;
                Ok(value)
            }
            None => {
                let (value, _) = formatter.deserialize(bytes, 0, resolver)?;
                Ok(value)
            }
        }
    }

    pub fn deserialize_from_reader<T, R>(
        &self,
        reader: &mut R,
        resolver: &dyn FormatterResolver,
        mode: ReadMode,
    ) -> Result<T>
    where
        T: 'static,
        R: Read + ?Sized,
    {
        match mode {
            ReadMode::Buffered => {
                let mut buffer = self.rent(0);
                let len = stream::fill_from_reader(reader, &mut buffer)?;
                self.deserialize(&buffer[..len], resolver)
            }
            ReadMode::Strict => {
                let block = stream::read_message_block(reader)?;
                self.deserialize(&block, resolver)
            }
        }
    }

    /// Read one payload from `reader` and undo its compression framing.
    pub fn decode_from_reader<R: Read + ?Sized>(&self, reader: &mut R, mode: ReadMode) -> Result<Vec<u8>> {
        match mode {
            ReadMode::Buffered => {
                let mut buffer = self.rent(0);
                let len = stream::fill_from_reader(reader, &mut buffer)?;
                decode(&buffer[..len]).map(Cow::into_owned)
            }
            ReadMode::Strict => {
                let block = stream::read_message_block(reader)?;
                let decompressed = match decode(&block)? {
                    Cow::Owned(raw) => Some(raw),
                    Cow::Borrowed(_) => None,
                };
                Ok(decompressed.unwrap_or(block))
            }
        }
    }
}

/// Formatter that frames the encoding of an inner formatter.
///
/// Lets a nested value, such as an embedded-type payload, carry its own
/// compression frame.
pub struct Lz4Formatter<T> {
    inner: Arc<dyn Formatter<T>>,
    threshold: usize,
}

impl<T> Lz4Formatter<T> {
    pub fn new<F: Formatter<T> + 'static>(inner: F) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    pub fn from_arc(inner: Arc<dyn Formatter<T>>) -> Self {
        Self {
            inner,
            threshold: NOT_COMPRESSION_SIZE,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }
}

impl<T: 'static> Formatter<T> for Lz4Formatter<T> {
    fn serialize(
        &self,
        bytes: &mut Vec<u8>,
        offset: usize,
        value: &T,
        resolver: &dyn FormatterResolver,
    ) -> Result<usize> {
        let mut scratch = BufferPool::shared().rent(DEFAULT_MINIMUM_LENGTH);
        let len = self.inner.serialize(&mut scratch, 0, value, resolver)?;
        if len < self.threshold {
            return binary::write_raw(bytes, offset, &scratch[..len]);
        }
        write_frame(bytes, offset, &scratch[..len])
    }

    fn deserialize(
        &self,
        bytes: &[u8],
        offset: usize,
        resolver: &dyn FormatterResolver,
    ) -> Result<(T, usize)> {
        match parse_frame(bytes, offset)? {
            Some(frame) => {
                let mut buffer = BufferPool::shared().rent(frame.uncompressed_len);
                let raw = &mut buffer[..frame.uncompressed_len];
                frame.decompress_into(raw)?;
                let (value, _) = self.inner.deserialize(raw, 0, resolver)?;
                Ok((value, frame.frame_len))
            }
            None => self.inner.deserialize(bytes, offset, resolver),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::formatters::{BytesFormatter, StandardResolver};
    use std::io::Cursor;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 7) as u8).collect()
    }

    #[test]
    fn test_frame_layout() {
        let raw = vec![0x11u8; 200];
        let mut dest = Vec::new();
        let n = write_frame(&mut dest, 0, &raw).unwrap();

        assert_eq!(dest[0], 0xc9);
        let ext_len = u32::from_be_bytes([dest[1], dest[2], dest[3], dest[4]]) as usize;
        assert_eq!(ext_len, n - FRAME_HEADER_LEN + 5);
        assert_eq!(dest[5] as i8, EXTENSION_TYPE_CODE);
        assert_eq!(dest[6], 0xd2);
        assert_eq!(&dest[7..11], &200i32.to_be_bytes());

        let frame = parse_frame(&dest[..n], 0).unwrap().unwrap();
        assert_eq!(frame.uncompressed_len, 200);
        assert_eq!(frame.frame_len, n);
        assert_eq!(frame.decompress().unwrap(), raw);
    }

    #[test]
    fn test_frame_at_offset_keeps_prefix() {
        let mut dest = b"head".to_vec();
        let raw = payload(500);
        let n = write_frame(&mut dest, 4, &raw).unwrap();
        assert_eq!(&dest[..4], b"head");
        assert_eq!(decode(&dest[4..4 + n]).unwrap().as_ref(), &raw[..]);
    }

    #[test]
    fn test_decode_passes_through_unframed() {
        let plain = [0x92, 0x01, 0x02];
        assert!(matches!(decode(&plain).unwrap(), Cow::Borrowed(_)));
        assert!(matches!(decode(&[]).unwrap(), Cow::Borrowed(_)));
        // another extension type code is not a frame
        let other_ext = [0xd4, 0x05, 0x00];
        assert_eq!(decode(&other_ext).unwrap().as_ref(), &other_ext);
    }

    #[test]
    fn test_decode_accepts_narrow_headers() {
        let raw = payload(100);
        let block = lz4_flex::block::compress(&raw);
        let mut framed = Vec::new();
        // length as a positive fixint, one byte
        let ext_len = (block.len() + 1) as u32;
        let mut n = binary::write_extension_header(&mut framed, 0, EXTENSION_TYPE_CODE, ext_len).unwrap();
        n += binary::write_u64(&mut framed, n, 100).unwrap();
        n += binary::write_raw(&mut framed, n, &block).unwrap();
        assert_ne!(framed[0], 0xc9);
        assert_eq!(decode(&framed[..n]).unwrap().as_ref(), &raw[..]);
    }

    #[test]
    fn test_declared_length_must_match() {
        let raw = payload(300);
        let mut dest = Vec::new();
        let n = write_frame(&mut dest, 0, &raw).unwrap();
        dest[7..11].copy_from_slice(&299i32.to_be_bytes());
        assert!(decode(&dest[..n]).is_err());

        dest[7..11].copy_from_slice(&301i32.to_be_bytes());
        assert!(decode(&dest[..n]).is_err());
    }

    #[test]
    fn test_declared_length_beyond_block_capacity() {
        // ext32 of 6 bytes: i32::MAX declared, one byte of block
        let hostile = [0xc9, 0x00, 0x00, 0x00, 0x06, 0x63, 0xd2, 0x7f, 0xff, 0xff, 0xff, 0x00];
        match parse_frame(&hostile, 0).unwrap_err() {
            CodecError::Format { offset, .. } => assert_eq!(offset, 6),
            other => panic!("unexpected error: {other:?}"),
        }

        let standard = StandardResolver::new();
        let resolver: &dyn FormatterResolver = &standard;
        let pool = BufferPool::new();
        let serializer = Lz4Serializer::with_pool(
            &pool,
            SerializerOptions {
                clear_buffers_on_return: true,
                ..SerializerOptions::default()
            },
        );
        let err = serializer.deserialize::<Vec<u8>>(&hostile, resolver).unwrap_err();
        assert!(err.is_format_error());
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn test_highly_compressible_payload_within_capacity() {
        let raw = vec![0u8; 1 << 20];
        let mut dest = Vec::new();
        let n = write_frame(&mut dest, 0, &raw).unwrap();
        let frame = parse_frame(&dest[..n], 0).unwrap().unwrap();
        assert!(frame.uncompressed_len <= max_decompressed_len(frame.compressed.len()));
        assert_eq!(frame.decompress().unwrap(), raw);
    }

    #[test]
    fn test_nested_frame_error_reports_frame_offset() {
        let standard = StandardResolver::new();
        let resolver: &dyn FormatterResolver = &standard;
        let formatter: Lz4Formatter<Vec<u8>> = Lz4Formatter::new(BytesFormatter);

        let mut bytes = vec![0x90, 0x90, 0x90];
        let n = formatter.serialize(&mut bytes, 3, &payload(2000), resolver).unwrap();
        // declare one byte more than the block produces
        let declared = 3 + EXT32_HEADER_LEN + 1;
        bytes[declared..declared + 4].copy_from_slice(&2004i32.to_be_bytes());

        let frame = parse_frame(&bytes[..3 + n], 3).unwrap().unwrap();
        assert_eq!(frame.offset, 3);
        match formatter.deserialize(&bytes[..3 + n], 3, resolver).unwrap_err() {
            CodecError::Format { offset, .. } => assert_eq!(offset, 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_truncated_frame() {
        let mut dest = Vec::new();
        let n = write_frame(&mut dest, 0, &payload(300)).unwrap();
        let err = decode(&dest[..n - 1]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn test_threshold_boundary() {
        let standard = StandardResolver::new();
        let resolver: &dyn FormatterResolver = &standard;
        let serializer = Lz4Serializer::default();

        // bin8 header is 2 bytes
        for (data_len, framed) in [(61usize, false), (62, true), (63, true)] {
            let data = vec![0u8; data_len];
            let bytes = serializer.serialize(&data, resolver).unwrap();
            assert_eq!(bytes[0] == 0xc9, framed, "encoded length {}", data_len + 2);
            let decoded: Vec<u8> = serializer.deserialize(&bytes, resolver).unwrap();
            assert_eq!(decoded, data);
        }
    }

    #[test]
    fn test_serialize_to_block_matches_serialize() {
        let standard = StandardResolver::new();
        let resolver: &dyn FormatterResolver = &standard;
        let serializer = Lz4Serializer::default();
        let value = "compressible ".repeat(40);

        let mut block = vec![0xEE; 3];
        let n = serializer.serialize_to_block(&mut block, 3, &value, resolver).unwrap();
        assert_eq!(&block[..3], &[0xEE; 3]);
        assert_eq!(&block[3..3 + n], &serializer.serialize(&value, resolver).unwrap()[..]);
    }

    #[test]
    fn test_to_lz4_binary() {
        let serializer = Lz4Serializer::default();
        assert_eq!(serializer.to_lz4_binary(&[0x01, 0x02]).unwrap(), vec![0x01, 0x02]);

        let mut msgpack = Vec::new();
        let n = binary::write_bin(&mut msgpack, 0, &payload(1000)).unwrap();
        let framed = serializer.to_lz4_binary(&msgpack[..n]).unwrap();
        assert_eq!(framed[0], 0xc9);
        assert_eq!(decode(&framed).unwrap().as_ref(), &msgpack[..n]);
    }

    #[test]
    fn test_custom_threshold() {
        let standard = StandardResolver::new();
        let resolver: &dyn FormatterResolver = &standard;
        let serializer = Lz4Serializer::new(SerializerOptions {
            compression_threshold: usize::MAX,
            ..SerializerOptions::default()
        });
        let data = vec![0u8; 4096];
        let bytes = serializer.serialize(&data, resolver).unwrap();
        assert_eq!(bytes.len(), 4096 + 3);
    }

    #[test]
    fn test_decode_from_reader_modes() {
        let serializer = Lz4Serializer::default();
        let mut msgpack = Vec::new();
        let n = binary::write_bin(&mut msgpack, 0, &payload(400)).unwrap();
        let framed = serializer.to_lz4_binary(&msgpack[..n]).unwrap();

        let mut stream = framed.clone();
        stream.extend_from_slice(&framed);
        let mut cursor = Cursor::new(stream);
        for _ in 0..2 {
            let decoded = serializer.decode_from_reader(&mut cursor, ReadMode::Strict).unwrap();
            assert_eq!(decoded, &msgpack[..n]);
        }

        let decoded = serializer
            .decode_from_reader(&mut Cursor::new(framed), ReadMode::Buffered)
            .unwrap();
        assert_eq!(decoded, &msgpack[..n]);
    }

    #[test]
    fn test_lz4_formatter_nested_frame() {
        let standard = StandardResolver::new();
        let resolver: &dyn FormatterResolver = &standard;
        let formatter: Lz4Formatter<Vec<u8>> = Lz4Formatter::new(BytesFormatter);

        let data = payload(2000);
        let mut bytes = vec![0x90];
        let n = formatter.serialize(&mut bytes, 1, &data, resolver).unwrap();
        assert_eq!(bytes[1], 0xc9);

        let (decoded, read) = formatter.deserialize(&bytes[..1 + n], 1, resolver).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(read, n);

        let small = vec![1u8, 2, 3];
        let n = formatter.serialize(&mut bytes, 0, &small, resolver).unwrap();
        assert_eq!(&bytes[..n], &[0xc4, 3, 1, 2, 3]);
    }
}
