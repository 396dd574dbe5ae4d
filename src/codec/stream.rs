//! Reading encoded blocks from a byte stream
//!
//! [`ReadMode::Buffered`] reads until end of stream into a growing buffer.
//! [`ReadMode::Strict`] walks the tag bytes of exactly one MessagePack value
//! and stops at its last byte, leaving whatever follows on the stream
//! untouched.

use std::io::{ErrorKind, Read};

use rmp::Marker;
use serde::{Deserialize, Serialize};

use super::binary::{self, Layout, MAX_BUFFER_LEN};
use crate::error::{CodecError, Result};

/// How a value is read from a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Read to end of stream. The stream must hold exactly one value.
    #[default]
    Buffered,
    /// Read exactly one value's bytes, as declared by its own headers.
    Strict,
}

/// Read `reader` to the end into `buffer`, doubling it whenever it fills.
///
/// Returns the number of bytes read; `buffer[..n]` holds the data.
pub fn fill_from_reader<R: Read + ?Sized>(reader: &mut R, buffer: &mut Vec<u8>) -> Result<usize> {
    let mut length = 0;
    loop {
        binary::ensure_capacity(buffer, length, 1)?;
        match reader.read(&mut buffer[length..]) {
            Ok(0) => return Ok(length),
            Ok(n) => length += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Read the bytes of exactly one complete MessagePack value.
///
/// A compression frame is a single extension value, so this reads a whole
/// frame as well.
pub fn read_message_block<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let mut block = Vec::new();
    let mut pending: u64 = 1;
    while pending > 0 {
        pending -= 1;
        let tag_offset = block.len();
        read_exact_into(reader, &mut block, 1)?;
        match binary::layout(Marker::from_u8(block[tag_offset])) {
            Layout::Fixed(n) => read_exact_into(reader, &mut block, n)?,
            Layout::Prefixed { width, extra } => {
                let len = read_prefix(reader, &mut block, width)? as usize + extra;
                read_exact_into(reader, &mut block, len)?;
            }
            Layout::Items { count, per_item } => pending += count as u64 * per_item as u64,
            Layout::CountedItems { width, per_item } => {
                let count = read_prefix(reader, &mut block, width)?;
                pending += count as u64 * per_item as u64;
            }
            Layout::Invalid => {
                return Err(CodecError::format(tag_offset, "reserved tag byte 0xc1"));
            }
        }
    }
    Ok(block)
}

fn read_prefix<R: Read + ?Sized>(reader: &mut R, block: &mut Vec<u8>, width: usize) -> Result<u32> {
    let start = block.len();
    read_exact_into(reader, block, width)?;
    binary::read_length(block, start, width)
}

/// Append exactly `len` bytes from `reader` to `block`.
///
/// Memory grows with the data actually received, not with the declared length.
fn read_exact_into<R: Read + ?Sized>(reader: &mut R, block: &mut Vec<u8>, len: usize) -> Result<()> {
    let start = block.len();
    if start.saturating_add(len) > MAX_BUFFER_LEN {
        return Err(CodecError::Capacity {
            requested: start.saturating_add(len),
        });
    }
    let mut limited = (&mut *reader).take(len as u64);
    loop {
        match limited.read_to_end(block) {
            Ok(_) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let available = block.len() - start;
    if available < len {
        return Err(CodecError::Truncated {
            offset: start,
            needed: len,
            available,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Hands out at most `chunk` bytes per read.
    struct Trickle<'a> {
        data: &'a [u8],
        chunk: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.chunk.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_fill_grows_buffer() {
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let mut buffer = vec![0u8; 16];
        let n = fill_from_reader(&mut Trickle { data: &data, chunk: 7 }, &mut buffer).unwrap();
        assert_eq!(n, 1000);
        assert_eq!(&buffer[..n], &data[..]);
    }

    #[test]
    fn test_fill_empty_stream() {
        let mut buffer = Vec::new();
        assert_eq!(fill_from_reader(&mut Cursor::new(Vec::new()), &mut buffer).unwrap(), 0);
    }

    #[test]
    fn test_strict_read_stops_at_value_end() {
        // {"a": [1, "xy"]} followed by a sentinel
        let value = [0x81, 0xa1, b'a', 0x92, 0x01, 0xa2, b'x', b'y'];
        let mut stream = value.to_vec();
        stream.push(0x7f);

        let mut reader = Trickle { data: &stream, chunk: 3 };
        let block = read_message_block(&mut reader).unwrap();
        assert_eq!(block, value);
        assert_eq!(reader.data, &[0x7f]);
        assert_eq!(binary::read_next(&block, 0).unwrap(), block.len());
    }

    #[test]
    fn test_strict_read_extension_and_wide_headers() {
        let mut stream = vec![0xc9, 0, 0, 0, 3, 99, 1, 2, 3];
        stream.extend_from_slice(&[0xdc, 0x00, 0x02, 0xc0, 0xc3]);

        let mut cursor = Cursor::new(stream);
        assert_eq!(read_message_block(&mut cursor).unwrap().len(), 9);
        assert_eq!(read_message_block(&mut cursor).unwrap(), vec![0xdc, 0x00, 0x02, 0xc0, 0xc3]);
    }

    #[test]
    fn test_strict_read_truncated() {
        let mut cursor = Cursor::new(vec![0xa5, b'a', b'b']);
        let err = read_message_block(&mut cursor).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Truncated {
                needed: 5,
                available: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_strict_read_hostile_length_does_not_preallocate() {
        let mut cursor = Cursor::new(vec![0xc6, 0x7f, 0xff, 0xff, 0xf0, 0x00]);
        assert!(read_message_block(&mut cursor).unwrap_err().is_format_error());
    }

    #[test]
    fn test_strict_read_rejects_reserved_tag() {
        let mut cursor = Cursor::new(vec![0x91, 0xc1]);
        match read_message_block(&mut cursor).unwrap_err() {
            CodecError::Format { offset, .. } => assert_eq!(offset, 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_read_mode_config_names() {
        assert_eq!(serde_json::to_string(&ReadMode::Strict).unwrap(), "\"strict\"");
        assert_eq!(ReadMode::default(), ReadMode::Buffered);
    }
}
