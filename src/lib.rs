//! # msgpack-lz4
//!
//! MessagePack encoding with LZ4 compression framing and runtime-typed
//! values.
//!
//! Types map to [`Formatter`]s through a [`FormatterResolver`]. The
//! [`Lz4Serializer`] compresses encoded payloads of 64 bytes or more into an
//! extension frame that decoders detect from the leading tag byte. Values
//! whose concrete type is only known at run time travel in an embedded-type
//! envelope ([`EmbeddedTypeFormatter`]) naming their type.

#[macro_use]
mod logging;

pub mod codec;
pub mod error;

pub use codec::*;
pub use error::{CodecError, Result};

#[cfg(feature = "logging")]
pub use logging::init_tracing;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_loads() {
        let standard = StandardResolver::new();
        let resolver: &dyn FormatterResolver = &standard;
        let bytes = to_msgpack(&true, resolver).unwrap();
        assert_eq!(bytes, vec![0xc3]);
        assert_eq!(SerializerOptions::default().compression_threshold, NOT_COMPRESSION_SIZE);
    }
}
