//! Error types for msgpack-lz4.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Main error type for all codec operations.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// Malformed input: unknown tag, wrong envelope arity, out-of-range value.
    #[error("invalid MessagePack format at offset {offset}: {reason}")]
    Format { offset: usize, reason: String },

    /// Input ended before a primitive's declared length was fully read.
    #[error("truncated input at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// No formatter is bound for the type in this resolver.
    #[error("{type_name} is not registered in this resolver. resolver: {resolver}")]
    NotRegistered { type_name: String, resolver: String },

    /// The type identifier is on the denylist.
    #[error("type is denylisted: {type_name}")]
    Security { type_name: String },

    /// The type identifier does not name any registered type.
    #[error("can't find type: {type_name}")]
    TypeNotFound { type_name: String },

    /// Buffer growth beyond the largest representable length.
    #[error("buffer capacity exceeded: {requested} bytes requested")]
    Capacity { requested: usize },

    /// Lazy formatter construction failed.
    #[error("formatter initialization failed for {type_name}")]
    Initialization {
        type_name: String,
        #[source]
        source: Arc<CodecError>,
    },

    /// An erased formatter was handed a value of another runtime type.
    #[error("value is not of the expected runtime type {expected}")]
    TypeMismatch { expected: String },

    /// Two types were registered under one identifier.
    #[error("type identifier registered twice: {identifier}")]
    DuplicateTypeIdentifier { identifier: String },

    /// LZ4 block compression or decompression failed.
    #[error("LZ4 error: {0}")]
    Compression(String),

    /// I/O error while reading or writing a stream.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl CodecError {
    pub(crate) fn format(offset: usize, reason: impl Into<String>) -> Self {
        CodecError::Format {
            offset,
            reason: reason.into(),
        }
    }

    /// True for malformed and truncated input alike.
    pub fn is_format_error(&self) -> bool {
        matches!(self, CodecError::Format { .. } | CodecError::Truncated { .. })
    }

    /// Strip nested initialization wrappers down to the failure that caused them.
    pub fn root_cause(self) -> CodecError {
        let mut current = self;
        while let CodecError::Initialization { source, .. } = current {
            current = (*source).clone();
        }
        current
    }
}

impl From<io::Error> for CodecError {
    fn from(err: io::Error) -> Self {
        CodecError::Io(Arc::new(err))
    }
}

impl From<lz4_flex::block::CompressError> for CodecError {
    fn from(err: lz4_flex::block::CompressError) -> Self {
        CodecError::Compression(err.to_string())
    }
}

impl From<lz4_flex::block::DecompressError> for CodecError {
    fn from(err: lz4_flex::block::DecompressError) -> Self {
        CodecError::Compression(err.to_string())
    }
}

/// Result type alias using CodecError.
pub type Result<T> = std::result::Result<T, CodecError>;
