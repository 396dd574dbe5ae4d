use serde::{Deserialize, Serialize};

use super::buffer::DEFAULT_MINIMUM_LENGTH;
use super::envelope::NOT_COMPRESSION_SIZE;

/// Options for the compressing serializer.
///
/// Every field has a default, so a partial configuration deserializes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializerOptions {
    /// Encoded payloads shorter than this are emitted without a compression frame.
    pub compression_threshold: usize,
    /// Minimum length of rented scratch buffers.
    pub minimum_buffer_length: usize,
    /// Zero scratch buffers before they go back to the pool.
    pub clear_buffers_on_return: bool,
}

impl Default for SerializerOptions {
    fn default() -> Self {
        Self {
            compression_threshold: NOT_COMPRESSION_SIZE,
            minimum_buffer_length: DEFAULT_MINIMUM_LENGTH,
            clear_buffers_on_return: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = SerializerOptions::default();
        assert_eq!(opts.compression_threshold, 64);
        assert_eq!(opts.minimum_buffer_length, 65535);
        assert!(!opts.clear_buffers_on_return);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let opts: SerializerOptions =
            serde_json::from_str(r#"{ "clear_buffers_on_return": true }"#).unwrap();
        assert!(opts.clear_buffers_on_return);
        assert_eq!(opts.compression_threshold, NOT_COMPRESSION_SIZE);
    }
}
