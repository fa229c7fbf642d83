//! Threshold-based compression of large text values.
//!
//! Values are deflated with zlib framing. The codec is stateless: it never
//! guesses whether a blob was compressed. Callers persist the flag next to
//! the value, which [`CompressedValue`] does for them.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use parley_settings::CompressionSettings;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, StoreError};

/// Lossless compressor for text values above a byte threshold.
#[derive(Clone, Debug)]
pub struct CompressionCodec {
    threshold_bytes: usize,
    level: Compression,
}

impl CompressionCodec {
    /// Create a codec. Levels above 9 are clamped.
    pub fn new(threshold_bytes: usize, level: u32) -> Self {
        Self {
            threshold_bytes,
            level: Compression::new(level.min(9)),
        }
    }

    /// Create a codec from the `compression` settings section.
    pub fn from_settings(settings: &CompressionSettings) -> Self {
        Self::new(settings.threshold_bytes, settings.level)
    }

    /// Configured byte threshold.
    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    /// Whether a value of `size` bytes should be stored compressed.
    pub fn should_compress(&self, size: usize) -> bool {
        size > self.threshold_bytes
    }

    /// Deflate `text`.
    pub fn compress(&self, text: &str) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(text.len() / 2), self.level);
        encoder
            .write_all(text.as_bytes())
            .map_err(|e| StoreError::Codec(format!("compress: {e}")))?;
        encoder
            .finish()
            .map_err(|e| StoreError::Codec(format!("compress: {e}")))
    }

    /// Inflate bytes produced by [`compress`](Self::compress).
    pub fn decompress(&self, bytes: &[u8]) -> Result<String> {
        let mut text = String::new();
        let _ = ZlibDecoder::new(bytes)
            .read_to_string(&mut text)
            .map_err(|e| StoreError::Codec(format!("decompress: {e}")))?;
        Ok(text)
    }

    /// Stream `reader` into `writer` as gzip. Returns bytes consumed.
    pub(crate) fn gzip_stream<R: Read, W: Write>(&self, reader: &mut R, writer: W) -> std::io::Result<(u64, W)> {
        let mut encoder = GzEncoder::new(writer, self.level);
        let consumed = std::io::copy(reader, &mut encoder)?;
        let writer = encoder.finish()?;
        Ok((consumed, writer))
    }

    /// Stream gzip `reader` into `writer` uncompressed. Returns bytes written.
    pub(crate) fn gunzip_stream<R: Read, W: Write>(reader: R, writer: &mut W) -> std::io::Result<u64> {
        let mut decoder = GzDecoder::new(reader);
        std::io::copy(&mut decoder, writer)
    }
}

impl Default for CompressionCodec {
    fn default() -> Self {
        Self::from_settings(&CompressionSettings::default())
    }
}

/// A text value in its stored form, with the flag that says how to read it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedValue {
    /// Whether `stored_bytes` is deflated.
    pub is_compressed: bool,
    /// Length of the original UTF-8 text in bytes.
    pub original_size: usize,
    /// Bytes as persisted.
    pub stored_bytes: Vec<u8>,
}

impl CompressedValue {
    /// Encode `text`, compressing only when it exceeds the threshold.
    pub fn encode(codec: &CompressionCodec, text: &str) -> Result<Self> {
        let original_size = text.len();
        if codec.should_compress(original_size) {
            Ok(Self {
                is_compressed: true,
                original_size,
                stored_bytes: codec.compress(text)?,
            })
        } else {
            Ok(Self {
                is_compressed: false,
                original_size,
                stored_bytes: text.as_bytes().to_vec(),
            })
        }
    }

    /// Recover the original text. Inflates only when flagged as compressed.
    pub fn decode(&self, codec: &CompressionCodec) -> Result<String> {
        if self.is_compressed {
            codec.decompress(&self.stored_bytes)
        } else {
            String::from_utf8(self.stored_bytes.clone())
                .map_err(|e| StoreError::Codec(format!("stored text is not UTF-8: {e}")))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn threshold_is_exclusive() {
        let codec = CompressionCodec::new(4096, 6);
        assert!(!codec.should_compress(0));
        assert!(!codec.should_compress(4095));
        assert!(!codec.should_compress(4096));
        assert!(codec.should_compress(4097));
    }

    #[test]
    fn compresses_repetitive_text() {
        let codec = CompressionCodec::default();
        let text = "the quick brown fox ".repeat(1000);
        let packed = codec.compress(&text).unwrap();
        assert!(packed.len() < text.len() / 10);
        assert_eq!(codec.decompress(&packed).unwrap(), text);
    }

    #[test]
    fn compression_is_deterministic() {
        let codec = CompressionCodec::default();
        let text = "déjà vu ".repeat(700);
        assert_eq!(codec.compress(&text).unwrap(), codec.compress(&text).unwrap());
    }

    #[test]
    fn decompress_rejects_garbage() {
        let codec = CompressionCodec::default();
        assert_matches!(codec.decompress(b"definitely not zlib"), Err(StoreError::Codec(_)));
    }

    #[test]
    fn level_is_clamped() {
        let codec = CompressionCodec::new(10, 42);
        let packed = codec.compress("hello hello hello hello").unwrap();
        assert_eq!(codec.decompress(&packed).unwrap(), "hello hello hello hello");
    }

    #[test]
    fn small_values_stay_plain() {
        let codec = CompressionCodec::new(16, 6);
        let value = CompressedValue::encode(&codec, "short").unwrap();
        assert!(!value.is_compressed);
        assert_eq!(value.stored_bytes, b"short");
        assert_eq!(value.original_size, 5);
        assert_eq!(value.decode(&codec).unwrap(), "short");
    }

    #[test]
    fn large_values_carry_the_flag() {
        let codec = CompressionCodec::new(16, 6);
        let text = "a long message body ".repeat(50);
        let value = CompressedValue::encode(&codec, &text).unwrap();
        assert!(value.is_compressed);
        assert_eq!(value.original_size, text.len());
        assert_ne!(value.stored_bytes, text.as_bytes());
        assert_eq!(value.decode(&codec).unwrap(), text);
    }

    #[test]
    fn plain_value_is_never_inflated() {
        // zlib output read with the flag off is treated as raw UTF-8 and
        // rejected rather than inflated.
        let codec = CompressionCodec::new(0, 6);
        let packed = codec.compress("x").unwrap();
        let value = CompressedValue {
            is_compressed: false,
            original_size: packed.len(),
            stored_bytes: packed,
        };
        assert_matches!(value.decode(&codec), Err(StoreError::Codec(_)));
    }

    #[test]
    fn gzip_stream_round_trip() {
        let codec = CompressionCodec::default();
        let payload = b"SQLite format 3\0".repeat(256);
        let (consumed, gz) = codec.gzip_stream(&mut &payload[..], Vec::new()).unwrap();
        assert_eq!(consumed, payload.len() as u64);

        let mut out = Vec::new();
        let written = CompressionCodec::gunzip_stream(&gz[..], &mut out).unwrap();
        assert_eq!(written, payload.len() as u64);
        assert_eq!(out, payload);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn round_trip_any_text(text in ".*", threshold in 0usize..64) {
                let codec = CompressionCodec::new(threshold, 6);
                let packed = codec.compress(&text).unwrap();
                prop_assert_eq!(codec.decompress(&packed).unwrap(), text.clone());

                let value = CompressedValue::encode(&codec, &text).unwrap();
                prop_assert_eq!(value.is_compressed, text.len() > threshold);
                prop_assert_eq!(value.decode(&codec).unwrap(), text);
            }
        }
    }
}
