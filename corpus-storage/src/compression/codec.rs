//! Text compression format.
//!
//! A compressed payload is the standard-alphabet base64 encoding of an LZ4
//! block prefixed with the little-endian `u32` length of the raw UTF-8 text.
//! Decoding never panics: anything that is not a payload produced by
//! [`compress_text`] yields `None`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Size of the raw-length prefix.
const LEN_PREFIX: usize = 4;

/// Upper bound on LZ4 expansion; a declared length above this is corrupt.
const MAX_EXPANSION: usize = 255;

/// Compress text into a printable payload.
pub fn compress_text(text: &str) -> String {
    let raw = text.as_bytes();
    let block = lz4_flex::block::compress(raw);

    let mut framed = Vec::with_capacity(LEN_PREFIX + block.len());
    framed.extend_from_slice(&(raw.len() as u32).to_le_bytes());
    framed.extend_from_slice(&block);

    STANDARD.encode(framed)
}

/// Decompress a payload produced by [`compress_text`].
///
/// Returns `None` for invalid base64, a missing or implausible length prefix,
/// a malformed LZ4 block, or bytes that are not UTF-8.
pub fn decompress_text(payload: &str) -> Option<String> {
    let framed = STANDARD.decode(payload).ok()?;
    if framed.len() < LEN_PREFIX {
        return None;
    }

    let (prefix, block) = framed.split_at(LEN_PREFIX);
    let declared = u32::from_le_bytes(prefix.try_into().ok()?) as usize;
    if declared > block.len().saturating_mul(MAX_EXPANSION).saturating_add(16) {
        return None;
    }

    let raw = lz4_flex::block::decompress(block, declared).ok()?;
    if raw.len() != declared {
        return None;
    }
    String::from_utf8(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_trip_samples() {
        for sample in [
            "",
            "a",
            "Aquí me pongo a cantar al compás de la vigüela",
            "emoji 🧉🐎 and combining e\u{301}",
            &"repetitive text ".repeat(500),
        ] {
            assert_eq!(decompress_text(&compress_text(sample)).as_deref(), Some(sample));
        }
    }

    #[test]
    fn test_repetitive_text_compresses() {
        let text = "la pampa ".repeat(1000);
        let payload = compress_text(&text);
        assert!(payload.len() < text.len());
    }

    #[test]
    fn test_foreign_payloads_yield_none() {
        assert_eq!(decompress_text("not base64 at all!!"), None);
        assert_eq!(decompress_text(""), None);
        // Valid base64, too short for the length prefix.
        assert_eq!(decompress_text("AAA="), None);
        // Declares a huge length with a tiny block.
        let bogus = STANDARD.encode([0xFF, 0xFF, 0xFF, 0x7F, 0x00]);
        assert_eq!(decompress_text(&bogus), None);
        // Valid length prefix, garbage block.
        let garbage = STANDARD.encode([10, 0, 0, 0, 0xF0, 0x01, 0x02]);
        assert_eq!(decompress_text(&garbage), None);
    }

    #[test]
    fn test_non_utf8_block_yields_none() {
        let raw = [0xC3u8, 0x28];
        let block = lz4_flex::block::compress(&raw);
        let mut framed = (raw.len() as u32).to_le_bytes().to_vec();
        framed.extend_from_slice(&block);
        assert_eq!(decompress_text(&STANDARD.encode(framed)), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Any unicode string survives compression.
        #[test]
        fn prop_round_trip_unicode(s in any::<String>()) {
            let payload = compress_text(&s);
            prop_assert_eq!(decompress_text(&payload), Some(s));
        }
    }
}
