//! UTF-16LE wire text codec
//!
//! Payloads travel as raw UTF-16 little-endian bytes with no header, length
//! prefix, or delimiter. Both endpoints must use exactly this codec; it is a
//! wire contract, not an implementation detail.

/// Encode text as UTF-16LE bytes.
pub fn encode(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() * 2);
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

/// Decode UTF-16LE bytes into text.
///
/// Decoding is lossy: unpaired surrogates become U+FFFD, and so does a
/// trailing odd byte. Both can occur when a read boundary cuts a character
/// in half mid-stream.
pub fn decode(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let mut text = String::from_utf16_lossy(&units);
    if bytes.len() % 2 != 0 {
        text.push(char::REPLACEMENT_CHARACTER);
    }
    text
}
