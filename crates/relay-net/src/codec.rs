//! Single-byte text encoding used on the wire.
//!
//! Text is ASCII: characters outside ASCII become `?` when encoding, and bytes
//! above `0x7F` become `?` when decoding. One character is always one byte.

const REPLACEMENT: u8 = b'?';

/// Encode `text` as ASCII bytes.
pub fn encode(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { REPLACEMENT })
        .collect()
}

/// Decode ASCII bytes into a `String`.
pub fn decode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { REPLACEMENT as char })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passes_through() {
        assert_eq!(encode("ping\r\n"), b"ping\r\n");
        assert_eq!(decode(b"ping\r\n"), "ping\r\n");
    }

    #[test]
    fn test_non_ascii_is_replaced_per_character() {
        assert_eq!(encode("caf\u{e9} \u{1f600}"), b"caf? ?");
        assert_eq!(decode(&[b'o', b'k', 0xC3, 0xA9]), "ok??");
    }

    #[test]
    fn test_empty_input() {
        assert!(encode("").is_empty());
        assert!(decode(&[]).is_empty());
    }
}
