//! Unpadded base32 codecs.
//!
//! Two alphabets are used: a sort-preserving one for identifiers (every symbol
//! is in ascending ASCII order, so byte order survives encoding) and the
//! RFC 4648 lowercase one used for multibase CID strings.

/// Sort-preserving alphabet (Crockford symbols, lowercase).
pub const SORTABLE: &[u8; 32] = b"0123456789abcdefghjkmnpqrstvwxyz";

/// RFC 4648 base32, lowercase.
pub const RFC4648_LOWER: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Number of symbols needed to encode `len` bytes.
pub const fn encoded_len(len: usize) -> usize {
    (len * 8).div_ceil(5)
}

/// Encode bytes most-significant bit first.
pub fn encode(alphabet: &[u8; 32], data: &[u8]) -> String {
    let mut out = String::with_capacity(encoded_len(data.len()));
    let mut buffer: u32 = 0;
    let mut bits = 0u32;

    for &byte in data {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let index = (buffer >> bits) & 0x1f;
            out.push(alphabet[index as usize] as char);
        }
    }
    if bits > 0 {
        let index = (buffer << (5 - bits)) & 0x1f;
        out.push(alphabet[index as usize] as char);
    }
    out
}

/// Decode a string produced by [`encode`] with the same alphabet.
///
/// Returns `None` on a symbol outside the alphabet or non-zero trailing bits.
pub fn decode(alphabet: &[u8; 32], input: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;

    for symbol in input.bytes() {
        let value = alphabet.iter().position(|&c| c == symbol)? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
        buffer &= (1 << bits) - 1;
    }
    if buffer != 0 {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc4648_vectors() {
        assert_eq!(encode(RFC4648_LOWER, b""), "");
        assert_eq!(encode(RFC4648_LOWER, b"f"), "my");
        assert_eq!(encode(RFC4648_LOWER, b"fo"), "mzxq");
        assert_eq!(encode(RFC4648_LOWER, b"foobar"), "mzxw6ytboi");
    }

    #[test]
    fn test_decode_inverts_encode() {
        let data = [0u8, 1, 2, 254, 255, 17, 99];
        for alphabet in [SORTABLE, RFC4648_LOWER] {
            let encoded = encode(alphabet, &data);
            assert_eq!(encoded.len(), encoded_len(data.len()));
            assert_eq!(decode(alphabet, &encoded).unwrap(), data);
        }
    }

    #[test]
    fn test_decode_rejects_foreign_symbols() {
        assert!(decode(SORTABLE, "abcu").is_none());
        assert!(decode(RFC4648_LOWER, "mzx1").is_none());
    }

    #[test]
    fn test_sortable_alphabet_preserves_order() {
        let a = encode(SORTABLE, &100u64.to_be_bytes());
        let b = encode(SORTABLE, &101u64.to_be_bytes());
        let c = encode(SORTABLE, &(1u64 << 40).to_be_bytes());
        assert!(a < b);
        assert!(b < c);
    }
}
