//! Encoding for the `uploads.completed_parts_bitmap` column.
//!
//! Parts are 1-indexed; bit `k-1` of byte `(k-1)/8` is set when part `k`
//! has been acknowledged by the server.

/// Encodes a set of completed part numbers into a compact bitmap.
pub fn encode(parts: &[u32]) -> Vec<u8> {
    let max = parts.iter().copied().max().unwrap_or(0);
    let mut bytes = vec![0u8; (max as usize).div_ceil(8)];

    for &part in parts {
        debug_assert!(part >= 1, "part numbers are 1-indexed");
        let bit = (part - 1) as usize;
        bytes[bit / 8] |= 1 << (bit % 8);
    }

    bytes
}

/// Decodes a bitmap back into an ascending list of completed part numbers.
pub fn decode(bytes: &[u8]) -> Vec<u32> {
    let mut parts = Vec::new();

    for (byte_idx, byte) in bytes.iter().enumerate() {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                parts.push((byte_idx * 8 + bit + 1) as u32);
            }
        }
    }

    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_empty() {
        assert_eq!(decode(&encode(&[])), Vec::<u32>::new());
    }

    #[test]
    fn test_roundtrip_single() {
        assert_eq!(decode(&encode(&[1])), vec![1]);
    }

    #[test]
    fn test_roundtrip_spans_bytes() {
        let parts = vec![1, 8, 9, 16, 17, 100];
        let encoded = encode(&parts);
        let mut decoded = decode(&encoded);
        decoded.sort_unstable();
        assert_eq!(decoded, parts);

        // Byte count should be the minimum needed to cover the highest part.
        assert_eq!(encoded.len(), 100usize.div_ceil(8));
    }

    #[test]
    fn test_decode_ignores_unset_bits() {
        assert_eq!(decode(&[0b0000_0000]), Vec::<u32>::new());
        assert_eq!(decode(&[0b0000_0101]), vec![1, 3]);
    }
}
