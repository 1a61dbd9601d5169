//! Content hashes used to validate cached file data.
//!
//! Personal drives report SHA-1; business drives and SharePoint
//! document libraries report QuickXorHash, a 160-bit non-cryptographic
//! rolling-XOR digest with the input length folded into the final
//! bytes.

use base64::Engine;
use sha1::{Digest, Sha1};

/// Uppercase hex SHA-1 of the given content, matching the format the
/// API reports for personal drives.
pub fn sha1_hash(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode_upper(hasher.finalize())
}

const WIDTH_IN_BITS: usize = 160;
const BITS_PER_SHIFT: usize = 11;
const BITS_IN_LAST_CELL: usize = 32;

/// Streaming QuickXorHash state.
pub struct QuickXorHash {
    data: [u64; 3],
    length: u64,
    shift: usize,
}

impl Default for QuickXorHash {
    fn default() -> Self {
        Self::new()
    }
}

impl QuickXorHash {
    pub fn new() -> Self {
        Self {
            data: [0; 3],
            length: 0,
            shift: 0,
        }
    }

    pub fn update(&mut self, input: &[u8]) {
        let mut vector_index = self.shift / 64;
        let mut vector_offset = self.shift % 64;
        let iterations = input.len().min(WIDTH_IN_BITS);

        for i in 0..iterations {
            let is_last_cell = vector_index == self.data.len() - 1;
            let bits_in_cell = if is_last_cell { BITS_IN_LAST_CELL } else { 64 };

            if vector_offset <= bits_in_cell - 8 {
                let mut j = i;
                while j < input.len() {
                    self.data[vector_index] ^= (input[j] as u64) << vector_offset;
                    j += WIDTH_IN_BITS;
                }
            } else {
                // The byte straddles two cells.
                let index1 = vector_index;
                let index2 = if is_last_cell { 0 } else { vector_index + 1 };
                let low = bits_in_cell - vector_offset;

                let mut xored: u8 = 0;
                let mut j = i;
                while j < input.len() {
                    xored ^= input[j];
                    j += WIDTH_IN_BITS;
                }
                self.data[index1] ^= (xored as u64) << vector_offset;
                self.data[index2] ^= (xored as u64) >> low;
            }

            vector_offset += BITS_PER_SHIFT;
            while vector_offset >= bits_in_cell {
                vector_index = if is_last_cell { 0 } else { vector_index + 1 };
                vector_offset -= bits_in_cell;
            }
        }

        self.shift = (self.shift + BITS_PER_SHIFT * (input.len() % WIDTH_IN_BITS)) % WIDTH_IN_BITS;
        self.length = self.length.wrapping_add(input.len() as u64);
    }

    /// Produce the 20-byte digest. The total input length is XORed into
    /// the trailing eight bytes, little-endian.
    pub fn finalize(&self) -> [u8; 20] {
        let mut cells = [0u8; 24];
        for (i, cell) in self.data.iter().enumerate() {
            cells[i * 8..(i + 1) * 8].copy_from_slice(&cell.to_le_bytes());
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&cells[..20]);
        for (i, byte) in self.length.to_le_bytes().iter().enumerate() {
            out[12 + i] ^= byte;
        }
        out
    }
}

/// Base64 QuickXorHash of the given content, matching the format the
/// API reports for business drives.
pub fn quickxor_hash(data: &[u8]) -> String {
    let mut hasher = QuickXorHash::new();
    hasher.update(data);
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_known_vector() {
        // sha1("abc")
        assert_eq!(sha1_hash(b"abc"), "A9993E364706816ABA3E25717850C26C9CD0D89D");
        assert_eq!(
            sha1_hash(b""),
            "DA39A3EE5E6B4B0D3255BFEF95601890AFD80709"
        );
    }

    #[test]
    fn test_quickxor_empty_input_is_all_zero() {
        let digest = QuickXorHash::new().finalize();
        assert_eq!(digest, [0u8; 20]);
        assert_eq!(quickxor_hash(b""), "AAAAAAAAAAAAAAAAAAAAAAAAAAA=");
    }

    #[test]
    fn test_quickxor_single_byte() {
        // One 0x01 byte lands in bit 0 of the first cell; the length
        // (1) is XORed into byte 12.
        let mut expected = [0u8; 20];
        expected[0] = 0x01;
        expected[12] = 0x01;

        let mut hasher = QuickXorHash::new();
        hasher.update(&[0x01]);
        assert_eq!(hasher.finalize(), expected);
    }

    #[test]
    fn test_quickxor_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let mut one_shot = QuickXorHash::new();
        one_shot.update(&data);

        let mut streamed = QuickXorHash::new();
        // Split sizes chosen to exercise mid-width continuation.
        streamed.update(&data[..7]);
        streamed.update(&data[7..207]);
        streamed.update(&data[207..]);

        assert_eq!(one_shot.finalize(), streamed.finalize());
    }

    #[test]
    fn test_quickxor_distinguishes_content_and_length() {
        assert_ne!(quickxor_hash(b"aaaa"), quickxor_hash(b"aaab"));
        assert_ne!(quickxor_hash(b"aaaa"), quickxor_hash(b"aaaaa"));
    }
}
