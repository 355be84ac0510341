//! Rolling CRC-32 (IEEE 802.3 polynomial) used to validate object transfers.

/// Extend a running CRC-32 accumulator with another chunk of bytes.
///
/// `init` is the CRC of everything written so far (`0` for an empty
/// prefix); the result is the CRC of the prefix with `buf` appended. This
/// makes validating a large firmware image an O(n) pass rather than an
/// O(n^2) recompute-from-scratch on every object boundary.
pub fn crc32_update(init: u32, buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(init);
    hasher.update(buf);
    hasher.finalize()
}

/// CRC-32 of a full buffer, equivalent to `crc32_update(0, buf)`.
pub fn crc32(buf: &[u8]) -> u32 {
    crc32_update(0, buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_matches_whole_buffer() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let whole = crc32(data);

        let mut acc = 0;
        for chunk in data.chunks(7) {
            acc = crc32_update(acc, chunk);
        }
        assert_eq!(whole, acc);
    }

    #[test]
    fn empty_buffer_is_identity() {
        assert_eq!(crc32_update(0x1234_5678, &[]), 0x1234_5678);
    }
}
