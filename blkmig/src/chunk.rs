//! Chunk geometry and the zero-block detector (C1).

/// Sectors per migration chunk. Fixed at build time; part of the wire protocol.
pub const CHUNK_SECTORS: u64 = 256;

/// Bytes per sector.
pub const SECTOR_BYTES: u64 = 512;

/// `log2(SECTOR_BYTES)`, used to pack/unpack the wire header word.
pub const SECTOR_BITS: u32 = 9;

/// Bytes per migration chunk.
pub const CHUNK_BYTES: usize = (CHUNK_SECTORS * SECTOR_BYTES) as usize;

const _: () = assert!(1u64 << SECTOR_BITS == SECTOR_BYTES);
const _: () = assert!(CHUNK_SECTORS.is_power_of_two());

/// Bounded search window for `is_allocated` probes during the shared-base skip.
pub const MAX_IS_ALLOCATED_SEARCH: u64 = 65536;

/// Returns true iff every byte of `buf` is zero.
///
/// Pure: no side effects, no allocation. Callers own `buf` for the duration of the call only.
pub fn is_zero_block(buf: &[u8]) -> bool {
    let (prefix, words, suffix) = unsafe { buf.align_to::<u64>() };
    prefix.iter().all(|&b| b == 0)
        && words.iter().all(|&w| w == 0)
        && suffix.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_zero() {
        let buf = vec![0u8; CHUNK_BYTES];
        assert!(is_zero_block(&buf));
    }

    #[test]
    fn all_nonzero() {
        let buf = vec![1u8; CHUNK_BYTES];
        assert!(!is_zero_block(&buf));
    }

    #[test]
    fn nonzero_tail() {
        let mut buf = vec![0u8; CHUNK_BYTES];
        *buf.last_mut().unwrap() = 1;
        assert!(!is_zero_block(&buf));
    }

    #[test]
    fn nonzero_unaligned_head() {
        let mut buf = vec![0u8; CHUNK_BYTES];
        buf[1] = 1;
        assert!(!is_zero_block(&buf));
    }

    #[test]
    fn odd_length_buffer() {
        let buf = vec![0u8; 13];
        assert!(is_zero_block(&buf));
        let mut buf2 = vec![0u8; 13];
        buf2[12] = 7;
        assert!(!is_zero_block(&buf2));
    }
}
