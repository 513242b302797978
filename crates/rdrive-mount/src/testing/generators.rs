//! Payload and name generators.
//!
//! Buffer sizes near the spool threshold catch off-by-one errors in the
//! memory-to-disk migration. Chunk-patterned payloads make reordered or
//! dropped transfer chunks visible.

use rand::Rng;

/// Transfer chunk size used by streaming backends.
pub const TRANSFER_CHUNK: usize = 64 * 1024;

pub fn random_bytes(size: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    (0..size).map(|_| rng.random()).collect()
}

/// Three payloads: one byte under, exactly at, and one byte over `threshold`.
pub fn around_threshold(threshold: usize) -> [Vec<u8>; 3] {
    [
        random_bytes(threshold.saturating_sub(1)),
        random_bytes(threshold),
        random_bytes(threshold + 1),
    ]
}

pub fn all_byte_values() -> Vec<u8> {
    (0u8..=255).collect()
}

/// `num_chunks` chunks, each filled with its own index byte.
pub fn patterned_chunks(num_chunks: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(num_chunks * TRANSFER_CHUNK);
    for chunk_num in 0..num_chunks {
        #[allow(clippy::cast_possible_truncation)]
        let fill_byte = (chunk_num % 256) as u8;
        data.extend(std::iter::repeat_n(fill_byte, TRANSFER_CHUNK));
    }
    data
}

pub fn unicode_filename() -> String {
    "\u{6587}\u{4ef6}-\u{3b1}\u{3b2}\u{3b3}-emoji\u{1f389}.txt".to_string()
}

/// Spaces, quotes and punctuation; the drive adapter has to escape these in
/// its query strings.
pub fn special_filename() -> String {
    "it's a file with spaces & (special) chars!.txt".to_string()
}

/// `/dir0/dir1/...` with `depth` levels.
pub fn deep_path(depth: usize) -> String {
    (0..depth).map(|i| format!("/dir{i}")).collect()
}
