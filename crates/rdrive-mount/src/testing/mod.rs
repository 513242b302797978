//! Shared test helpers for bridge and backend tests.
//!
//! - **Generators**: payloads sized around the spool threshold and transfer
//!   chunk boundaries, plus awkward names.
//! - **Assertions**: content and errno checks that fail with short, useful
//!   messages instead of dumping megabytes of bytes.

pub mod assertions;
pub mod generators;

pub use assertions::{assert_bytes_equal, assert_category, assert_hash_equal, sha256};
pub use generators::{
    TRANSFER_CHUNK, all_byte_values, around_threshold, deep_path, patterned_chunks, random_bytes, special_filename,
    unicode_filename,
};
