//! Content checksums for documents and source archives
//!
//! Blobs are addressed by the lowercase hex SHA-256 of their bytes. Callers
//! compute the checksum before handing bytes to the content store; the store
//! itself never re-hashes on read.

use crate::error::{ApihubError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;

/// SHA-256 hex digest of an in-memory buffer
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 hex digest of any readable source, streamed in 8 KiB chunks
pub fn sha256_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Recompute the checksum of `bytes` and compare it with `expected`
pub fn verify_checksum(bytes: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(ApihubError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
