//! SHA-256 content hashing for sources and binaries.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Lowercase hex SHA-256 of the file at `path`.
pub fn sha256_file(path: &Path) -> Result<String, CacheError> {
    let bytes = std::fs::read(path).map_err(|e| CacheError::io(path, e))?;
    Ok(sha256_hex(&bytes))
}
