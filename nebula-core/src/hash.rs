//! Content hashing
//!
//! Files, partitions and shards are addressed by the 20-byte SHA-1 digest of
//! their bytes. Hashing a file streams it, so shard-sized inputs never have to
//! be loaded into memory.

use crate::error::{NebulaError, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Digest length in bytes
pub const HASH_SIZE: usize = 20;

/// Read buffer used when streaming files through the hasher
const HASH_BUFFER_SIZE: usize = 32 * 1024;

/// SHA-1 content hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; HASH_SIZE]);

impl ContentHash {
    /// Compute the hash of an in-memory buffer
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Create from a slice (validates length)
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| {
            NebulaError::Codec(format!(
                "invalid hash length: expected {}, got {}",
                HASH_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| NebulaError::Codec(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Verify that data matches this hash
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Stream a file through the hasher, returning its hash and byte length
pub fn hash_file(path: &Path) -> Result<(ContentHash, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok((ContentHash(hasher.finalize().into()), size))
}

/// Check that a file on disk still has the expected size and hash
pub fn verify_file(path: &Path, expected_hash: &ContentHash, expected_size: u64) -> Result<()> {
    let (hash, size) = hash_file(path)?;
    if size != expected_size {
        return Err(NebulaError::SizeMismatch {
            path: path.to_path_buf(),
            expected: expected_size,
            actual: size,
        });
    }
    if hash != *expected_hash {
        return Err(NebulaError::HashMismatch {
            path: path.to_path_buf(),
            expected: expected_hash.to_hex(),
            actual: hash.to_hex(),
        });
    }
    Ok(())
}
