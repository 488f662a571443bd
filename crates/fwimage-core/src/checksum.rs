//! Payload digests

use std::fmt;

use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::Result;
use crate::stream::ByteStream;

/// Read size used when hashing a stream
const STREAM_BLOCK_SIZE: u64 = 0x8000;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumKind {
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl ChecksumKind {
    /// Guess the algorithm from the length of a hex digest
    pub fn guess(checksum: &str) -> Option<Self> {
        match checksum.len() {
            64 => Some(Self::Sha256),
            96 => Some(Self::Sha384),
            128 => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Lowercase hex digest of a buffer
    pub fn compute(self, data: &[u8]) -> String {
        match self {
            Self::Sha256 => hex::encode(Sha256::digest(data)),
            Self::Sha384 => hex::encode(Sha384::digest(data)),
            Self::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }

    /// Lowercase hex digest of a stream, read in blocks
    pub fn compute_stream(self, stream: &ByteStream) -> Result<String> {
        match self {
            Self::Sha256 => digest_stream::<Sha256>(stream),
            Self::Sha384 => digest_stream::<Sha384>(stream),
            Self::Sha512 => digest_stream::<Sha512>(stream),
        }
    }
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha384 => write!(f, "sha384"),
            Self::Sha512 => write!(f, "sha512"),
        }
    }
}

fn digest_stream<D: Digest>(stream: &ByteStream) -> Result<String> {
    let size = stream.size()?;
    let mut hasher = D::new();
    let mut offset = 0;
    while offset < size {
        let len = STREAM_BLOCK_SIZE.min(size - offset);
        let block = stream.read_bytes(offset, len as usize)?;
        hasher.update(&block);
        offset += len;
    }
    Ok(hex::encode(hasher.finalize()))
}
