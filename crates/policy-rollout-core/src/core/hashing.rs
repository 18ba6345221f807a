// crates/policy-rollout-core/src/core/hashing.rs
// ============================================================================
// Module: Policy Rollout Content Hashing
// Description: Content hashing for policy artifacts.
// Purpose: Provide stable digests used to confirm applied policy matches intent.
// Dependencies: serde, sha2, thiserror
// ============================================================================

//! ## Overview
//! Policy artifacts are hashed over their raw bytes. Digests render as
//! `<algorithm>:<lowercase hex>` so they can be stored as a single text
//! column and compared against the hash a device reports after an apply.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

// ============================================================================
// SECTION: Hash Algorithm
// ============================================================================

/// Supported hash algorithms for policy artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// SHA-256 hashing.
    Sha256,
}

impl HashAlgorithm {
    /// Returns the stable label for the algorithm.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
        }
    }
}

/// Default hash algorithm for policy artifacts.
pub const DEFAULT_HASH_ALGORITHM: HashAlgorithm = HashAlgorithm::Sha256;

// ============================================================================
// SECTION: Hash Digest
// ============================================================================

/// Content hash of a policy artifact.
///
/// # Invariants
/// - `value` is lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashDigest {
    /// Hash algorithm identifier.
    pub algorithm: HashAlgorithm,
    /// Lowercase hex-encoded digest bytes.
    pub value: String,
}

impl HashDigest {
    /// Creates a new digest from raw digest bytes.
    #[must_use]
    pub fn new(algorithm: HashAlgorithm, bytes: &[u8]) -> Self {
        Self {
            algorithm,
            value: hex_encode(bytes),
        }
    }
}

impl fmt::Display for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.label(), self.value)
    }
}

impl FromStr for HashDigest {
    type Err = HashError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let Some((label, value)) = raw.split_once(':') else {
            return Err(HashError::Malformed(raw.to_string()));
        };
        let algorithm = match label {
            "sha256" => HashAlgorithm::Sha256,
            other => return Err(HashError::UnknownAlgorithm(other.to_string())),
        };
        if value.is_empty() || !value.bytes().all(|byte| matches!(byte, b'0' ..= b'9' | b'a' ..= b'f'))
        {
            return Err(HashError::Malformed(raw.to_string()));
        }
        Ok(Self {
            algorithm,
            value: value.to_string(),
        })
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when parsing digests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashError {
    /// Digest text is not `<algorithm>:<hex>`.
    #[error("malformed digest: {0}")]
    Malformed(String),
    /// Digest algorithm label is not supported.
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),
}

// ============================================================================
// SECTION: Hashing Helpers
// ============================================================================

/// Hashes raw bytes using the provided algorithm.
#[must_use]
pub fn hash_bytes(algorithm: HashAlgorithm, bytes: &[u8]) -> HashDigest {
    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(bytes);
            let digest = hasher.finalize();
            HashDigest::new(HashAlgorithm::Sha256, &digest)
        }
    }
}

// ============================================================================
// SECTION: Hex Encoding
// ============================================================================

/// Encodes bytes as a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

// ============================================================================
// SECTION: Tests
// ============================================================================
