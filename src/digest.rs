//! Content digests.
//!
//! Everything the collector touches (blobs, manifests, trash rows) is
//! addressed by a digest of the form `sha256:<64 hex chars>`. The digest is
//! the identity of the content: two blobs with the same digest are the same
//! bytes, and deletion requests against the backend are keyed by it.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// The only algorithm the backend storage layout uses.
pub const SHA256_PREFIX: &str = "sha256:";

const SHA256_HEX_LEN: usize = 64;

/// Error type for digest parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    /// The string did not start with a supported `<algorithm>:` prefix.
    #[error("unsupported digest algorithm in {0:?}")]
    UnsupportedAlgorithm(String),

    /// The hex part was missing, the wrong length, or not hexadecimal.
    #[error("invalid digest hex in {0:?}")]
    InvalidHex(String),
}

/// A content digest in `sha256:<hex>` form.
///
/// Stored normalized (lowercase hex) so that digests compare and hash by
/// content identity regardless of how they were written.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Compute the sha256 digest of the given bytes.
    pub fn sha256_of(data: impl AsRef<[u8]>) -> Self {
        let hash = Sha256::digest(data.as_ref());
        Self(format!("{SHA256_PREFIX}{}", hex::encode(hash)))
    }

    /// The full `sha256:<hex>` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex part, without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(hex_part) = s.strip_prefix(SHA256_PREFIX) else {
            return Err(DigestError::UnsupportedAlgorithm(s.to_owned()));
        };
        if hex_part.len() != SHA256_HEX_LEN
            || !hex_part.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(DigestError::InvalidHex(s.to_owned()));
        }
        Ok(Self(format!(
            "{SHA256_PREFIX}{}",
            hex_part.to_ascii_lowercase()
        )))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let digest = Digest::sha256_of(b"hello world");
        let parsed: Digest = digest.as_str().parse().unwrap();
        assert_eq!(parsed, digest);
        assert_eq!(parsed.hex().len(), 64);
    }

    #[test]
    fn parse_normalizes_case() {
        let upper = format!("sha256:{}", "AB".repeat(32));
        let lower = format!("sha256:{}", "ab".repeat(32));
        let parsed: Digest = upper.parse().unwrap();
        assert_eq!(parsed.as_str(), lower);
    }

    #[test]
    fn rejects_other_algorithms() {
        let err = format!("sha512:{}", "ab".repeat(32))
            .parse::<Digest>()
            .unwrap_err();
        assert!(matches!(err, DigestError::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(matches!(
            "sha256:zz".parse::<Digest>().unwrap_err(),
            DigestError::InvalidHex(_)
        ));
        let short = format!("sha256:{}", "ab".repeat(31));
        assert!(matches!(
            short.parse::<Digest>().unwrap_err(),
            DigestError::InvalidHex(_)
        ));
    }
}
