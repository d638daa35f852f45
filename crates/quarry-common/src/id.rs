//! Content digests.

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{QuarryError, QuarryResult};

/// A SHA-256 content address.
///
/// Stored as the lowercase hex encoding of the hash. [`Display`](fmt::Display)
/// renders the bare hex form used for on-disk names (`<digest>/layer.tar`,
/// `<image_id>.json`); [`Digest::prefixed`] renders the `sha256:<hex>` form
/// used inside documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Algorithm name used in prefixed digests.
    pub const ALGORITHM: &'static str = "sha256";

    /// Length of the hex encoding of a SHA-256 hash.
    pub const HEX_LENGTH: usize = 64;

    /// Digest of an in-memory byte slice.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    /// Digest of everything readable from `reader`.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub fn of_reader(mut reader: impl Read) -> QuarryResult<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self::from_hasher(hasher))
    }

    /// Finalize a running hasher into a digest.
    #[must_use]
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a bare hex digest, validating its format.
    ///
    /// # Errors
    ///
    /// Returns an error unless `hex` is 64 lowercase hex characters.
    pub fn from_hex(hex: &str) -> QuarryResult<Self> {
        let valid = hex.len() == Self::HEX_LENGTH
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(hex.to_string()))
        } else {
            Err(QuarryError::Verification {
                message: format!("'{hex}' is not a sha256 hex digest"),
            })
        }
    }

    /// The bare hex encoding.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.0
    }

    /// The `sha256:<hex>` form.
    #[must_use]
    pub fn prefixed(&self) -> String {
        format!("{}:{}", Self::ALGORITHM, self.0)
    }

    /// Returns a short version of the digest (first 12 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Digest {
    type Err = QuarryError;

    /// Accepts both `sha256:<hex>` and bare `<hex>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((Self::ALGORITHM, hex)) => Self::from_hex(hex),
            Some(_) => Err(QuarryError::Verification {
                message: format!("unsupported digest algorithm in '{s}'"),
            }),
            None => Self::from_hex(s),
        }
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
