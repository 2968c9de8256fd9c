//! Content digests (`sha256:<hex>`).

use std::fmt;
use std::str::FromStr;

use cont_core::error::{ContError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// The only digest algorithm accepted by the store.
pub const SHA256: &str = "sha256";

/// A validated content digest.
///
/// Always lowercase `sha256:` followed by 64 hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse a digest string.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, hex_part) = s.split_once(':').ok_or_else(|| {
            ContError::InvalidReference(format!("Invalid digest '{}': expected algorithm:hex", s))
        })?;
        if algorithm != SHA256 {
            return Err(ContError::InvalidReference(format!(
                "Unsupported digest algorithm '{}' in '{}'",
                algorithm, s
            )));
        }
        if hex_part.len() != 64
            || !hex_part
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(ContError::InvalidReference(format!(
                "Invalid sha256 digest '{}': expected 64 lowercase hex characters",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Compute the digest of a byte slice.
    pub fn of(bytes: &[u8]) -> Self {
        Self(format!("{}:{}", SHA256, hex::encode(Sha256::digest(bytes))))
    }

    /// True if `bytes` hash to this digest.
    pub fn verify(&self, bytes: &[u8]) -> bool {
        Self::of(bytes) == *self
    }

    /// Hex part without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0[SHA256.len() + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = ContError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = ContError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_of_known_value() {
        assert_eq!(Digest::of(b"hello").as_str(), HELLO);
    }

    #[test]
    fn test_verify() {
        let d = Digest::of(b"hello");
        assert!(d.verify(b"hello"));
        assert!(!d.verify(b"hello!"));
    }

    #[test]
    fn test_parse_valid() {
        let d = Digest::parse(HELLO).unwrap();
        assert_eq!(d.hex().len(), 64);
        assert_eq!(d.to_string(), HELLO);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Digest::parse("sha256").is_err());
        assert!(Digest::parse("md5:abc").is_err());
        assert!(Digest::parse("sha256:abc").is_err());
        assert!(Digest::parse(&HELLO.to_uppercase().replace("SHA256", "sha256")).is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let d = Digest::of(b"hello");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", HELLO));
        assert!(serde_json::from_str::<Digest>("\"sha256:nothex\"").is_err());
    }
}
