//! Content-addressed naming for cache stores: a URL maps to a 32-character
//! lowercase hex MD5 digest, used only as a filesystem-safe identifier.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of an origin URL: MD5 of its UTF-8 bytes, hex-encoded.
    pub fn of_url(url: &str) -> Self {
        let digest = md5::compute(url.as_bytes());
        Self(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True iff `s` is a syntactically valid fingerprint (32 lowercase hex chars).
    pub fn is_valid(s: &str) -> bool {
        s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
#[error("not a valid 32-character hex fingerprint: {0}")]
pub struct InvalidFingerprint(String);

impl FromStr for Fingerprint {
    type Err = InvalidFingerprint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidFingerprint(s.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_url() {
        let a = Fingerprint::of_url("https://example.com/video.mp4");
        let b = Fingerprint::of_url("https://example.com/video.mp4");
        assert_eq!(a, b);
    }

    #[test]
    fn differs_for_different_urls() {
        let a = Fingerprint::of_url("https://example.com/a.mp4");
        let b = Fingerprint::of_url("https://example.com/b.mp4");
        assert_ne!(a, b);
    }

    #[test]
    fn is_32_lowercase_hex_chars() {
        let fp = Fingerprint::of_url("https://example.com/video.mp4");
        assert_eq!(fp.as_str().len(), 32);
        assert!(Fingerprint::is_valid(fp.as_str()));
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!(!Fingerprint::is_valid("not-a-fingerprint"));
        assert!(!Fingerprint::is_valid(""));
        assert!(!Fingerprint::is_valid(&"a".repeat(31)));
        assert!(!Fingerprint::is_valid(&"A".repeat(32)));
        assert!("short".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn known_vector() {
        // md5("") == d41d8cd98f00b204e9800998ecf8427e
        let fp = Fingerprint::of_url("");
        assert_eq!(fp.as_str(), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
