//! Blobrefs: content hashes serialized as `algo-hex`, used as cache keys
//! and as pointers inside tree objects (spec GLOSSARY, §4.5, §4.6).

use std::fmt;

use sha1::Sha1;
use sha2::{Digest, Sha256};
use weft_base::{invalid, Result};

/// Hash algorithm tag carried in a blobref's `algo-hex` text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algo {
    Sha1,
    Sha256,
}

impl Algo {
    fn tag(self) -> &'static str {
        match self {
            Algo::Sha1 => "sha1",
            Algo::Sha256 => "sha256",
        }
    }

    fn parse_tag(tag: &str) -> Result<Algo> {
        match tag {
            "sha1" => Ok(Algo::Sha1),
            "sha256" => Ok(Algo::Sha256),
            other => Err(invalid(format!("unknown blobref algorithm {other:?}"))),
        }
    }
}

/// A content hash, e.g. `sha256-9f86d0...`. Two blobrefs are equal iff their
/// algorithm and hex digest both match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Blobref {
    algo: &'static str,
    hex: String,
}

impl Blobref {
    /// Hashes `bytes` with the default algorithm (sha256).
    pub fn of(bytes: &[u8]) -> Blobref {
        Blobref::of_with(Algo::Sha256, bytes)
    }

    pub fn of_with(algo: Algo, bytes: &[u8]) -> Blobref {
        let hex = match algo {
            Algo::Sha1 => hex::encode(Sha1::digest(bytes)),
            Algo::Sha256 => hex::encode(Sha256::digest(bytes)),
        };
        Blobref { algo: algo.tag(), hex }
    }

    /// Parses a previously-formatted `algo-hex` string.
    pub fn parse(s: &str) -> Result<Blobref> {
        let (algo, hex) = s.split_once('-').ok_or_else(|| invalid(format!("malformed blobref {s:?}")))?;
        let algo = Algo::parse_tag(algo)?;
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid(format!("malformed blobref hex digest {s:?}")));
        }
        Ok(Blobref { algo: algo.tag(), hex: hex.to_string() })
    }

    /// Verifies that `bytes` hashes to this blobref.
    pub fn verify(&self, bytes: &[u8]) -> bool {
        let algo = Algo::parse_tag(self.algo).expect("Blobref always holds a valid algo tag");
        &Blobref::of_with(algo, bytes) == self
    }

    pub fn as_str(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Blobref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algo, self.hex)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn same_bytes_hash_to_the_same_blobref() {
        let a = Blobref::of(b"hello");
        let b = Blobref::of(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn different_bytes_hash_differently() {
        assert_ne!(Blobref::of(b"hello"), Blobref::of(b"world"));
    }

    #[test]
    fn round_trips_through_display_and_parse() {
        let r = Blobref::of(b"payload");
        let text = r.to_string();
        assert!(text.starts_with("sha256-"));
        let parsed = Blobref::parse(&text).unwrap();
        assert_eq!(r, parsed);
    }

    #[test]
    fn verify_detects_mismatched_content() {
        let r = Blobref::of(b"payload");
        assert!(r.verify(b"payload"));
        assert!(!r.verify(b"not the payload"));
    }

    #[test]
    fn malformed_text_is_rejected() {
        assert!(Blobref::parse("not-a-blobref-at-all-zz").is_err());
        assert!(Blobref::parse("noalgohex").is_err());
    }
}
