//! Content identifiers
//!
//! Every block in a store is addressed by a CIDv1 over its canonical bytes.
//! The codec (dag-cbor) and hash function (sha2-256) are fixed for the whole
//! store, so a `Cid` only carries the digest; the multicodec prefix is
//! reconstructed for the binary and string forms.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::base32;
use crate::error::{Error, Result};

/// CID version byte.
pub const CID_VERSION: u8 = 0x01;

/// Multicodec code of the canonical block codec (dag-cbor).
pub const DAG_CBOR_CODEC: u8 = 0x71;

/// Multihash code of sha2-256.
pub const SHA2_256_CODE: u8 = 0x12;

/// Digest length of sha2-256.
pub const DIGEST_LEN: usize = 32;

/// Length of the binary CID form.
pub const CID_LEN: usize = 4 + DIGEST_LEN;

const PREFIX: [u8; 4] = [CID_VERSION, DAG_CBOR_CODEC, SHA2_256_CODE, DIGEST_LEN as u8];

/// Multibase prefix of base32-lower strings.
const MULTIBASE_BASE32: char = 'b';

/// Address of a block
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid([u8; DIGEST_LEN]);

impl Cid {
    /// Create a CID from a raw sha2-256 digest
    pub fn new(digest: [u8; DIGEST_LEN]) -> Self {
        Self(digest)
    }

    /// Compute the CID of canonical block bytes
    pub fn for_block(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Raw digest
    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Binary CIDv1 form: version, codec, multihash header and digest
    pub fn to_bytes(&self) -> [u8; CID_LEN] {
        let mut out = [0u8; CID_LEN];
        out[..4].copy_from_slice(&PREFIX);
        out[4..].copy_from_slice(&self.0);
        out
    }

    /// Parse the binary form. Only the store's codec and hash are accepted.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CID_LEN {
            return Err(Error::Decoding(format!(
                "CID must be {} bytes, got {}",
                CID_LEN,
                bytes.len()
            )));
        }
        if bytes[..4] != PREFIX {
            return Err(Error::Decoding(format!(
                "unsupported CID prefix {}",
                hex::encode(&bytes[..4])
            )));
        }
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes[4..]);
        Ok(Self(digest))
    }

    /// Lowercase hex of the binary form, used as a storage key
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            MULTIBASE_BASE32,
            base32::encode(base32::RFC4648_LOWER, &self.to_bytes())
        )
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self)
    }
}

impl FromStr for Cid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix(MULTIBASE_BASE32)
            .ok_or_else(|| Error::Decoding(format!("unsupported multibase in CID {:?}", s)))?;
        let bytes = base32::decode(base32::RFC4648_LOWER, body)
            .ok_or_else(|| Error::Decoding(format!("invalid base32 in CID {:?}", s)))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Render an optional head for messages.
pub fn display_head(head: &Option<Cid>) -> String {
    match head {
        Some(cid) => cid.to_string(),
        None => "<empty>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_string_roundtrip() {
        let cid = Cid::for_block(b"hello world");
        let s = cid.to_string();
        assert!(s.starts_with("bafyrei"));
        assert_eq!(s.parse::<Cid>().unwrap(), cid);
    }

    #[test]
    fn test_cid_binary_roundtrip() {
        let cid = Cid::for_block(b"block");
        let bytes = cid.to_bytes();
        assert_eq!(bytes.len(), CID_LEN);
        assert_eq!(Cid::from_bytes(&bytes).unwrap(), cid);
    }

    #[test]
    fn test_cid_rejects_foreign_codec() {
        let mut bytes = Cid::for_block(b"x").to_bytes();
        bytes[1] = 0x55;
        assert!(Cid::from_bytes(&bytes).is_err());
        assert!(Cid::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_cid_serde_as_string() {
        let cid = Cid::for_block(b"json");
        let json = serde_json::to_string(&cid).unwrap();
        assert_eq!(json, format!("\"{}\"", cid));
        let back: Cid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cid);
    }
}
