//! Signing keys and the key store
//!
//! Keys are ed25519. A key's identity is a `did:key` string carrying the
//! public key, so a signature can be checked from the DID alone.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use rusqlite::{Connection, OptionalExtension};
use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use crate::capability::Capability;
use crate::error::{Error, Result};

/// Prefix of `did:key` identifiers with a base58btc multibase body.
const DID_KEY_PREFIX: &str = "did:key:z";

/// Multicodec header of an ed25519 public key.
const ED25519_PUB_CODEC: [u8; 2] = [0xed, 0x01];

/// Label of the node's long-lived instance key.
pub const INSTANCE_LABEL: &str = "instance";

/// An ed25519 signing keypair bound to a DID
pub struct Keypair {
    signing: SigningKey,
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair").field("did", &self.did()).finish()
    }
}

impl Keypair {
    /// Generate a fresh random keypair
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from a 32-byte secret
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// `did:key` identifier of this keypair
    pub fn did(&self) -> String {
        did_for_public_key(&self.public_bytes())
    }

    /// Sign a message, returning the 64-byte signature
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

/// Build the `did:key` for a raw ed25519 public key
pub fn did_for_public_key(public: &[u8; 32]) -> String {
    let mut body = Vec::with_capacity(34);
    body.extend_from_slice(&ED25519_PUB_CODEC);
    body.extend_from_slice(public);
    format!("{}{}", DID_KEY_PREFIX, bs58::encode(body).into_string())
}

/// Recover the public key carried by a `did:key`
pub fn public_key_from_did(did: &str) -> Result<VerifyingKey> {
    let body = did
        .strip_prefix(DID_KEY_PREFIX)
        .ok_or_else(|| Error::InvalidDid(did.to_string()))?;
    let bytes = bs58::decode(body)
        .into_vec()
        .map_err(|e| Error::InvalidDid(format!("{}: {}", did, e)))?;
    if bytes.len() != 34 || bytes[..2] != ED25519_PUB_CODEC {
        return Err(Error::InvalidDid(format!("{}: not an ed25519 key", did)));
    }
    let mut public = [0u8; 32];
    public.copy_from_slice(&bytes[2..]);
    VerifyingKey::from_bytes(&public).map_err(|e| Error::InvalidDid(format!("{}: {}", did, e)))
}

/// Check `signature` over `message` against the key named by `did`
pub fn verify_signature(did: &str, message: &[u8], signature: &[u8]) -> Result<()> {
    let key = public_key_from_did(did)?;
    let bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| Error::SignatureInvalid(format!("signature must be 64 bytes, got {}", signature.len())))?;
    key.verify(message, &Signature::from_bytes(&bytes))
        .map_err(|_| Error::SignatureInvalid(format!("signature does not verify for {}", did)))
}

/// SQLite-backed store of keypairs and delegated capabilities
pub struct KeyStore {
    conn: Mutex<Connection>,
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS keypairs (
            did TEXT PRIMARY KEY,
            label TEXT UNIQUE,
            secret BLOB NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS capabilities (
            resource TEXT NOT NULL,
            audience TEXT NOT NULL,
            token TEXT NOT NULL,
            PRIMARY KEY (resource, audience)
        ) WITHOUT ROWID;",
    )?;
    Ok(())
}

impl KeyStore {
    /// Open or create the key store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("key store lock poisoned".to_string()))
    }

    /// Persist a keypair, optionally under a unique label
    pub fn store_keypair(&self, keypair: &Keypair, label: Option<&str>) -> Result<()> {
        let did = keypair.did();
        self.conn()?.execute(
            "INSERT OR REPLACE INTO keypairs (did, label, secret, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                did,
                label,
                keypair.secret_bytes().as_slice(),
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        info!("Stored keypair {}", did);
        Ok(())
    }

    fn load(&self, sql: &str, key: &str) -> Result<Option<Keypair>> {
        let secret: Option<Vec<u8>> = self
            .conn()?
            .query_row(sql, [key], |row| row.get(0))
            .optional()?;
        match secret {
            None => Ok(None),
            Some(bytes) => {
                let secret: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| Error::Storage(format!("corrupt secret key for {}", key)))?;
                Ok(Some(Keypair::from_secret(&secret)))
            }
        }
    }

    /// Keypair whose DID is `did`
    pub fn keypair(&self, did: &str) -> Result<Option<Keypair>> {
        self.load("SELECT secret FROM keypairs WHERE did = ?1", did)
    }

    /// Keypair stored under `label`
    pub fn keypair_by_label(&self, label: &str) -> Result<Option<Keypair>> {
        self.load("SELECT secret FROM keypairs WHERE label = ?1", label)
    }

    /// Remember a delegation so later commits can present it
    pub fn store_capability(&self, capability: &Capability) -> Result<()> {
        let claims = capability.claims();
        self.conn()?.execute(
            "INSERT OR REPLACE INTO capabilities (resource, audience, token) VALUES (?1, ?2, ?3)",
            rusqlite::params![claims.res, claims.aud, capability.token()],
        )?;
        Ok(())
    }

    /// Stored delegation for `audience` on `resource`
    pub fn capability(&self, resource: &str, audience: &str) -> Result<Option<Capability>> {
        let token: Option<String> = self
            .conn()?
            .query_row(
                "SELECT token FROM capabilities WHERE resource = ?1 AND audience = ?2",
                [resource, audience],
                |row| row.get(0),
            )
            .optional()?;
        token.map(|t| Capability::parse(&t)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_did_roundtrip() {
        let kp = Keypair::generate();
        let did = kp.did();
        assert!(did.starts_with("did:key:z6Mk"));
        let public = public_key_from_did(&did).unwrap();
        assert_eq!(public.to_bytes(), kp.public_bytes());
    }

    #[test]
    fn test_sign_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"commit");
        verify_signature(&kp.did(), b"commit", &sig).unwrap();
        assert!(matches!(
            verify_signature(&kp.did(), b"other", &sig),
            Err(Error::SignatureInvalid(_))
        ));
        let stranger = Keypair::generate();
        assert!(verify_signature(&stranger.did(), b"commit", &sig).is_err());
        assert!(verify_signature(&kp.did(), b"commit", &sig[..10]).is_err());
    }

    #[test]
    fn test_invalid_dids() {
        assert!(public_key_from_did("did:web:example.org").is_err());
        assert!(public_key_from_did("did:key:z111").is_err());
    }

    #[test]
    fn test_keystore_persists_keys_and_capabilities() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.sqlite");
        let repo = Keypair::generate();
        let agent = Keypair::generate();
        let cap = Capability::delegate(&repo, &agent.did(), chrono::Utc::now(), None).unwrap();
        {
            let store = KeyStore::open(&path).unwrap();
            store.store_keypair(&repo, None).unwrap();
            store.store_keypair(&agent, Some(INSTANCE_LABEL)).unwrap();
            store.store_capability(&cap).unwrap();
        }
        let store = KeyStore::open(&path).unwrap();
        assert_eq!(store.keypair(&repo.did()).unwrap().unwrap().did(), repo.did());
        assert_eq!(
            store.keypair_by_label(INSTANCE_LABEL).unwrap().unwrap().did(),
            agent.did()
        );
        let loaded = store.capability(&repo.did(), &agent.did()).unwrap().unwrap();
        assert_eq!(loaded.token(), cap.token());
        assert!(store.capability(&agent.did(), &repo.did()).unwrap().is_none());
    }
}
