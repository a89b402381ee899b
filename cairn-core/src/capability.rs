//! Publishing capabilities
//!
//! A capability token is `base64url(payload).base64url(signature)`. The
//! payload is JSON:
//! - `iss`: DID of the delegating key (the repo)
//! - `aud`: DID of the agent allowed to publish
//! - `res`: repo DID the delegation applies to
//! - `scope`: always `repo/publish`
//! - `iat` / `exp`: issue and optional expiry time, seconds since epoch
//!
//! The signature is by `iss` over the base64url payload string.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::keys::{verify_signature, Keypair};

/// The only scope this engine issues or accepts.
pub const PUBLISH_SCOPE: &str = "repo/publish";

/// Decoded token payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityClaims {
    pub iss: String,
    pub aud: String,
    pub res: String,
    pub scope: String,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// A verified delegation token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    token: String,
    claims: CapabilityClaims,
}

impl Capability {
    /// Delegate publishing rights on `issuer`'s repo to `audience`
    pub fn delegate(
        issuer: &Keypair,
        audience: &str,
        issued_at: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> Result<Self> {
        let did = issuer.did();
        let claims = CapabilityClaims {
            iss: did.clone(),
            aud: audience.to_string(),
            res: did,
            scope: PUBLISH_SCOPE.to_string(),
            iat: issued_at.timestamp(),
            exp: ttl.map(|ttl| (issued_at + ttl).timestamp()),
        };
        let payload = serde_json::to_vec(&claims).map_err(|e| Error::Encoding(e.to_string()))?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
        let signature = issuer.sign(payload_b64.as_bytes());
        let token = format!("{}.{}", payload_b64, URL_SAFE_NO_PAD.encode(signature));
        Ok(Self { token, claims })
    }

    /// Parse a token and check its signature against the issuer
    pub fn parse(token: &str) -> Result<Self> {
        let (payload_b64, signature_b64) = token
            .split_once('.')
            .ok_or_else(|| Error::InvalidCapability("expected payload.signature".to_string()))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| Error::InvalidCapability(format!("signature encoding: {}", e)))?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| Error::InvalidCapability(format!("payload encoding: {}", e)))?;
        let claims: CapabilityClaims = serde_json::from_slice(&payload)
            .map_err(|e| Error::InvalidCapability(format!("payload: {}", e)))?;

        verify_signature(&claims.iss, payload_b64.as_bytes(), &signature)
            .map_err(|_| Error::InvalidCapability(format!("not signed by issuer {}", claims.iss)))?;

        Ok(Self {
            token: token.to_string(),
            claims,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn claims(&self) -> &CapabilityClaims {
        &self.claims
    }

    /// Whether this token lets `agent` publish to `repo` at time `at`
    pub fn authorizes(&self, agent: &str, repo: &str, at: DateTime<Utc>) -> Result<()> {
        let c = &self.claims;
        let missing = || Error::CapabilityMissing {
            agent: agent.to_string(),
            repo: repo.to_string(),
        };
        if c.iss != repo || c.res != repo || c.aud != agent || c.scope != PUBLISH_SCOPE {
            return Err(missing());
        }
        if self.is_expired(at) {
            return Err(Error::InvalidCapability(format!(
                "delegation to {} expired at {}",
                agent,
                c.exp.unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Whether the delegation has lapsed by `at`
    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        self.claims.exp.is_some_and(|exp| at.timestamp() > exp)
    }

    /// The lifetime the delegation was issued with, if bounded
    pub fn ttl(&self) -> Option<Duration> {
        self.claims.exp.map(|exp| Duration::seconds(exp - self.claims.iat))
    }
}

/// A key able to publish on a repo: the agent's keypair plus its delegation
#[derive(Debug, Clone)]
pub struct Signer {
    keypair: Arc<Keypair>,
    capability: Capability,
}

impl Signer {
    pub fn new(keypair: Arc<Keypair>, capability: Capability) -> Self {
        Self { keypair, capability }
    }

    /// Sign with the repo's own key, presenting a self-delegation
    pub fn root(repo_key: Arc<Keypair>, now: DateTime<Utc>) -> Result<Self> {
        let capability = Capability::delegate(&repo_key, &repo_key.did(), now, None)?;
        Ok(Self::new(repo_key, capability))
    }

    pub fn did(&self) -> String {
        self.keypair.did()
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keypair.sign(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delegation_authorizes_audience() {
        let repo = Keypair::generate();
        let agent = Keypair::generate();
        let now = Utc::now();
        let cap = Capability::delegate(&repo, &agent.did(), now, None).unwrap();

        let parsed = Capability::parse(cap.token()).unwrap();
        assert_eq!(parsed, cap);
        parsed.authorizes(&agent.did(), &repo.did(), now).unwrap();

        let other = Keypair::generate();
        assert!(matches!(
            parsed.authorizes(&other.did(), &repo.did(), now),
            Err(Error::CapabilityMissing { .. })
        ));
        assert!(parsed.authorizes(&agent.did(), &other.did(), now).is_err());
    }

    #[test]
    fn test_expired_delegation_rejected() {
        let repo = Keypair::generate();
        let agent = Keypair::generate();
        let now = Utc::now();
        let cap = Capability::delegate(&repo, &agent.did(), now, Some(Duration::hours(1))).unwrap();
        cap.authorizes(&agent.did(), &repo.did(), now).unwrap();
        assert_eq!(cap.ttl(), Some(Duration::hours(1)));
        assert!(!cap.is_expired(now));
        assert!(cap.is_expired(now + Duration::hours(2)));
        assert!(matches!(
            cap.authorizes(&agent.did(), &repo.did(), now + Duration::hours(2)),
            Err(Error::InvalidCapability(_))
        ));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let repo = Keypair::generate();
        let agent = Keypair::generate();
        let cap = Capability::delegate(&repo, &agent.did(), Utc::now(), None).unwrap();

        // Re-sign the same payload with a different key
        let (payload_b64, _) = cap.token().split_once('.').unwrap();
        let forged = format!(
            "{}.{}",
            payload_b64,
            URL_SAFE_NO_PAD.encode(agent.sign(payload_b64.as_bytes()))
        );
        assert!(matches!(Capability::parse(&forged), Err(Error::InvalidCapability(_))));
        assert!(Capability::parse("no-dot").is_err());
    }

    #[test]
    fn test_root_signer_self_delegates() {
        let repo = Arc::new(Keypair::generate());
        let signer = Signer::root(repo.clone(), Utc::now()).unwrap();
        assert_eq!(signer.did(), repo.did());
        signer
            .capability()
            .authorizes(&repo.did(), &repo.did(), Utc::now())
            .unwrap();
    }
}
