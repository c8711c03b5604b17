//! Session tokens binding a session id to its egress allowlist.
//!
//! The manager issues one token per session; the egress proxy is the only
//! consumer. Tokens are HS256 JWTs signed with the shared process secret.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Extra validity beyond the session idle TTL, so a token outlives its
/// session by a small margin rather than expiring mid-request.
const EXPIRY_SLACK_SECS: i64 = 300;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionClaims {
    /// Session id.
    pub sub: String,
    /// Hosts this session may reach through the egress proxy.
    pub hosts: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Generate a fresh 32-byte hex secret for single-process deployments.
    pub fn generate_secret() -> String {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Issue a token for a session. Lifetime: session TTL plus slack.
    pub fn issue(
        &self,
        session_id: &str,
        hosts: &[String],
        session_ttl_secs: u64,
    ) -> anyhow::Result<String> {
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            sub: session_id.to_string(),
            hosts: hosts.to_vec(),
            iat: now,
            exp: now + session_ttl_secs as i64 + EXPIRY_SLACK_SECS,
        };
        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("token encode error: {e}"))?;
        Ok(token)
    }

    /// Verify signature and expiry, returning the decoded claims.
    pub fn verify(&self, token: &str) -> anyhow::Result<SessionClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);
        let data = decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| anyhow::anyhow!("token verify error: {e}"))?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_service() -> TokenService {
        TokenService::new("test-secret-agentcell")
    }

    #[test]
    fn issue_verify_roundtrip() {
        let svc = make_service();
        let hosts = vec!["pypi.org".to_string(), "crates.io".to_string()];
        let token = svc.issue("sess-1", &hosts, 1800).unwrap();
        let claims = svc.verify(&token).unwrap();
        assert_eq!(claims.sub, "sess-1");
        assert_eq!(claims.hosts, hosts);
        assert!(claims.exp > claims.iat + 1800);
    }

    #[test]
    fn expired_token_is_rejected() {
        let svc = make_service();
        let past = Utc::now().timestamp() - 7200;
        let claims = SessionClaims {
            sub: "sess-2".into(),
            hosts: vec![],
            iat: past - 1800,
            exp: past,
        };
        let token = encode(&Header::default(), &claims, &svc.encoding_key).unwrap();
        assert!(svc.verify(&token).is_err(), "expired token must be rejected");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let svc = make_service();
        let token = svc.issue("sess-3", &["example.com".into()], 60).unwrap();
        let other = TokenService::new("different-secret");
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let svc = make_service();
        let token = svc.issue("sess-4", &["example.com".into()], 60).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = "eyJzdWIiOiJzZXNzLTQiLCJob3N0cyI6WyJldmlsLmNvbSJdfQ";
        parts[1] = forged;
        let tampered = parts.join(".");
        assert!(svc.verify(&tampered).is_err());
    }

    #[test]
    fn generated_secrets_are_distinct_hex() {
        let a = TokenService::generate_secret();
        let b = TokenService::generate_secret();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
