//! Connection-handshake identity verification.
//!
//! Token issuance belongs to the job-board's auth service; the relay only
//! validates a presented bearer token and extracts the stable user id. A
//! connection with no valid identity is refused before any room logic runs.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("token validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token missing subject")]
    MissingSubject,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    exp: u64,
}

#[derive(Clone)]
pub struct IdentityVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl IdentityVerifier {
    pub fn new(secret: &str, issuer: Option<&str>, audience: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = audience {
            validation.set_audience(&[audience]);
        }
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Map a presented credential to a stable user id.
    pub fn verify(&self, token: &str) -> Result<String, IdentityError> {
        let data = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)?;
        if data.claims.sub.trim().is_empty() {
            return Err(IdentityError::MissingSubject);
        }
        Ok(data.claims.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn token(secret: &str, sub: &str) -> String {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock ok")
            .as_secs()
            + 600;
        encode(
            &Header::default(),
            &AccessTokenClaims {
                sub: sub.into(),
                exp,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("encode ok")
    }

    #[test]
    fn valid_token_yields_subject() {
        let verifier = IdentityVerifier::new("s3cret", None, None);
        assert_eq!(verifier.verify(&token("s3cret", "alice")).expect("ok"), "alice");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let verifier = IdentityVerifier::new("s3cret", None, None);
        assert!(verifier.verify(&token("other", "alice")).is_err());
    }

    #[test]
    fn blank_subject_is_rejected() {
        let verifier = IdentityVerifier::new("s3cret", None, None);
        assert!(matches!(
            verifier.verify(&token("s3cret", "  ")),
            Err(IdentityError::MissingSubject)
        ));
    }
}
