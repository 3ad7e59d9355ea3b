use std::collections::HashSet;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BearerTokenError {
    #[error("unable to encode bearer token: `{0}`")]
    Encode(String),
    /// Malformed payload or bad signature. Treated by dispatch as
    /// "credentials not understood", not as a hard failure.
    #[error("unable to decode bearer token: `{0}`")]
    Decode(String),
}

/// The decoded contents of a bearer envelope: which provider issued the
/// wrapped token, and the opaque provider token itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerEnvelope {
    pub issuer: String,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeClaims {
    iss: String,
    token: String,
}

/// Signs and verifies the compact, provider-tagged bearer envelope.
///
/// This is a thin HMAC-SHA256 signed wrapper around `{iss, token}`, not a
/// full JWT: there are no expiry or audience claims, and none are validated.
/// Callers that need expiry enforce it through the wrapped [`Credential`]
/// (see [`crate::store::Credential`]), never through the envelope.
pub struct TokenSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenSigner {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims = HashSet::new();
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Wraps a provider token in a compact signed envelope.
    pub fn encode(
        &self,
        provider_name: &str,
        provider_token: &str,
    ) -> Result<String, BearerTokenError> {
        let claims = EnvelopeClaims {
            iss: provider_name.to_string(),
            token: provider_token.to_string(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| BearerTokenError::Encode(e.to_string()))
    }

    /// Verifies the signature and returns the envelope contents.
    pub fn decode(&self, compact: &str) -> Result<BearerEnvelope, BearerTokenError> {
        let data = jsonwebtoken::decode::<EnvelopeClaims>(
            compact,
            &self.decoding_key,
            &self.validation,
        )
        .map_err(|e| BearerTokenError::Decode(e.to_string()))?;
        Ok(BearerEnvelope {
            issuer: data.claims.iss,
            token: data.claims.token,
        })
    }
}
