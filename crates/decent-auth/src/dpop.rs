//! DPoP (Demonstrating Proof of Possession) for ATProto OAuth
//!
//! DPoP is mandatory for ATProto OAuth. This module handles:
//! - ES256 (P-256) keypair generation, one per login attempt
//! - export/import of the private key as a JWK string, so the key can be
//!   parked in the auth request between the redirect and the callback
//! - DPoP proof JWT creation

use crate::AuthError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use p256::elliptic_curve::rand_core::OsRng;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::SecretKey;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How long a proof stays valid, in seconds
const PROOF_LIFETIME_SECS: i64 = 300;

/// DPoP keypair for a single login attempt
#[derive(Clone)]
pub struct DpopKeyPair {
    secret_key: SecretKey,
    signing_key: SigningKey,
}

impl std::fmt::Debug for DpopKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpopKeyPair").finish_non_exhaustive()
    }
}

impl DpopKeyPair {
    /// Generate a new DPoP keypair
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    fn from_secret(secret_key: SecretKey) -> Self {
        let signing_key = SigningKey::from(secret_key.clone());
        Self {
            secret_key,
            signing_key,
        }
    }

    /// Export the private key as a JWK string.
    pub fn export(&self) -> String {
        self.secret_key.to_jwk_string().to_string()
    }

    /// Re-import a key produced by [`DpopKeyPair::export`].
    pub fn import(jwk: &str) -> Result<Self, AuthError> {
        let secret_key = SecretKey::from_jwk_str(jwk)
            .map_err(|e| AuthError::CryptoError(format!("Invalid DPoP key: {}", e)))?;
        Ok(Self::from_secret(secret_key))
    }

    /// Get the public key as a JWK
    pub fn public_jwk(&self) -> Result<DpopJwk, AuthError> {
        let point = self.secret_key.public_key().to_encoded_point(false);
        let (x, y) = match (point.x(), point.y()) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                return Err(AuthError::CryptoError(
                    "DPoP public key has no affine coordinates".to_string(),
                ))
            }
        };

        Ok(DpopJwk {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x: URL_SAFE_NO_PAD.encode(x),
            y: URL_SAFE_NO_PAD.encode(y),
        })
    }

    /// Create a DPoP proof JWT for a request
    ///
    /// * `method` - HTTP method (e.g., "POST")
    /// * `url` - Full request URL
    /// * `nonce` - Server-provided nonce, if one has been issued
    /// * `access_token` - Access token, for the `ath` claim on resource requests
    pub fn create_proof(
        &self,
        method: &str,
        url: &str,
        nonce: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<String, AuthError> {
        let now = chrono::Utc::now().timestamp();

        let jti: String = {
            let bytes: [u8; 16] = rand::rng().random();
            URL_SAFE_NO_PAD.encode(bytes)
        };

        let header = DpopHeader {
            typ: "dpop+jwt".to_string(),
            alg: "ES256".to_string(),
            jwk: self.public_jwk()?,
        };

        let claims = DpopClaims {
            jti,
            htm: method.to_uppercase(),
            htu: url.to_string(),
            iat: now,
            exp: Some(now + PROOF_LIFETIME_SECS),
            nonce: nonce.map(String::from),
            ath: access_token.map(|token| URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))),
        };

        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signing_input = format!("{}.{}", header_b64, claims_b64);

        let signature: Signature = self.signing_key.sign(signing_input.as_bytes());
        let sig_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

        Ok(format!("{}.{}", signing_input, sig_b64))
    }
}

/// DPoP JWT header
#[derive(Debug, Serialize, Deserialize)]
struct DpopHeader {
    typ: String,
    alg: String,
    jwk: DpopJwk,
}

/// DPoP public key in JWK format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpopJwk {
    kty: String,
    crv: String,
    x: String,
    y: String,
}

/// DPoP JWT claims
#[derive(Debug, Serialize, Deserialize)]
struct DpopClaims {
    jti: String,
    htm: String,
    htu: String,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ath: Option<String>,
}
