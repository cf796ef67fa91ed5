//! Random tokens and PKCE material.
//!
//! `state` values, session tokens and PKCE verifiers are all drawn from the
//! thread-local CSPRNG over a fixed 34-character alphabet.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Alphabet for generated tokens (no `l` or `o`, to avoid confusion with digits).
pub const TOKEN_ALPHABET: &[u8] = b"0123456789abcdefghijkmnpqrstuvwxyz";

/// Length of `state` values and session tokens.
pub const TOKEN_LENGTH: usize = 32;

/// Length of PKCE code verifiers (RFC 7636 allows 43..=128).
pub const CODE_VERIFIER_LENGTH: usize = 64;

/// Generate `len` random characters from [`TOKEN_ALPHABET`].
pub fn random_text(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| TOKEN_ALPHABET[rng.random_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Generate a random `state` parameter for an authorization request.
pub fn generate_state() -> String {
    random_text(TOKEN_LENGTH)
}

/// Generate a random session token.
pub fn generate_session_token() -> String {
    random_text(TOKEN_LENGTH)
}

/// PKCE verifier/challenge pair.
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

/// Generate PKCE code_verifier and S256 code_challenge
pub fn generate_pkce() -> Pkce {
    let verifier = random_text(CODE_VERIFIER_LENGTH);
    let challenge = code_challenge(&verifier);
    Pkce {
        verifier,
        challenge,
    }
}

/// `BASE64URL(SHA256(verifier))`
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}
