use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::AuthError;

/// Number of random bytes behind a verifier unless the caller asks otherwise.
pub const DEFAULT_VERIFIER_BYTES: usize = 64;

const MIN_VERIFIER_CHARS: usize = 43;
const MAX_VERIFIER_CHARS: usize = 128;

/// PKCE code verifier and challenge pair.
///
/// The challenge is always derived from the verifier; there is no way to build
/// a pair from two independent values.
#[derive(Clone)]
pub struct PkcePair {
    verifier: String,
    challenge: String,
}

impl PkcePair {
    /// Create a new random verifier/challenge pair following RFC 7636 recommendations.
    pub fn generate() -> Result<Self, AuthError> {
        Self::with_length(DEFAULT_VERIFIER_BYTES)
    }

    /// Create a pair whose verifier is built from `byte_len` random bytes.
    pub fn with_length(byte_len: usize) -> Result<Self, AuthError> {
        let verifier = generate_verifier(byte_len)?;
        let challenge = derive_challenge(&verifier);
        Ok(Self {
            verifier,
            challenge,
        })
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn method(&self) -> &'static str {
        "S256"
    }
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkcePair")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// Fill `byte_len` bytes from the OS random source and encode them base64url without padding.
pub fn generate_verifier(byte_len: usize) -> Result<String, AuthError> {
    match encoded_len(byte_len) {
        Some(len) if (MIN_VERIFIER_CHARS..=MAX_VERIFIER_CHARS).contains(&len) => {}
        _ => return Err(AuthError::InvalidVerifierLength(byte_len)),
    }
    let mut bytes = vec![0u8; byte_len];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// SHA-256 over the verifier, encoded base64url without padding.
pub fn derive_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

fn encoded_len(byte_len: usize) -> Option<usize> {
    byte_len.checked_mul(4).map(|bits| bits.div_ceil(3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_meets_length_requirement() {
        let pair = PkcePair::generate().unwrap();
        assert!(pair.verifier().len() >= 43);
        assert!(pair.verifier().len() <= 128);
        assert_eq!(pair.verifier().len(), 86);
        assert!(!pair.challenge().is_empty());
    }

    #[test]
    fn challenge_is_derived_from_verifier() {
        let pair = PkcePair::generate().unwrap();
        assert_eq!(pair.challenge(), derive_challenge(pair.verifier()));
        assert_eq!(pair.method(), "S256");
    }

    #[test]
    fn challenge_matches_rfc7636_example() {
        let challenge = derive_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn challenge_is_deterministic_and_url_safe() {
        for byte_len in [32usize, 48, 64, 96] {
            let verifier = generate_verifier(byte_len).unwrap();
            assert!(verifier.len() >= 43);
            let first = derive_challenge(&verifier);
            let second = derive_challenge(&verifier);
            assert_eq!(first, second);
            assert!(!first.contains(['+', '/', '=']));
            assert!(!verifier.contains(['+', '/', '=']));
        }
    }

    #[test]
    fn rejects_lengths_outside_rfc_range() {
        assert!(matches!(
            generate_verifier(16),
            Err(AuthError::InvalidVerifierLength(16))
        ));
        assert!(matches!(
            generate_verifier(128),
            Err(AuthError::InvalidVerifierLength(128))
        ));
        assert!(matches!(
            generate_verifier(usize::MAX),
            Err(AuthError::InvalidVerifierLength(usize::MAX))
        ));
        assert!(PkcePair::with_length(usize::MAX / 2).is_err());
    }

    #[test]
    fn debug_output_hides_verifier() {
        let pair = PkcePair::generate().unwrap();
        let rendered = format!("{pair:?}");
        assert!(!rendered.contains(pair.verifier()));
    }
}
