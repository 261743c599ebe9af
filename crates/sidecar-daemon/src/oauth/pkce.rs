//! PKCE (RFC 7636) state, verifier and S256 challenge.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

/// Per-login secrets. The verifier never leaves the daemon.
#[derive(Debug, Clone)]
pub struct PkceContext {
    pub state: String,
    pub verifier: String,
    pub challenge: String,
}

impl PkceContext {
    pub fn generate() -> Self {
        let verifier = random_token(2);
        Self {
            state: random_token(1),
            challenge: challenge_for(&verifier),
            verifier,
        }
    }
}

/// base64url of SHA-256(verifier), without padding.
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// `blocks` × 16 random bytes from v4 UUIDs, base64url encoded.
fn random_token(blocks: usize) -> String {
    let bytes: Vec<u8> = (0..blocks)
        .flat_map(|_| *uuid::Uuid::new_v4().as_bytes())
        .collect();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc7636_appendix_b_vector() {
        assert_eq!(
            challenge_for("dBjftJeZ4CVP-1mUHrS1IG6gpvRWtbkMS5N4eV4Ry0Q"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn generated_contexts_are_unique_and_consistent() {
        let a = PkceContext::generate();
        let b = PkceContext::generate();
        assert_ne!(a.state, b.state);
        assert_ne!(a.verifier, b.verifier);
        assert_eq!(a.verifier.len(), 43);
        assert_eq!(a.challenge, challenge_for(&a.verifier));
        assert!(!a.verifier.contains('='));
    }
}
