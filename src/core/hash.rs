// Hashing and signature primitives

use crate::core::Identity;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("digest must be 32 hex-encoded bytes")]
    InvalidDigest,
    #[error("secp256k1: {0}")]
    Secp(#[from] secp256k1::Error),
}

/// Single SHA256 hash
pub fn sha256_hash(data: &[u8]) -> [u8; 32] {
    let hash = Sha256::digest(data);
    let mut result = [0u8; 32];
    result.copy_from_slice(&hash);
    result
}

/// SHA256 rendered as lowercase hex, the digest form stored in blocks and transactions
pub fn hash_hex(data: &[u8]) -> String {
    hex::encode(sha256_hash(data))
}

/// Identity string for a public key
pub fn identity_of(public_key: &PublicKey) -> Identity {
    Identity(hex::encode(public_key.serialize()))
}

fn digest_message(digest_hex: &str) -> Result<Message, SignError> {
    let bytes = hex::decode(digest_hex).map_err(|_| SignError::InvalidDigest)?;
    Message::from_digest_slice(&bytes).map_err(|_| SignError::InvalidDigest)
}

/// Sign a hex digest, returning the compact signature as hex
pub fn sign_digest(digest_hex: &str, secret_key: &SecretKey) -> Result<String, SignError> {
    let secp = Secp256k1::signing_only();
    let message = digest_message(digest_hex)?;
    let signature = secp.sign_ecdsa(&message, secret_key);
    Ok(hex::encode(signature.serialize_compact()))
}

/// Verify a hex signature over a hex digest under `identity`.
///
/// Malformed inputs of any kind verify as false.
pub fn verify_digest(digest_hex: &str, signature_hex: &str, identity: &Identity) -> bool {
    let Ok(message) = digest_message(digest_hex) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_compact(&sig_bytes) else {
        return false;
    };
    let Ok(key_bytes) = hex::decode(identity.as_str()) else {
        return false;
    };
    let Ok(public_key) = PublicKey::from_slice(&key_bytes) else {
        return false;
    };

    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&message, &signature, &public_key).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> (SecretKey, Identity) {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::new(&mut OsRng);
        let identity = identity_of(&secret_key.public_key(&secp));
        (secret_key, identity)
    }

    #[test]
    fn test_hash_hex() {
        let hash = hash_hex(b"hello world");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_hex(b"hello world"));
        assert_ne!(hash, hash_hex(b"hello world!"));
    }

    #[test]
    fn test_sign_and_verify() {
        let (secret_key, identity) = keypair();
        let digest = hash_hex(b"payload");

        let signature = sign_digest(&digest, &secret_key).unwrap();
        assert!(verify_digest(&digest, &signature, &identity));

        let (_, other) = keypair();
        assert!(!verify_digest(&digest, &signature, &other));
        assert!(!verify_digest(&hash_hex(b"other"), &signature, &identity));
    }

    #[test]
    fn test_verify_malformed_inputs() {
        let (secret_key, identity) = keypair();
        let digest = hash_hex(b"payload");
        let signature = sign_digest(&digest, &secret_key).unwrap();

        assert!(!verify_digest("not-hex", &signature, &identity));
        assert!(!verify_digest(&digest, "zz", &identity));
        assert!(!verify_digest(&digest, "00", &identity));
        assert!(!verify_digest(&digest, &signature, &Identity::new("02")));
        assert!(!verify_digest(&digest, &signature, &Identity::default()));
    }

    #[test]
    fn test_sign_rejects_bad_digest() {
        let (secret_key, _) = keypair();
        assert!(sign_digest("abcd", &secret_key).is_err());
    }
}
