// Key management and node configuration file

use crate::core::{Identity, identity_of};
use rand::rngs::OsRng;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("config file: {0}")]
    Io(#[from] io::Error),
    #[error("config format: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid secret key: {0}")]
    InvalidKey(String),
}

/// Key pair
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
    pub identity: Identity,
}

impl KeyPair {
    /// Generate a new key pair
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = secret_key.public_key(&secp);
        let identity = identity_of(&public_key);
        Self {
            secret_key,
            public_key,
            identity,
        }
    }

    /// Create from a hex-encoded 32-byte secret
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, KeystoreError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| KeystoreError::InvalidKey(e.to_string()))?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|e| KeystoreError::InvalidKey(e.to_string()))?;
        Ok(Self::from_secret_key(secret_key))
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret
        f.debug_struct("KeyPair").field("identity", &self.identity).finish()
    }
}

/// On-disk node settings, read once at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Hex-encoded secp256k1 secret key
    pub secret_key: String,
    /// Socket address to bind
    pub listen_addr: String,
    /// Address other peers should dial to reach us
    pub advertised_addr: String,
    #[serde(default)]
    pub peers: Vec<String>,
}

impl NodeConfig {
    /// Fresh identity with the given addresses
    pub fn generate(listen_addr: &str, advertised_addr: Option<&str>, peers: Vec<String>) -> Self {
        Self {
            secret_key: KeyPair::generate().secret_hex(),
            listen_addr: listen_addr.to_string(),
            advertised_addr: advertised_addr.unwrap_or(listen_addr).to_string(),
            peers,
        }
    }

    pub fn key_pair(&self) -> Result<KeyPair, KeystoreError> {
        KeyPair::from_secret_hex(&self.secret_key)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), KeystoreError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, KeystoreError> {
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        // Fail at load time rather than at first signature
        config.key_pair()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = KeyPair::generate();
        assert_eq!(kp.identity.as_str().len(), 66); // compressed pubkey, hex
        assert_eq!(kp.public_key.serialize().len(), 33);
    }

    #[test]
    fn test_secret_hex_roundtrip() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_secret_hex(&kp.secret_hex()).unwrap();
        assert_eq!(restored.identity, kp.identity);

        assert!(matches!(
            KeyPair::from_secret_hex("not hex"),
            Err(KeystoreError::InvalidKey(_))
        ));
        assert!(KeyPair::from_secret_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let kp = KeyPair::generate();
        let printed = format!("{:?}", kp);
        assert!(!printed.contains(&kp.secret_hex()));
        assert!(printed.contains(kp.identity.as_str()));
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");

        let config = NodeConfig::generate("127.0.0.1:7000", None, vec!["127.0.0.1:7001".into()]);
        assert_eq!(config.advertised_addr, "127.0.0.1:7000");
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.key_pair().unwrap().identity, config.key_pair().unwrap().identity);
    }

    #[test]
    fn test_config_rejects_bad_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        fs::write(
            &path,
            r#"{"secret_key":"zz","listen_addr":"a","advertised_addr":"a"}"#,
        )
        .unwrap();
        assert!(matches!(NodeConfig::load(&path), Err(KeystoreError::InvalidKey(_))));

        fs::write(&path, "{").unwrap();
        assert!(matches!(NodeConfig::load(&path), Err(KeystoreError::Json(_))));
    }
}
