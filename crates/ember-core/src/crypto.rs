//! Signing identity and digests
//!
//! Ed25519 keys and SHA-256 from `ring`. Keys are stored on disk as the
//! base64 text of their PKCS#8 document; public keys travel as base64.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair, UnparsedPublicKey};
use std::path::Path;
use tracing::info;

pub type Digest32 = [u8; 32];

pub fn sha256(data: &[u8]) -> Digest32 {
    let digest = ring::digest::digest(&ring::digest::SHA256, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

/// The daemon's private signing key.
pub struct Identity {
    keypair: Ed25519KeyPair,
    pkcs8: Vec<u8>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key_b64())
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| Error::key("failed to generate ed25519 key"))?;
        Self::from_pkcs8(document.as_ref())
    }

    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self> {
        let keypair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| Error::key(format!("rejected pkcs8 key: {e}")))?;
        Ok(Self { keypair, pkcs8: pkcs8.to_vec() })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let der = STANDARD
            .decode(text.trim())
            .map_err(|e| Error::key(format!("{}: not base64: {e}", path.display())))?;
        Self::from_pkcs8(&der)
    }

    /// Load a key file, or create one if it does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let identity = Self::generate()?;
        identity.save(path)?;
        info!("Generated signing key at {}", path.display());
        Ok(identity)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, format!("{}\n", STANDARD.encode(&self.pkcs8)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keypair.sign(message).as_ref().to_vec()
    }

    pub fn public_key(&self) -> &[u8] {
        self.keypair.public_key().as_ref()
    }

    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.public_key())
    }

    pub fn trusted_key(&self) -> TrustedKey {
        TrustedKey(self.public_key().to_vec())
    }
}

/// A verification key the importer is willing to trust.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedKey(Vec<u8>);

impl TrustedKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn from_b64(text: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(text.trim())
            .map_err(|e| Error::key(format!("public key is not base64: {e}")))?;
        if bytes.len() != 32 {
            return Err(Error::key(format!(
                "ed25519 public key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_b64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn verify(&self, message: &[u8], sig: &[u8]) -> bool {
        UnparsedPublicKey::new(&signature::ED25519, &self.0)
            .verify(message, sig)
            .is_ok()
    }
}

/// Serde helpers for byte fields as base64 strings.
pub(crate) mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(D::Error::custom)
    }

    pub mod digest {
        use super::*;
        use crate::crypto::Digest32;

        pub fn serialize<S: Serializer>(bytes: &Digest32, s: S) -> Result<S::Ok, S::Error> {
            super::serialize(bytes, s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Digest32, D::Error> {
            let bytes = super::deserialize(d)?;
            Digest32::try_from(bytes.as_slice())
                .map_err(|_| D::Error::custom(format!("expected 32 bytes, got {}", bytes.len())))
        }
    }
}
