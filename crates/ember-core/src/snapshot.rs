//! SnapshotCodec - signed, versioned MindSeed export and import
//!
//! On-disk envelope:
//!
//! ```json
//! {"format":"ember.mindseed","schema_version":1,"signer":"<b64>","signature":"<b64>","body":{...}}
//! ```
//!
//! The signature covers `format ‖ 0x00 ‖ schema_version (BE) ‖ body bytes`,
//! where the body bytes are taken verbatim from the file. Import checks the
//! signature before trusting anything else in the envelope, and either
//! accepts the whole seed or none of it.

use crate::crypto::{b64, Digest32, Identity, TrustedKey};
use crate::error::{ImportError, Result};
use crate::metabolism::MetabolismConfig;
use crate::receipt::GENESIS_HASH;
use crate::types::{BehavioralState, ResourceState};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::path::Path;
use uuid::Uuid;

pub const SEED_FORMAT: &str = "ember.mindseed";
pub const SEED_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedBody {
    /// Instance that exported the seed.
    pub instance_id: Uuid,
    pub exported_at: DateTime<Utc>,
    pub resource: ResourceState,
    pub behavior: BehavioralState,
    /// Receipt chain head at the moment of export.
    #[serde(with = "b64::digest")]
    pub receipt_head: Digest32,
}

impl SeedBody {
    pub fn new(resource: ResourceState, behavior: BehavioralState) -> Self {
        Self {
            instance_id: Uuid::nil(),
            exported_at: Utc::now(),
            resource,
            behavior,
            receipt_head: GENESIS_HASH,
        }
    }
}

/// A signed seed. Immutable: there are no setters, only accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct MindSeed {
    body: SeedBody,
    body_json: String,
    signer: Vec<u8>,
    signature: Vec<u8>,
}

impl MindSeed {
    pub fn body(&self) -> &SeedBody {
        &self.body
    }

    pub fn resource(&self) -> &ResourceState {
        &self.body.resource
    }

    pub fn behavior(&self) -> &BehavioralState {
        &self.body.behavior
    }

    pub fn exported_at(&self) -> DateTime<Utc> {
        self.body.exported_at
    }

    pub fn signer_b64(&self) -> String {
        STANDARD.encode(&self.signer)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = RawValue::from_string(self.body_json.clone())?;
        let envelope = EnvelopeOut {
            format: SEED_FORMAT,
            schema_version: SEED_SCHEMA_VERSION,
            signer: self.signer_b64(),
            signature: STANDARD.encode(&self.signature),
            body: &body,
        };
        let mut bytes = serde_json::to_vec(&envelope)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Write via a temp file and rename, so readers never see a partial seed.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("seed.partial");
        std::fs::write(&tmp, self.to_bytes()?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    format: &'a str,
    schema_version: u32,
    signer: String,
    signature: String,
    body: &'a RawValue,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    format: String,
    schema_version: u32,
    signature: String,
    body: Box<RawValue>,
}

fn signing_message(schema_version: u32, body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(SEED_FORMAT.len() + 5 + body.len());
    msg.extend_from_slice(SEED_FORMAT.as_bytes());
    msg.push(0);
    msg.extend_from_slice(&schema_version.to_be_bytes());
    msg.extend_from_slice(body);
    msg
}

/// Range limits an importer enforces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotCodec {
    energy_max: f64,
    temperature_max: f64,
}

impl SnapshotCodec {
    pub fn new(energy_max: f64, temperature_max: f64) -> Self {
        Self { energy_max, temperature_max }
    }

    pub fn from_config(config: &MetabolismConfig) -> Self {
        Self::new(config.energy_max, config.temperature_max)
    }

    pub fn export(
        &self,
        resource: &ResourceState,
        behavior: &BehavioralState,
        identity: &Identity,
    ) -> Result<MindSeed> {
        self.seal(SeedBody::new(resource.clone(), behavior.clone()), identity)
    }

    /// Sign an arbitrary body.
    pub fn seal(&self, body: SeedBody, identity: &Identity) -> Result<MindSeed> {
        Self::seal_versioned(body, identity, SEED_SCHEMA_VERSION)
    }

    fn seal_versioned(body: SeedBody, identity: &Identity, version: u32) -> Result<MindSeed> {
        let body_json = serde_json::to_string(&body)?;
        let signature = identity.sign(&signing_message(version, body_json.as_bytes()));
        Ok(MindSeed {
            body,
            body_json,
            signer: identity.public_key().to_vec(),
            signature,
        })
    }

    pub fn import(
        &self,
        bytes: &[u8],
        trusted: &TrustedKey,
    ) -> std::result::Result<MindSeed, ImportError> {
        let envelope: EnvelopeIn =
            serde_json::from_slice(bytes).map_err(|e| ImportError::Malformed(e.to_string()))?;
        if envelope.format != SEED_FORMAT {
            return Err(ImportError::Malformed(format!("unexpected format {:?}", envelope.format)));
        }

        let signature = STANDARD
            .decode(envelope.signature.trim())
            .map_err(|_| ImportError::BadSignature)?;
        let body_json = envelope.body.get();
        let message = signing_message(envelope.schema_version, body_json.as_bytes());
        if !trusted.verify(&message, &signature) {
            return Err(ImportError::BadSignature);
        }

        if envelope.schema_version != SEED_SCHEMA_VERSION {
            return Err(ImportError::UnknownSchema { found: envelope.schema_version });
        }

        let body: SeedBody =
            serde_json::from_str(body_json).map_err(|e| ImportError::Malformed(e.to_string()))?;
        if let Some((field, value)) =
            body.resource.out_of_range(self.energy_max, self.temperature_max)
        {
            return Err(ImportError::OutOfRange { field, value });
        }

        Ok(MindSeed {
            body,
            body_json: body_json.to_string(),
            signer: trusted.as_bytes().to_vec(),
            signature,
        })
    }

    pub fn import_file(
        &self,
        path: &Path,
        trusted: &TrustedKey,
    ) -> std::result::Result<MindSeed, ImportError> {
        let bytes = std::fs::read(path)
            .map_err(|e| ImportError::Malformed(format!("{}: {e}", path.display())))?;
        self.import(&bytes, trusted)
    }
}
