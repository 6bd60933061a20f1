//! Error types for Ember

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal resource failure. Variant order is the evaluation priority.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathKind {
    #[error("energy exhausted")]
    Energy,

    #[error("thermal limit exceeded")]
    Thermal,

    #[error("memory integrity lost")]
    Memory,

    #[error("stability collapsed")]
    Stability,
}

impl DeathKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeathKind::Energy => "energy",
            DeathKind::Thermal => "thermal",
            DeathKind::Memory => "memory",
            DeathKind::Stability => "stability",
        }
    }
}

/// Rejection of a seed. Fatal to the import call only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImportError {
    #[error("seed signature does not verify against the trusted key")]
    BadSignature,

    #[error("unknown seed schema version {found}")]
    UnknownSchema { found: u32 },

    #[error("seed field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("malformed seed: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("key error: {0}")]
    Key(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn key(message: impl Into<String>) -> Self {
        Self::Key(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
