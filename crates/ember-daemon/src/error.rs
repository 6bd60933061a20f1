//! Daemon error types

use ember_core::{DeathKind, ImportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error(transparent)]
    Core(#[from] ember_core::Error),

    #[error("import rejected: {0}")]
    Import(#[from] ImportError),

    #[error("organism is dead ({0})")]
    Dead(DeathKind),

    #[error("daemon has stopped")]
    Stopped,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DaemonResult<T> = std::result::Result<T, DaemonError>;

impl DaemonError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
