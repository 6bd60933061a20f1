//! Ember daemon - the two loops, their shared organism, and the coordinator that runs them

pub mod channel;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod fast;
pub mod organism;
pub mod slow;
pub mod storage;

pub use channel::{OverrideChannel, OverrideSignal, SignalKind};
pub use config::{
    CompletionConfig, DaemonConfig, FastConfig, LifecycleConfig, SlowConfig, StorageConfig,
};
pub use control::{serve, ControlCommand, ControlParseError};
pub use coordinator::{Coordinator, DaemonHandle, DaemonReport, Origin, Termination};
pub use error::{DaemonError, DaemonResult};
pub use fast::{FastLoop, FastPhase};
pub use organism::{Organism, SharedOrganism, StatusReport, Vital};
pub use slow::{Deliberation, SlowLoop, SlowPhase};
pub use storage::EphemeralStore;
