//! OverrideChannel - the human's single-slot line into the fast loop
//!
//! Last write wins. Senders never block on the organism lock; the fast loop
//! drains the slot once per tick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Veto,
    Query,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverrideSignal {
    pub kind: SignalKind,
    pub text: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl OverrideSignal {
    pub fn new(kind: SignalKind, text: Option<String>) -> Self {
        Self { kind, text, sent_at: Utc::now() }
    }

    pub fn veto(reason: Option<String>) -> Self {
        Self::new(SignalKind::Veto, reason)
    }

    pub fn query(text: impl Into<String>) -> Self {
        Self::new(SignalKind::Query, Some(text.into()))
    }

    pub fn shutdown() -> Self {
        Self::new(SignalKind::Shutdown, None)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OverrideChannel {
    slot: Arc<Mutex<Option<OverrideSignal>>>,
}

impl OverrideChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a signal, returning whatever it displaced.
    pub fn try_send(&self, signal: OverrideSignal) -> Option<OverrideSignal> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let displaced = slot.replace(signal);
        if let Some(old) = &displaced {
            debug!("Override {:?} displaced by a newer signal", old.kind);
        }
        displaced
    }

    /// Take the pending signal, leaving the slot empty.
    pub fn drain(&self) -> Option<OverrideSignal> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins() {
        let channel = OverrideChannel::new();
        assert!(channel.try_send(OverrideSignal::query("first")).is_none());
        let displaced = channel.try_send(OverrideSignal::veto(Some("stop".into()))).unwrap();
        assert_eq!(displaced.kind, SignalKind::Query);

        let signal = channel.drain().unwrap();
        assert_eq!(signal.kind, SignalKind::Veto);
        assert_eq!(signal.text.as_deref(), Some("stop"));
        assert!(channel.drain().is_none());
        assert!(channel.is_empty());
    }

    #[test]
    fn clones_share_the_slot() {
        let channel = OverrideChannel::new();
        let sender = channel.clone();
        sender.try_send(OverrideSignal::shutdown());
        assert_eq!(channel.drain().map(|s| s.kind), Some(SignalKind::Shutdown));
    }

    #[test]
    fn send_from_another_thread() {
        let channel = OverrideChannel::new();
        let sender = channel.clone();
        std::thread::spawn(move || {
            sender.try_send(OverrideSignal::query("from afar"));
        })
        .join()
        .unwrap();
        assert_eq!(channel.drain().and_then(|s| s.text).as_deref(), Some("from afar"));
    }
}
