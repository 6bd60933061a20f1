//! Organism - everything the two loops share, behind one lock
//!
//! Resources, behavior and the receipt chain live together so that a
//! mutation and the receipt recording it happen in one critical section.

use ember_core::{
    BehavioralState, DeathKind, Receipt, ReceiptChain, ReceiptKind, ResourceLedger, ResourceState,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub type SharedOrganism = Arc<Mutex<Organism>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "cause", rename_all = "snake_case")]
pub enum Vital {
    Alive,
    Dead(DeathKind),
    Stopped,
}

impl std::fmt::Display for Vital {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Vital::Alive => write!(f, "alive"),
            Vital::Dead(kind) => write!(f, "dead ({})", kind.as_str()),
            Vital::Stopped => write!(f, "stopped"),
        }
    }
}

pub struct Organism {
    instance_id: Uuid,
    pub(crate) ledger: ResourceLedger,
    pub(crate) behavior: BehavioralState,
    chain: ReceiptChain,
    vital: Vital,
    /// Set once the final receipt is written. Nothing may follow it.
    sealed: bool,
    pub(crate) pending_query: Option<String>,
    pub(crate) last_thought: Option<String>,
    pub(crate) cycles: u64,
}

impl Organism {
    pub fn new(
        instance_id: Uuid,
        ledger: ResourceLedger,
        behavior: BehavioralState,
        chain: ReceiptChain,
    ) -> Self {
        Self {
            instance_id,
            ledger,
            behavior,
            chain,
            vital: Vital::Alive,
            sealed: false,
            pending_query: None,
            last_thought: None,
            cycles: 0,
        }
    }

    pub fn shared(self) -> SharedOrganism {
        Arc::new(Mutex::new(self))
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn resources(&self) -> &ResourceState {
        self.ledger.state()
    }

    pub fn behavior(&self) -> &BehavioralState {
        &self.behavior
    }

    pub fn chain(&self) -> &ReceiptChain {
        &self.chain
    }

    pub fn vital(&self) -> Vital {
        self.vital
    }

    pub fn is_alive(&self) -> bool {
        self.vital == Vital::Alive
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Append a receipt unless the chain has been sealed.
    pub(crate) fn record(
        &mut self,
        kind: ReceiptKind,
        detail: serde_json::Value,
    ) -> Option<Receipt> {
        if self.sealed {
            warn!("Dropping {} receipt: chain already sealed", kind);
            return None;
        }
        Some(self.chain.record(kind, detail))
    }

    /// Write the final receipt and close the sink. Idempotent.
    pub(crate) fn seal(&mut self, kind: ReceiptKind, detail: serde_json::Value) -> Option<Receipt> {
        let receipt = self.record(kind, detail)?;
        self.sealed = true;
        if self.vital == Vital::Alive {
            self.vital = Vital::Stopped;
        }
        self.chain.close_sink();
        Some(receipt)
    }

    /// Mark the organism dead. The first cause sticks.
    pub(crate) fn die(&mut self, kind: DeathKind) {
        if self.is_alive() {
            warn!("Organism died: {} at pulse {}", kind, self.resources().pulse_count);
            self.vital = Vital::Dead(kind);
        }
    }

    pub(crate) fn resources_json(&self) -> serde_json::Value {
        serde_json::to_value(self.resources()).unwrap_or(serde_json::Value::Null)
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            instance_id: self.instance_id,
            vital: self.vital,
            resources: self.resources().clone(),
            behavior: self.behavior.clone(),
            receipts: self.chain.len(),
            head: short_hex(&self.chain.head()),
            pending_query: self.pending_query.clone(),
            last_thought: self.last_thought.clone(),
            cycles: self.cycles,
        }
    }
}

/// Point-in-time view for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub instance_id: Uuid,
    pub vital: Vital,
    pub resources: ResourceState,
    pub behavior: BehavioralState,
    pub receipts: usize,
    pub head: String,
    pub pending_query: Option<String>,
    pub last_thought: Option<String>,
    pub cycles: u64,
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = &self.resources;
        writeln!(f, "instance   {}", self.instance_id)?;
        writeln!(f, "vital      {}", self.vital)?;
        writeln!(f, "pulse      {}", r.pulse_count)?;
        writeln!(
            f,
            "energy {:.2}  temp {:.2}  memory {:.2}  stability {:.2}",
            r.energy, r.temperature, r.memory_integrity, r.stability
        )?;
        writeln!(f, "mask       {}  mood {}", self.behavior.mask, self.behavior.mood)?;
        writeln!(f, "receipts   {}  head {}", self.receipts, self.head)?;
        write!(f, "cycles     {}", self.cycles)?;
        if let Some(q) = &self.pending_query {
            write!(f, "\nquery      {}", q)?;
        }
        if let Some(t) = &self.last_thought {
            write!(f, "\nthought    {}", t)?;
        }
        Ok(())
    }
}

pub(crate) fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn short_hex(digest: &[u8]) -> String {
    hex(&digest[..digest.len().min(8)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{Identity, MetabolismConfig, MemorySink};
    use serde_json::json;

    fn organism() -> (Organism, MemorySink) {
        let sink = MemorySink::new();
        let chain = ReceiptChain::new(Arc::new(Identity::generate().unwrap()))
            .with_sink(Box::new(sink.clone()));
        let cfg = MetabolismConfig::default();
        let ledger = ResourceLedger::new(cfg.fresh_state(), cfg);
        (Organism::new(Uuid::new_v4(), ledger, BehavioralState::default(), chain), sink)
    }

    #[test]
    fn sealed_chain_refuses_further_receipts() {
        let (mut org, sink) = organism();
        org.record(ReceiptKind::Spawn, json!({}));
        assert!(org.seal(ReceiptKind::Shutdown, json!({})).is_some());
        assert!(org.record(ReceiptKind::Tick, json!({})).is_none());
        assert!(org.seal(ReceiptKind::Shutdown, json!({})).is_none());
        assert_eq!(org.chain().len(), 2);
        assert_eq!(sink.receipts().len(), 2);
        assert_eq!(org.vital(), Vital::Stopped);
    }

    #[test]
    fn first_death_cause_sticks() {
        let (mut org, _) = organism();
        org.die(DeathKind::Thermal);
        org.die(DeathKind::Energy);
        assert_eq!(org.vital(), Vital::Dead(DeathKind::Thermal));
        org.seal(ReceiptKind::Death, json!({}));
        assert_eq!(org.vital(), Vital::Dead(DeathKind::Thermal));
    }

    #[test]
    fn status_renders_core_fields() {
        let (org, _) = organism();
        let text = org.status().to_string();
        assert!(text.contains("vital      alive"));
        assert!(text.contains("mask       healer"));
        assert!(text.contains("pulse      0"));
    }
}
