//! FastLoop - the reactive tick
//!
//! Each tick runs start to finish under the organism lock: decay, override
//! drain, mask selection, cost, receipt. Nothing in here awaits anything
//! but the lock.

use crate::channel::{OverrideChannel, SignalKind};
use crate::config::FastConfig;
use crate::organism::SharedOrganism;
use ember_core::{PolicySelector, ReceiptKind};
use serde_json::json;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPhase {
    Idle,
    Ticking,
    Deciding,
    Vetoed,
    Applied,
    Dead,
}

pub struct FastLoop {
    organism: SharedOrganism,
    overrides: OverrideChannel,
    policy: PolicySelector,
    config: FastConfig,
    halt: CancellationToken,
    phase: FastPhase,
}

impl FastLoop {
    pub fn new(
        organism: SharedOrganism,
        overrides: OverrideChannel,
        policy: PolicySelector,
        config: FastConfig,
        halt: CancellationToken,
    ) -> Self {
        Self { organism, overrides, policy, config, halt, phase: FastPhase::Idle }
    }

    pub fn phase(&self) -> FastPhase {
        self.phase
    }

    /// Tick on the configured cadence until halted or dead.
    pub async fn run(mut self) -> FastPhase {
        let period = Duration::from_millis(self.config.tick_ms);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("FastLoop started: every {:?}, cost {}", period, self.config.cost);

        loop {
            tokio::select! {
                _ = self.halt.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.tick().await == FastPhase::Dead {
                break;
            }
        }
        info!("FastLoop stopped in {:?}", self.phase);
        self.phase
    }

    /// One reactive tick. Returns `Applied` when a decision landed.
    pub async fn tick(&mut self) -> FastPhase {
        let mut org = self.organism.lock().await;
        if !org.is_alive() {
            self.phase = FastPhase::Dead;
            return self.phase;
        }
        if self.halt.is_cancelled() {
            self.phase = FastPhase::Idle;
            return self.phase;
        }

        self.phase = FastPhase::Ticking;
        if let Err(kind) = org.ledger.passive_decay(1) {
            org.die(kind);
            self.halt.cancel();
            self.phase = FastPhase::Dead;
            return self.phase;
        }
        let pulse = org.resources().pulse_count;

        let mut vetoed = false;
        let mut human_input = false;
        if let Some(signal) = self.overrides.drain() {
            human_input = true;
            match signal.kind {
                SignalKind::Veto => {
                    vetoed = true;
                    org.behavior.veto_pending = true;
                    org.record(
                        ReceiptKind::Veto,
                        json!({ "pulse": pulse, "reason": signal.text, "sent_at": signal.sent_at }),
                    );
                    info!("Veto observed at pulse {}", pulse);
                }
                SignalKind::Query => {
                    let text = signal.text.unwrap_or_default();
                    org.record(
                        ReceiptKind::Query,
                        json!({ "pulse": pulse, "text": text, "sent_at": signal.sent_at }),
                    );
                    org.pending_query = Some(text);
                }
                SignalKind::Shutdown => {
                    info!("Shutdown requested via override at pulse {}", pulse);
                    self.halt.cancel();
                    self.phase = FastPhase::Idle;
                    return self.phase;
                }
            }
        }

        self.phase = if vetoed { FastPhase::Vetoed } else { FastPhase::Deciding };
        if human_input {
            org.behavior.routine_streak = 0;
        } else {
            org.behavior.routine_streak = org.behavior.routine_streak.saturating_add(1);
        }
        let mask = self.policy.select_mask(org.resources(), org.behavior());
        let mood = self.policy.mood_for(org.resources(), mask, vetoed);
        org.behavior.mask = mask;
        org.behavior.mood = mood.to_string();

        let death = org.ledger.apply_cost(self.config.cost).err();
        self.phase = FastPhase::Applied;
        let resources = org.resources_json();
        org.record(
            ReceiptKind::Tick,
            json!({
                "pulse": pulse,
                "mask": mask,
                "mood": mood,
                "vetoed": vetoed,
                "cost": self.config.cost,
                "resources": resources,
            }),
        );
        org.behavior.veto_pending = false;
        debug!("tick {} mask={} mood={}", pulse, mask, mood);

        if let Some(kind) = death {
            org.die(kind);
            self.halt.cancel();
            self.phase = FastPhase::Dead;
        }
        self.phase
    }
}
