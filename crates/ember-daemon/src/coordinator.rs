//! Coordinator - spawns, supervises and buries one organism
//!
//! Owns the shared organism and runs the fast and slow loops as tasks. Once
//! both have stopped it optionally exports a seed, seals the chain with the
//! final receipt and releases ephemeral storage. A stopped coordinator never
//! restarts.

use crate::channel::{OverrideChannel, OverrideSignal};
use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::fast::FastLoop;
use crate::organism::{hex, Organism, SharedOrganism, StatusReport, Vital};
use crate::slow::SlowLoop;
use crate::storage::EphemeralStore;
use chrono::Utc;
use ember_core::{
    BehavioralState, ChainFault, DeathKind, Identity, ImportError, JsonlSink, MindSeed,
    PolicySelector, ReceiptChain, ReceiptKind, ResourceLedger, ResourceState, SeedBody,
    SnapshotCodec, TrustedKey,
};
use ember_llm::CompletionService;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Where a new organism's state comes from.
#[derive(Debug, Clone)]
pub enum Origin {
    Fresh,
    Seed(MindSeed),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Died(DeathKind),
    Shutdown,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Died(_) => "death",
            Termination::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Died(kind) => write!(f, "died: {}", kind),
            Termination::Shutdown => write!(f, "shut down"),
        }
    }
}

/// Summary handed back once the organism is gone.
#[derive(Debug, Clone)]
pub struct DaemonReport {
    pub instance_id: Uuid,
    pub termination: Termination,
    pub receipts: usize,
    pub resources: ResourceState,
    pub chain_intact: bool,
    pub sink_failures: u64,
    pub seed_path: Option<PathBuf>,
    /// Receipt directory, when configured to outlive the instance.
    pub receipts_dir: Option<PathBuf>,
}

/// Seals and verifies seeds on behalf of one instance.
struct SeedKeeper {
    codec: SnapshotCodec,
    identity: Arc<Identity>,
    trusted: Vec<TrustedKey>,
    seed_dir: PathBuf,
}

impl SeedKeeper {
    fn new(config: &DaemonConfig, identity: Arc<Identity>) -> DaemonResult<Self> {
        let mut trusted = vec![identity.trusted_key()];
        trusted.extend(config.storage.parse_trusted_keys()?);
        Ok(Self {
            codec: SnapshotCodec::from_config(&config.metabolism),
            identity,
            trusted,
            seed_dir: config.storage.seed_dir.clone(),
        })
    }

    /// Accept a seed signed by any trusted key.
    fn open(&self, bytes: &[u8]) -> Result<MindSeed, ImportError> {
        for key in &self.trusted {
            match self.codec.import(bytes, key) {
                Err(ImportError::BadSignature) => continue,
                other => return other,
            }
        }
        Err(ImportError::BadSignature)
    }

    fn default_path(&self, org: &Organism) -> PathBuf {
        let id = org.instance_id().simple().to_string();
        self.seed_dir.join(format!(
            "ember-{}-p{}.seed",
            &id[..8],
            org.resources().pulse_count
        ))
    }

    /// Seal the current state and write it out. Call with the organism locked.
    fn export(
        &self,
        org: &mut Organism,
        path: Option<PathBuf>,
        reason: &str,
    ) -> DaemonResult<PathBuf> {
        let path = path.unwrap_or_else(|| self.default_path(org));
        let body = SeedBody {
            instance_id: org.instance_id(),
            exported_at: Utc::now(),
            resource: org.resources().clone(),
            behavior: BehavioralState { veto_pending: false, ..org.behavior().clone() },
            receipt_head: org.chain().head(),
        };
        let written = self
            .codec
            .seal(body, &self.identity)
            .and_then(|seed| seed.write_to(&path));
        let pulse = org.resources().pulse_count;
        match written {
            Ok(()) => {
                let head = hex(&org.chain().head());
                org.record(
                    ReceiptKind::Export,
                    json!({ "path": path, "pulse": pulse, "reason": reason, "receipt_head": head }),
                );
                info!("Exported seed at pulse {} to {}", pulse, path.display());
                Ok(path)
            }
            Err(e) => {
                error!("Seed export to {} failed: {}", path.display(), e);
                org.record(
                    ReceiptKind::Error,
                    json!({ "source": "export", "path": path, "message": e.to_string() }),
                );
                Err(e.into())
            }
        }
    }
}

pub struct Coordinator {
    config: DaemonConfig,
    instance_id: Uuid,
    organism: SharedOrganism,
    overrides: OverrideChannel,
    halt: CancellationToken,
    service: Arc<dyn CompletionService>,
    policy: PolicySelector,
    seeds: Arc<SeedKeeper>,
    store: EphemeralStore,
}

impl Coordinator {
    pub fn new(
        config: DaemonConfig,
        identity: Arc<Identity>,
        service: Arc<dyn CompletionService>,
        origin: Origin,
    ) -> DaemonResult<Self> {
        config.validate()?;
        let instance_id = Uuid::new_v4();
        let store = EphemeralStore::create(&config.storage, instance_id)?;
        let sink = JsonlSink::open(store.receipts_path())?;
        let mut chain = ReceiptChain::new(identity.clone()).with_sink(Box::new(sink));

        let (resources, behavior, origin_detail) = match origin {
            Origin::Fresh => (
                config.metabolism.fresh_state(),
                BehavioralState::default(),
                json!({ "origin": "fresh" }),
            ),
            Origin::Seed(seed) => {
                let body = seed.body();
                (
                    body.resource.clone(),
                    BehavioralState { veto_pending: false, ..body.behavior.clone() },
                    json!({
                        "origin": "seed",
                        "parent_instance": body.instance_id,
                        "parent_head": hex(&body.receipt_head),
                        "exported_at": body.exported_at,
                        "signer": seed.signer_b64(),
                    }),
                )
            }
        };
        let ledger = ResourceLedger::new(resources, config.metabolism.clone());

        chain.record(
            ReceiptKind::Spawn,
            json!({
                "instance_id": instance_id,
                "public_key": identity.public_key_b64(),
                "source": origin_detail,
                "resources": ledger.state(),
                "mask": behavior.mask,
            }),
        );
        info!(
            "Spawned {} at pulse {} ({})",
            instance_id,
            ledger.state().pulse_count,
            origin_detail["origin"]
        );

        let policy = PolicySelector::new(config.policy.clone(), config.metabolism.energy_max);
        let seeds = Arc::new(SeedKeeper::new(&config, identity)?);
        let halt = CancellationToken::new();
        let mut organism = Organism::new(instance_id, ledger, behavior, chain);
        // A seed taken past a threshold resumes dead; the loops never start ticking.
        if let Some(kind) = organism.ledger.evaluate_death() {
            organism.die(kind);
            halt.cancel();
        }

        Ok(Self {
            config,
            instance_id,
            organism: organism.shared(),
            overrides: OverrideChannel::new(),
            halt,
            service,
            policy,
            seeds,
            store,
        })
    }

    /// Verify a seed file against this configuration's trusted keys.
    pub fn load_seed(
        config: &DaemonConfig,
        identity: Arc<Identity>,
        path: &Path,
    ) -> DaemonResult<MindSeed> {
        let keeper = SeedKeeper::new(config, identity)?;
        let bytes = std::fs::read(path)?;
        Ok(keeper.open(&bytes)?)
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn receipts_path(&self) -> PathBuf {
        self.store.receipts_path()
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            instance_id: self.instance_id,
            organism: self.organism.clone(),
            overrides: self.overrides.clone(),
            halt: self.halt.clone(),
            seeds: self.seeds.clone(),
        }
    }

    /// Run both loops to completion, then close out the instance.
    pub async fn run(self) -> DaemonResult<DaemonReport> {
        let Coordinator {
            config,
            instance_id,
            organism,
            overrides,
            halt,
            service,
            policy,
            seeds,
            store,
        } = self;

        let fast = FastLoop::new(
            organism.clone(),
            overrides,
            policy.clone(),
            config.fast.clone(),
            halt.clone(),
        );
        let slow = SlowLoop::new(
            organism.clone(),
            service,
            policy,
            config.slow.clone(),
            config.cycle_period(),
            halt.clone(),
        );

        // Either loop ending, including by panic, halts the other.
        let fast_guard = halt.clone().drop_guard();
        let fast_task = tokio::spawn(async move {
            let _guard = fast_guard;
            fast.run().await
        });
        let slow_guard = halt.clone().drop_guard();
        let slow_task = tokio::spawn(async move {
            let _guard = slow_guard;
            slow.run().await
        });

        let (fast_end, slow_end) = tokio::join!(fast_task, slow_task);
        if let Err(e) = fast_end {
            error!("FastLoop task failed: {}", e);
        }
        if let Err(e) = slow_end {
            error!("SlowLoop task failed: {}", e);
        }

        let mut org = organism.lock().await;
        let termination = match org.vital() {
            Vital::Dead(kind) => Termination::Died(kind),
            Vital::Alive | Vital::Stopped => Termination::Shutdown,
        };
        let wants_seed = match termination {
            Termination::Died(_) => config.lifecycle.export_on_death,
            Termination::Shutdown => config.lifecycle.export_on_shutdown,
        };
        let seed_path = if wants_seed && !org.is_sealed() {
            seeds.export(&mut org, None, termination.as_str()).ok()
        } else {
            None
        };

        let pulse = org.resources().pulse_count;
        let resources = org.resources_json();
        match termination {
            Termination::Died(kind) => org.seal(
                ReceiptKind::Death,
                json!({ "cause": kind, "pulse": pulse, "resources": resources }),
            ),
            Termination::Shutdown => org.seal(
                ReceiptKind::Shutdown,
                json!({ "pulse": pulse, "resources": resources }),
            ),
        };

        let chain = org.chain();
        let chain_intact = chain.verify_self();
        if !chain_intact {
            error!("Receipt chain failed self-verification");
        }
        if chain.sink_failures() > 0 {
            warn!("{} receipts were not persisted", chain.sink_failures());
        }
        let mut report = DaemonReport {
            instance_id,
            termination,
            receipts: chain.len(),
            resources: org.resources().clone(),
            chain_intact,
            sink_failures: chain.sink_failures(),
            seed_path,
            receipts_dir: None,
        };
        drop(org);

        report.receipts_dir = store.release();
        info!("Instance {} {} after {} receipts", instance_id, termination, report.receipts);
        Ok(report)
    }
}

/// Clonable control handle onto a running coordinator.
#[derive(Clone)]
pub struct DaemonHandle {
    instance_id: Uuid,
    organism: SharedOrganism,
    overrides: OverrideChannel,
    halt: CancellationToken,
    seeds: Arc<SeedKeeper>,
}

impl DaemonHandle {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn is_running(&self) -> bool {
        !self.halt.is_cancelled()
    }

    /// Resolves once the loops have been told to stop.
    pub async fn stopped(&self) {
        self.halt.cancelled().await
    }

    fn send(&self, signal: OverrideSignal) -> DaemonResult<()> {
        if !self.is_running() {
            return Err(DaemonError::Stopped);
        }
        self.overrides.try_send(signal);
        Ok(())
    }

    pub fn veto(&self, reason: Option<String>) -> DaemonResult<()> {
        self.send(OverrideSignal::veto(reason))
    }

    pub fn query(&self, text: impl Into<String>) -> DaemonResult<()> {
        self.send(OverrideSignal::query(text))
    }

    /// Ask the fast loop to stop at its next tick.
    pub fn request_shutdown(&self) -> DaemonResult<()> {
        self.send(OverrideSignal::shutdown())
    }

    /// Stop both loops now.
    pub fn shutdown(&self) {
        if self.is_running() {
            info!("Shutdown requested");
        }
        self.halt.cancel();
    }

    pub async fn status(&self) -> StatusReport {
        self.organism.lock().await.status()
    }

    pub async fn export(&self, path: Option<PathBuf>) -> DaemonResult<PathBuf> {
        let mut org = self.organism.lock().await;
        match org.vital() {
            Vital::Alive => self.seeds.export(&mut org, path, "requested"),
            Vital::Dead(kind) => Err(DaemonError::Dead(kind)),
            Vital::Stopped => Err(DaemonError::Stopped),
        }
    }

    /// Resume the live organism from a seed. On any rejection the live state is
    /// untouched. A seed already past a death threshold kills the organism.
    pub async fn import(&self, path: &Path) -> DaemonResult<()> {
        let verdict = match tokio::fs::read(path).await {
            Ok(bytes) => self.seeds.open(&bytes),
            Err(e) => Err(ImportError::Malformed(format!("{}: {}", path.display(), e))),
        };

        let mut org = self.organism.lock().await;
        match org.vital() {
            Vital::Alive => {}
            Vital::Dead(kind) => return Err(DaemonError::Dead(kind)),
            Vital::Stopped => return Err(DaemonError::Stopped),
        }

        let seed = match verdict {
            Ok(seed) => seed,
            Err(e) => {
                warn!("Rejected seed {}: {}", path.display(), e);
                org.record(
                    ReceiptKind::ImportRejected,
                    json!({ "path": path, "error": e.to_string() }),
                );
                return Err(e.into());
            }
        };

        let previous_pulse = org.resources().pulse_count;
        org.ledger.reseed(seed.resource().clone());
        org.behavior = BehavioralState { veto_pending: false, ..seed.behavior().clone() };
        org.pending_query = None;
        let resources = org.resources_json();
        let body = seed.body();
        org.record(
            ReceiptKind::Import,
            json!({
                "path": path,
                "parent_instance": body.instance_id,
                "parent_head": hex(&body.receipt_head),
                "exported_at": body.exported_at,
                "signer": seed.signer_b64(),
                "previous_pulse": previous_pulse,
                "resources": resources,
            }),
        );
        info!(
            "Imported seed {} (pulse {} -> {})",
            path.display(),
            previous_pulse,
            seed.resource().pulse_count
        );
        if let Some(kind) = org.ledger.evaluate_death() {
            org.die(kind);
            self.halt.cancel();
        }
        Ok(())
    }

    /// Check the live chain. Ok carries the number of receipts verified.
    pub async fn verify(&self) -> Result<usize, ChainFault> {
        let org = self.organism.lock().await;
        let receipts = org.chain().receipts();
        ReceiptChain::verify_detailed(receipts, &self.seeds.identity.trusted_key())?;
        Ok(receipts.len())
    }
}
