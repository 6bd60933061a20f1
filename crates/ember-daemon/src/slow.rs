//! SlowLoop - deliberation
//!
//! A cycle takes the organism lock twice: once to reflect (cool, check death,
//! build the prompt) and once to apply the outcome. The completion call in
//! between runs with the lock released, so the fast loop keeps ticking.

use crate::config::SlowConfig;
use crate::organism::{Organism, SharedOrganism};
use ember_core::{PolicySelector, ReceiptKind};
use ember_llm::{CompletionError, CompletionService};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const THOUGHT_MAX_CHARS: usize = 240;
const MOOD_MAX_CHARS: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowPhase {
    Idle,
    Reflecting,
    Deliberating,
    Applied,
    Dead,
}

/// What a completion asked the organism to do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deliberation {
    pub mood: Option<String>,
    pub thought: String,
}

impl Deliberation {
    /// Pull a `MOOD: <tag>` line out of free text; the rest is the thought.
    pub fn parse(text: &str) -> Self {
        let mut mood = None;
        let mut thought = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim();
            let is_mood = trimmed.get(..5).map_or(false, |p| p.eq_ignore_ascii_case("mood:"));
            if mood.is_none() && is_mood {
                mood = sanitize_mood(&trimmed[5..]);
                continue;
            }
            if !trimmed.is_empty() {
                thought.push(trimmed);
            }
        }
        Self { mood, thought: truncate(&thought.join(" "), THOUGHT_MAX_CHARS) }
    }
}

fn sanitize_mood(raw: &str) -> Option<String> {
    let word: String = raw
        .split_whitespace()
        .next()?
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MOOD_MAX_CHARS)
        .collect::<String>()
        .to_ascii_lowercase();
    (!word.is_empty()).then_some(word)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

pub fn build_prompt(org: &Organism, query: Option<&str>) -> String {
    let r = org.resources();
    let b = org.behavior();
    let mut prompt = format!(
        "You are the deliberative half of a small embodied agent.\n\
         Pulse {}. Energy {:.1}, temperature {:.1}, memory integrity {:.1}, stability {:.1}.\n\
         Current mask: {}. Current mood: {}.\n",
        r.pulse_count, r.energy, r.temperature, r.memory_integrity, r.stability, b.mask, b.mood
    );
    if let Some(thought) = &org.last_thought {
        prompt.push_str(&format!("Your previous reflection: {}\n", thought));
    }
    match query {
        Some(q) => prompt.push_str(&format!("Your operator asks: {}\n", q)),
        None => prompt.push_str("No operator input since the last reflection.\n"),
    }
    prompt.push_str(
        "Reply with a first line of the form `MOOD: <one word>`, \
         then at most two sentences of reflection.",
    );
    prompt
}

pub struct SlowLoop {
    organism: SharedOrganism,
    service: Arc<dyn CompletionService>,
    policy: PolicySelector,
    config: SlowConfig,
    period: Duration,
    halt: CancellationToken,
    phase: SlowPhase,
}

impl SlowLoop {
    pub fn new(
        organism: SharedOrganism,
        service: Arc<dyn CompletionService>,
        policy: PolicySelector,
        config: SlowConfig,
        period: Duration,
        halt: CancellationToken,
    ) -> Self {
        Self { organism, service, policy, config, period, halt, phase: SlowPhase::Idle }
    }

    pub fn phase(&self) -> SlowPhase {
        self.phase
    }

    pub async fn run(mut self) -> SlowPhase {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("SlowLoop started: every {:?} via {}", self.period, self.service.name());

        loop {
            tokio::select! {
                _ = self.halt.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.cycle().await == SlowPhase::Dead {
                break;
            }
        }
        info!("SlowLoop stopped in {:?}", self.phase);
        self.phase
    }

    /// One deliberation cycle. Returns `Applied` when the cost was paid.
    pub async fn cycle(&mut self) -> SlowPhase {
        let (prompt, query) = {
            let mut org = self.organism.lock().await;
            if !org.is_alive() {
                self.phase = SlowPhase::Dead;
                return self.phase;
            }
            if self.halt.is_cancelled() {
                self.phase = SlowPhase::Idle;
                return self.phase;
            }
            self.phase = SlowPhase::Reflecting;
            org.ledger.cool(self.config.cool_amount);
            if let Some(kind) = org.ledger.evaluate_death() {
                org.die(kind);
                self.halt.cancel();
                self.phase = SlowPhase::Dead;
                return self.phase;
            }
            let query = org.pending_query.take();
            (build_prompt(&org, query.as_deref()), query)
        };

        self.phase = SlowPhase::Deliberating;
        let timeout = Duration::from_millis(self.config.completion_timeout_ms);
        let started = Instant::now();
        let outcome = tokio::select! {
            _ = self.halt.cancelled() => {
                debug!("Deliberation abandoned: halting");
                self.phase = SlowPhase::Idle;
                return self.phase;
            }
            outcome = tokio::time::timeout(timeout, self.service.complete(&prompt, timeout)) => {
                outcome.unwrap_or_else(|_| Err(CompletionError::Timeout(timeout)))
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut org = self.organism.lock().await;
        if !org.is_alive() {
            self.phase = SlowPhase::Dead;
            return self.phase;
        }

        let decision = match outcome {
            Ok(text) => Some(Deliberation::parse(&text)),
            Err(e) => {
                warn!("Deliberation failed ({}): {}", e.kind(), e);
                org.record(
                    ReceiptKind::Error,
                    json!({
                        "source": "slow_loop",
                        "error": e.kind(),
                        "message": e.to_string(),
                        "query": query,
                        "elapsed_ms": elapsed_ms,
                    }),
                );
                None
            }
        };

        let death = org.ledger.apply_cost(self.config.cost).err();
        org.cycles += 1;
        if let Some(d) = &decision {
            if let Some(mood) = &d.mood {
                org.behavior.mood = mood.clone();
            }
            org.behavior.routine_streak = 0;
            org.behavior.mask = self.policy.select_mask(org.resources(), org.behavior());
            if !d.thought.is_empty() {
                org.last_thought = Some(d.thought.clone());
            }
        }
        self.phase = SlowPhase::Applied;

        let resources = org.resources_json();
        let detail = json!({
            "cycle": org.cycles,
            "pulse": org.resources().pulse_count,
            "outcome": if decision.is_some() { "deliberated" } else { "noop" },
            "mask": org.behavior().mask,
            "mood": org.behavior().mood,
            "thought": decision.as_ref().map(|d| d.thought.as_str()),
            "answered": query,
            "cost": self.config.cost,
            "elapsed_ms": elapsed_ms,
            "resources": resources,
        });
        org.record(ReceiptKind::Cycle, detail);

        if let Some(kind) = death {
            org.die(kind);
            self.halt.cancel();
            self.phase = SlowPhase::Dead;
        }
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::organism::Vital;
    use ember_core::{
        BehavioralState, DeathKind, Identity, MetabolismConfig, PolicyConfig, ReceiptChain,
        ResourceLedger, ResourceState,
    };
    use ember_llm::{ScriptedCompletion, ScriptedReply};
    use uuid::Uuid;

    #[test]
    fn parse_extracts_mood_and_thought() {
        let d = Deliberation::parse("MOOD: Curious!\nThe room is warm.\n\nNothing else.");
        assert_eq!(d.mood.as_deref(), Some("curious"));
        assert_eq!(d.thought, "The room is warm. Nothing else.");
    }

    #[test]
    fn parse_without_mood_line() {
        let d = Deliberation::parse("just thinking");
        assert_eq!(d.mood, None);
        assert_eq!(d.thought, "just thinking");
    }

    #[test]
    fn parse_ignores_empty_mood() {
        assert_eq!(Deliberation::parse("mood:   \nok").mood, None);
    }

    #[test]
    fn long_thoughts_are_truncated() {
        let d = Deliberation::parse(&"x".repeat(1000));
        assert_eq!(d.thought.chars().count(), THOUGHT_MAX_CHARS + 1);
    }

    fn slow_loop(
        replies: Vec<ScriptedReply>,
    ) -> (SlowLoop, SharedOrganism, Arc<ScriptedCompletion>) {
        let cfg = MetabolismConfig { heat_jitter: 0.0, ..Default::default() };
        let chain = ReceiptChain::new(Arc::new(Identity::generate().unwrap()));
        let mut state = cfg.fresh_state();
        state.temperature = 60.0;
        let ledger = ResourceLedger::with_seed(state, cfg.clone(), 9);
        let organism =
            Organism::new(Uuid::new_v4(), ledger, BehavioralState::default(), chain).shared();
        let service = Arc::new(ScriptedCompletion::new(replies));
        let sl = SlowLoop::new(
            organism.clone(),
            service.clone(),
            PolicySelector::new(PolicyConfig::default(), cfg.energy_max),
            SlowConfig { completion_timeout_ms: 50, ..Default::default() },
            Duration::from_millis(100),
            CancellationToken::new(),
        );
        (sl, organism, service)
    }

    #[tokio::test]
    async fn successful_cycle_cools_pays_and_applies_mood() {
        let (mut sl, organism, service) =
            slow_loop(vec![ScriptedReply::text("MOOD: calm\nAll is well.")]);
        organism.lock().await.pending_query = Some("status?".into());

        assert_eq!(sl.cycle().await, SlowPhase::Applied);
        assert!(service.prompts()[0].contains("Your operator asks: status?"));

        let org = organism.lock().await;
        assert_eq!(org.behavior().mood, "calm");
        let expected = 60.0 - SlowConfig::default().cool_amount + 1.5 * 0.8;
        assert_eq!(org.resources().temperature, expected);
        assert_eq!(org.resources().energy, 100.0 - 1.5);
        assert!(org.pending_query.is_none());
        assert_eq!(org.last_thought.as_deref(), Some("All is well."));
        let receipt = org.chain().last().unwrap();
        assert_eq!(receipt.payload.kind, ReceiptKind::Cycle);
        assert_eq!(receipt.payload.detail["outcome"], "deliberated");
        assert_eq!(receipt.payload.detail["answered"], "status?");
    }

    #[tokio::test]
    async fn cycle_heat_past_the_thermal_limit_is_fatal() {
        let (mut sl, organism, _) = slow_loop(vec![ScriptedReply::text("MOOD: warm")]);
        {
            let mut org = organism.lock().await;
            let hot = ResourceState { temperature: 100.0, ..org.resources().clone() };
            org.ledger.reseed(hot);
        }
        // Cooling brings 100.0 to 94.0, then the cycle's cost heat adds 1.2.
        assert_eq!(sl.cycle().await, SlowPhase::Dead);
        assert!(sl.halt.is_cancelled());
        let org = organism.lock().await;
        assert_eq!(org.vital(), Vital::Dead(DeathKind::Thermal));
        assert_eq!(org.chain().last().unwrap().payload.kind, ReceiptKind::Cycle);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_writes_error_receipt_then_noop_cycle() {
        let (mut sl, organism, _) = slow_loop(vec![ScriptedReply::Hang]);
        assert_eq!(sl.cycle().await, SlowPhase::Applied);

        let org = organism.lock().await;
        let receipts = org.chain().receipts();
        assert_eq!(receipts.len(), 2);
        assert_eq!(receipts[0].payload.kind, ReceiptKind::Error);
        assert_eq!(receipts[0].payload.detail["error"], "timeout");
        assert_eq!(receipts[1].payload.kind, ReceiptKind::Cycle);
        assert_eq!(receipts[1].payload.detail["outcome"], "noop");
        assert_eq!(org.behavior().mood, "awakening");
        assert_eq!(org.resources().energy, 100.0 - 1.5);
    }

    /// Sleeps far past whatever timeout it is handed.
    struct Stubborn;

    #[async_trait::async_trait]
    impl CompletionService for Stubborn {
        fn name(&self) -> &str {
            "stubborn"
        }

        async fn complete(
            &self,
            _prompt: &str,
            _timeout: Duration,
        ) -> ember_llm::CompletionResult<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("MOOD: late".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_bounds_a_service_that_ignores_its_timeout() {
        let (mut sl, organism, _) = slow_loop(vec![]);
        sl.service = Arc::new(Stubborn);
        let phase = tokio::time::timeout(Duration::from_secs(60), sl.cycle())
            .await
            .expect("cycle outlived its completion timeout");
        assert_eq!(phase, SlowPhase::Applied);

        let org = organism.lock().await;
        let receipts = org.chain().receipts();
        assert_eq!(receipts[0].payload.kind, ReceiptKind::Error);
        assert_eq!(receipts[0].payload.detail["error"], "timeout");
        assert_eq!(receipts[1].payload.detail["outcome"], "noop");
    }

    #[tokio::test]
    async fn lock_is_free_during_completion() {
        let (mut sl, organism, _) = slow_loop(vec![ScriptedReply::Delayed(
            Duration::from_millis(30),
            "MOOD: fine".into(),
        )]);
        let probe = organism.clone();
        let cycle = tokio::spawn(async move { sl.cycle().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let guard = tokio::time::timeout(Duration::from_millis(5), probe.lock()).await;
        assert!(guard.is_ok(), "organism lock held across the completion call");
        drop(guard);
        assert_eq!(cycle.await.unwrap(), SlowPhase::Applied);
    }

    #[tokio::test]
    async fn halt_during_completion_abandons_the_cycle() {
        let (mut sl, organism, _) = slow_loop(vec![ScriptedReply::Hang]);
        let halt = sl.halt.clone();
        let cycle = tokio::spawn(async move { sl.cycle().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        halt.cancel();
        assert_eq!(cycle.await.unwrap(), SlowPhase::Idle);
        assert!(organism.lock().await.chain().is_empty());
    }
}
