//! ResourceLedger - the metabolic engine
//!
//! Holds the four resource scalars and enforces decay, cost and death.
//! Every mutation ends with a clamp, so reads always observe in-range values.
//! The death priority (Energy, Thermal, Memory, Stability) is fixed so that
//! simultaneous threshold crossings always report the same cause.

use crate::error::{DeathKind, Error, Result};
use crate::types::ResourceState;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Decay constants and thresholds. All of these are tunable per deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetabolismConfig {
    /// E_max.
    pub energy_max: f64,
    /// T_max. Temperature is clamped here.
    pub temperature_max: f64,
    /// Resting temperature the body drifts toward.
    pub ambient_temperature: f64,
    /// Temperature at or above which the agent dies.
    pub thermal_limit: f64,
    /// Temperature above which memory starts degrading.
    pub damage_threshold: f64,
    /// α: energy drained per tick regardless of activity.
    pub energy_drain_per_tick: f64,
    /// Fraction of the gap to ambient closed per tick.
    pub thermal_drift: f64,
    /// Upper bound of per-tick random heat.
    pub heat_jitter: f64,
    /// Heat generated per unit of energy spent.
    pub heat_per_energy: f64,
    /// Memory lost per tick per degree above `damage_threshold`.
    pub memory_loss_rate: f64,
    /// γ: baseline stability lost per tick.
    pub entropy_rate: f64,
    /// Extra stability lost per tick per degree above ambient.
    pub entropy_heat_coupling: f64,
}

impl Default for MetabolismConfig {
    fn default() -> Self {
        Self {
            energy_max: 100.0,
            temperature_max: 120.0,
            ambient_temperature: 36.5,
            thermal_limit: 95.0,
            damage_threshold: 70.0,
            energy_drain_per_tick: 0.02,
            thermal_drift: 0.05,
            heat_jitter: 0.6,
            heat_per_energy: 0.8,
            memory_loss_rate: 0.02,
            entropy_rate: 0.01,
            entropy_heat_coupling: 0.0005,
        }
    }
}

impl MetabolismConfig {
    pub fn validate(&self) -> Result<()> {
        let non_negative = [
            ("energy_drain_per_tick", self.energy_drain_per_tick),
            ("heat_jitter", self.heat_jitter),
            ("heat_per_energy", self.heat_per_energy),
            ("memory_loss_rate", self.memory_loss_rate),
            ("entropy_rate", self.entropy_rate),
            ("entropy_heat_coupling", self.entropy_heat_coupling),
        ];
        for (name, value) in non_negative {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(Error::config(format!(
                    "metabolism.{name} must be a finite value >= 0, got {value}"
                )));
            }
        }
        if !(self.energy_max > 0.0 && self.energy_max.is_finite()) {
            return Err(Error::config("metabolism.energy_max must be positive"));
        }
        if !(self.temperature_max > 0.0 && self.temperature_max.is_finite()) {
            return Err(Error::config("metabolism.temperature_max must be positive"));
        }
        if !(0.0..=1.0).contains(&self.thermal_drift) {
            return Err(Error::config("metabolism.thermal_drift must be within [0, 1]"));
        }
        if self.thermal_limit > self.temperature_max {
            return Err(Error::config("metabolism.thermal_limit must not exceed temperature_max"));
        }
        if !(0.0..self.thermal_limit).contains(&self.ambient_temperature) {
            return Err(Error::config(
                "metabolism.ambient_temperature must be in [0, thermal_limit)",
            ));
        }
        Ok(())
    }

    pub fn fresh_state(&self) -> ResourceState {
        ResourceState::fresh(self.energy_max, self.ambient_temperature)
    }
}

pub struct ResourceLedger {
    state: ResourceState,
    config: MetabolismConfig,
    rng: StdRng,
}

impl ResourceLedger {
    pub fn new(state: ResourceState, config: MetabolismConfig) -> Self {
        Self::with_rng(state, config, StdRng::from_entropy())
    }

    /// Deterministic jitter, for tests and replays.
    pub fn with_seed(state: ResourceState, config: MetabolismConfig, seed: u64) -> Self {
        Self::with_rng(state, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(mut state: ResourceState, config: MetabolismConfig, rng: StdRng) -> Self {
        state.clamp(config.energy_max, config.temperature_max);
        Self { state, config, rng }
    }

    pub fn state(&self) -> &ResourceState {
        &self.state
    }

    pub fn config(&self) -> &MetabolismConfig {
        &self.config
    }

    /// Replace the live state wholesale (seed import). Pulse count is kept as given.
    pub fn reseed(&mut self, state: ResourceState) {
        self.state = state;
        self.clamp();
    }

    /// Debit `amount` energy and add its heat. The debit and the death check
    /// are one step, so a cost that overheats is as fatal as one that starves.
    pub fn apply_cost(&mut self, amount: f64) -> std::result::Result<(), DeathKind> {
        let amount = if amount.is_nan() { 0.0 } else { amount.max(0.0) };
        self.state.energy -= amount;
        self.state.temperature += amount * self.config.heat_per_energy;
        self.clamp();
        match self.evaluate_death() {
            Some(kind) => Err(kind),
            None => Ok(()),
        }
    }

    /// Apply `delta_ticks` of passive metabolism. Stops at the first fatal tick.
    pub fn passive_decay(&mut self, delta_ticks: u32) -> std::result::Result<(), DeathKind> {
        for _ in 0..delta_ticks {
            let cfg = &self.config;
            let jitter = self.rng.gen::<f64>() * cfg.heat_jitter;

            let s = &mut self.state;
            s.pulse_count = s.pulse_count.saturating_add(1);
            s.energy -= cfg.energy_drain_per_tick;
            s.temperature += cfg.thermal_drift * (cfg.ambient_temperature - s.temperature) + jitter;
            s.temperature = s.temperature.clamp(0.0, cfg.temperature_max);

            let overheat = (s.temperature - cfg.damage_threshold).max(0.0);
            s.memory_integrity -= cfg.memory_loss_rate * overheat;

            let excess = (s.temperature - cfg.ambient_temperature).max(0.0);
            s.stability -= cfg.entropy_rate + cfg.entropy_heat_coupling * excess;

            self.clamp();
            if let Some(kind) = self.evaluate_death() {
                return Err(kind);
            }
        }
        Ok(())
    }

    /// Reduce temperature, floored at zero. Only the slow loop regulates heat.
    pub fn cool(&mut self, amount: f64) {
        if amount.is_finite() && amount > 0.0 {
            self.state.temperature -= amount;
        }
        self.clamp();
    }

    pub fn evaluate_death(&self) -> Option<DeathKind> {
        let s = &self.state;
        if s.energy <= 0.0 {
            Some(DeathKind::Energy)
        } else if s.temperature >= self.config.thermal_limit {
            Some(DeathKind::Thermal)
        } else if s.memory_integrity <= 0.0 {
            Some(DeathKind::Memory)
        } else if s.stability <= 0.0 {
            Some(DeathKind::Stability)
        } else {
            None
        }
    }

    fn clamp(&mut self) {
        self.state.clamp(self.config.energy_max, self.config.temperature_max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(state: ResourceState) -> ResourceLedger {
        ResourceLedger::with_seed(state, MetabolismConfig::default(), 7)
    }

    fn nominal() -> ResourceState {
        MetabolismConfig::default().fresh_state()
    }

    #[test]
    fn cost_beyond_remaining_energy_is_fatal_and_clamped() {
        let mut l = ledger(ResourceState { energy: 1.0, ..nominal() });
        assert_eq!(l.apply_cost(2.0), Err(DeathKind::Energy));
        assert_eq!(l.state().energy, 0.0);
    }

    #[test]
    fn cost_heat_crossing_the_thermal_limit_is_fatal() {
        let cfg = MetabolismConfig::default();
        let mut l = ledger(ResourceState { temperature: 94.9, ..nominal() });
        assert_eq!(l.apply_cost(0.2), Err(DeathKind::Thermal));
        assert!(l.state().temperature >= cfg.thermal_limit);
    }

    #[test]
    fn energy_wins_when_a_cost_starves_and_overheats() {
        let mut l = ledger(ResourceState { energy: 1.0, temperature: 94.9, ..nominal() });
        assert_eq!(l.apply_cost(2.0), Err(DeathKind::Energy));
    }

    #[test]
    fn negative_and_nan_costs_are_ignored() {
        let mut l = ledger(ResourceState { energy: 50.0, ..nominal() });
        l.apply_cost(-10.0).unwrap();
        l.apply_cost(f64::NAN).unwrap();
        assert_eq!(l.state().energy, 50.0);
    }

    #[test]
    fn spending_energy_generates_heat() {
        let mut l = ledger(nominal());
        let before = l.state().temperature;
        l.apply_cost(5.0).unwrap();
        assert!(l.state().temperature > before);
    }

    #[test]
    fn decay_advances_pulse_and_drains_energy() {
        let mut l = ledger(nominal());
        l.passive_decay(10).unwrap();
        assert_eq!(l.state().pulse_count, 10);
        assert!(l.state().energy < 100.0);
        assert!(l.state().stability < 100.0);
    }

    #[test]
    fn decay_stops_at_first_fatal_tick() {
        let mut l = ledger(ResourceState { energy: 0.03, ..nominal() });
        assert_eq!(l.passive_decay(50), Err(DeathKind::Energy));
        assert_eq!(l.state().pulse_count, 2);
    }

    #[test]
    fn overheating_degrades_memory() {
        let mut l = ledger(ResourceState { temperature: 90.0, ..nominal() });
        l.passive_decay(1).unwrap();
        assert!(l.state().memory_integrity < 100.0);
    }

    #[test]
    fn cool_is_floored_at_zero() {
        let mut l = ledger(ResourceState { temperature: 3.0, ..nominal() });
        l.cool(10.0);
        assert_eq!(l.state().temperature, 0.0);
    }

    #[test]
    fn death_priority_prefers_energy_over_everything() {
        let l = ledger(ResourceState {
            energy: 0.0,
            temperature: 110.0,
            memory_integrity: 0.0,
            stability: 0.0,
            pulse_count: 3,
        });
        assert_eq!(l.evaluate_death(), Some(DeathKind::Energy));
    }

    #[test]
    fn death_priority_thermal_before_memory_and_stability() {
        let l = ledger(ResourceState {
            energy: 10.0,
            temperature: 100.0,
            memory_integrity: 0.0,
            stability: 0.0,
            pulse_count: 3,
        });
        assert_eq!(l.evaluate_death(), Some(DeathKind::Thermal));

        let l = ledger(ResourceState {
            energy: 10.0,
            temperature: 40.0,
            memory_integrity: 0.0,
            stability: 0.0,
            pulse_count: 3,
        });
        assert_eq!(l.evaluate_death(), Some(DeathKind::Memory));
    }

    #[test]
    fn construction_clamps_out_of_range_input() {
        let l = ledger(ResourceState {
            energy: 500.0,
            temperature: -4.0,
            memory_integrity: f64::NAN,
            stability: 101.0,
            pulse_count: 0,
        });
        assert_eq!(l.state().energy, 100.0);
        assert_eq!(l.state().temperature, 0.0);
        assert_eq!(l.state().memory_integrity, 0.0);
        assert_eq!(l.state().stability, 100.0);
    }

    #[test]
    fn default_config_is_valid() {
        MetabolismConfig::default().validate().unwrap();
    }

    #[test]
    fn thermal_limit_above_max_is_rejected() {
        let cfg = MetabolismConfig { thermal_limit: 130.0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }
}
