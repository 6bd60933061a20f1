//! Core state types shared by the loops, the ledger and the seed codec

use serde::{Deserialize, Serialize};

/// Upper bound for `memory_integrity` and `stability`.
pub const PERCENT_MAX: f64 = 100.0;

/// The metabolic record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub energy: f64,
    pub temperature: f64,
    pub memory_integrity: f64,
    pub stability: f64,
    pub pulse_count: u64,
}

impl ResourceState {
    /// Fresh-spawn values: full energy, ambient temperature, intact memory.
    pub fn fresh(energy_max: f64, ambient_temperature: f64) -> Self {
        Self {
            energy: energy_max,
            temperature: ambient_temperature,
            memory_integrity: PERCENT_MAX,
            stability: PERCENT_MAX,
            pulse_count: 0,
        }
    }

    /// Clamp every field into its declared range. NaN collapses to zero.
    pub fn clamp(&mut self, energy_max: f64, temperature_max: f64) {
        self.energy = clamp_field(self.energy, energy_max);
        self.temperature = clamp_field(self.temperature, temperature_max);
        self.memory_integrity = clamp_field(self.memory_integrity, PERCENT_MAX);
        self.stability = clamp_field(self.stability, PERCENT_MAX);
    }

    /// First field outside its range, if any.
    pub fn out_of_range(
        &self,
        energy_max: f64,
        temperature_max: f64,
    ) -> Option<(&'static str, f64)> {
        let fields = [
            ("energy", self.energy, energy_max),
            ("temperature", self.temperature, temperature_max),
            ("memory_integrity", self.memory_integrity, PERCENT_MAX),
            ("stability", self.stability, PERCENT_MAX),
        ];
        fields
            .into_iter()
            .find(|(_, value, max)| !(0.0..=*max).contains(value))
            .map(|(name, value, _)| (name, value))
    }
}

pub(crate) fn clamp_field(value: f64, max: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, max)
    }
}

/// Active behavioral policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mask {
    /// Nominal, supportive mode.
    Healer,
    /// Analytical arbitration. Forced by a veto.
    Judge,
    /// Low-cost relay for routine input.
    Courier,
}

impl std::fmt::Display for Mask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healer => write!(f, "healer"),
            Self::Judge => write!(f, "judge"),
            Self::Courier => write!(f, "courier"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehavioralState {
    pub mask: Mask,
    pub mood: String,
    pub veto_pending: bool,
    /// Consecutive fast ticks with no human input.
    #[serde(default)]
    pub routine_streak: u32,
}

impl Default for BehavioralState {
    fn default() -> Self {
        Self {
            mask: Mask::Healer,
            mood: "awakening".to_string(),
            veto_pending: false,
            routine_streak: 0,
        }
    }
}
