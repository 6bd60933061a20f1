//! PolicySelector - maps resource and behavioral state to a mask
//!
//! Pure and deterministic: identical inputs always produce the identical mask.

use crate::types::{BehavioralState, Mask, ResourceState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Stability below this escalates to Judge.
    pub judge_stability_below: f64,
    /// Temperature above this escalates to Judge.
    pub judge_temperature_above: f64,
    /// Routine ticks after which the agent relaxes into Courier.
    pub courier_after_routine_ticks: u32,
    /// Energy fraction (of E_max) below which the mood reads as depleted.
    pub depleted_energy_fraction: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            judge_stability_below: 35.0,
            judge_temperature_above: 80.0,
            courier_after_routine_ticks: 5,
            depleted_energy_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicySelector {
    config: PolicyConfig,
    energy_max: f64,
}

impl PolicySelector {
    pub fn new(config: PolicyConfig, energy_max: f64) -> Self {
        Self { config, energy_max }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn select_mask(&self, resources: &ResourceState, behavior: &BehavioralState) -> Mask {
        if behavior.veto_pending {
            return Mask::Judge;
        }
        let threatened = resources.stability < self.config.judge_stability_below
            || resources.temperature > self.config.judge_temperature_above;
        if threatened {
            Mask::Judge
        } else if behavior.routine_streak >= self.config.courier_after_routine_ticks {
            Mask::Courier
        } else {
            Mask::Healer
        }
    }

    /// Informational mood tag for a mask under the given resources.
    pub fn mood_for(&self, resources: &ResourceState, mask: Mask, vetoed: bool) -> &'static str {
        if vetoed {
            return "overruled";
        }
        if resources.energy < self.energy_max * self.config.depleted_energy_fraction {
            return "depleted";
        }
        if resources.temperature > self.config.judge_temperature_above {
            return "feverish";
        }
        match mask {
            Mask::Healer => "attentive",
            Mask::Judge => "vigilant",
            Mask::Courier => "steady",
        }
    }
}
