use serde::{Deserialize, Serialize};

use crate::clock::duration_ms;
use crate::error::ValidationError;

/// Breathing pace preset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreathStyle {
    Activation,
    #[default]
    Reset,
    Comfort,
}

impl BreathStyle {
    /// Seconds per inhale and per exhale for this preset.
    pub fn pace_seconds(&self) -> f64 {
        match self {
            BreathStyle::Activation => 1.5,
            BreathStyle::Reset => 2.0,
            BreathStyle::Comfort => 3.0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BreathStyle::Activation => "activation",
            BreathStyle::Reset => "reset",
            BreathStyle::Comfort => "comfort",
        }
    }
}

impl std::str::FromStr for BreathStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "activation" => Ok(BreathStyle::Activation),
            "reset" => Ok(BreathStyle::Reset),
            "comfort" => Ok(BreathStyle::Comfort),
            other => Err(format!("unknown breath style '{other}'")),
        }
    }
}

/// Background loop played for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmbientSound {
    None,
    Forest,
    Ocean,
}

/// Optional secondary tone layered over the ambient loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecondaryTrack {
    #[default]
    None,
    Balance,
    Gamma,
    Trance,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Volumes {
    pub apnea: f32,
    pub ambient: f32,
    pub secondary: f32,
}

impl Default for Volumes {
    fn default() -> Self {
        Self {
            apnea: 0.8,
            ambient: 0.5,
            secondary: 0.5,
        }
    }
}

/// Immutable parameters of one session.
///
/// Construct freely, then hand to [`SessionController::new`](super::SessionController::new),
/// which rejects it unless [`validate`](Self::validate) passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub breaths_per_cycle: u32,
    pub inhale_seconds: f64,
    pub exhale_seconds: f64,
    pub recovery_seconds: f64,
    pub cycles: u32,
    pub breath_style: BreathStyle,
    pub ambient: AmbientSound,
    pub secondary: SecondaryTrack,
    #[serde(default)]
    pub volumes: Volumes,
    /// How many breaths before the apnea the pre-apnea cue fires.
    /// Zero disables the cue.
    #[serde(default = "default_lead_breaths")]
    pub pre_apnea_lead_breaths: u32,
}

fn default_lead_breaths() -> u32 {
    1
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            breaths_per_cycle: 30,
            inhale_seconds: 2.0,
            exhale_seconds: 2.0,
            recovery_seconds: 15.0,
            cycles: 3,
            breath_style: BreathStyle::Reset,
            ambient: AmbientSound::Forest,
            secondary: SecondaryTrack::None,
            volumes: Volumes::default(),
            pre_apnea_lead_breaths: default_lead_breaths(),
        }
    }
}

impl SessionConfig {
    /// Apply a pace preset to both inhale and exhale.
    pub fn with_style(mut self, style: BreathStyle) -> Self {
        self.breath_style = style;
        self.inhale_seconds = style.pace_seconds();
        self.exhale_seconds = style.pace_seconds();
        self
    }

    /// Check every invariant.
    ///
    /// # Errors
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("inhale_seconds", self.inhale_seconds),
            ("exhale_seconds", self.exhale_seconds),
            ("recovery_seconds", self.recovery_seconds),
        ] {
            if !value.is_finite() || value <= 0.0 || duration_ms(value) == 0 {
                return Err(ValidationError::InvalidDuration { field, value });
            }
        }
        if self.breaths_per_cycle == 0 {
            return Err(ValidationError::ZeroCount {
                field: "breaths_per_cycle",
            });
        }
        if self.cycles == 0 {
            return Err(ValidationError::ZeroCount { field: "cycles" });
        }
        for (field, value) in [
            ("volumes.apnea", self.volumes.apnea),
            ("volumes.ambient", self.volumes.ambient),
            ("volumes.secondary", self.volumes.secondary),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ValidationError::VolumeOutOfRange { field, value });
            }
        }
        Ok(())
    }

    pub fn inhale_ms(&self) -> u64 {
        duration_ms(self.inhale_seconds)
    }

    pub fn exhale_ms(&self) -> u64 {
        duration_ms(self.exhale_seconds)
    }

    pub fn recovery_ms(&self) -> u64 {
        duration_ms(self.recovery_seconds)
    }

    /// Breath number (1-based) at whose start the pre-apnea cue fires.
    /// `None` when the lead leaves no such breath. When this is breath 1
    /// the cue fires as the cycle's first inhale begins.
    pub fn pre_apnea_breath(&self) -> Option<u32> {
        if self.pre_apnea_lead_breaths == 0 {
            return None;
        }
        self.breaths_per_cycle
            .checked_sub(self.pre_apnea_lead_breaths)
            .filter(|n| *n > 0)
    }

    /// Wall-clock length of one cycle's breathing block.
    pub fn breathing_ms(&self) -> u64 {
        (self.inhale_ms() + self.exhale_ms()).saturating_mul(self.breaths_per_cycle as u64)
    }

    /// Timed portion of the whole session (apnea holds excluded).
    pub fn timed_total_ms(&self) -> u64 {
        (self.breathing_ms() + self.recovery_ms()).saturating_mul(self.cycles as u64)
    }

    pub fn total_breaths(&self) -> u64 {
        self.breaths_per_cycle as u64 * self.cycles as u64
    }
}
