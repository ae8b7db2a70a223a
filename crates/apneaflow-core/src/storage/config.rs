//! TOML-based application configuration.
//!
//! Stores user preferences including:
//! - Default session shape (breaths, paces, recovery, cycles, sounds)
//! - Track volumes
//! - Hold gesture durations and tick cadence
//! - Remote endpoint and student identity
//! - Audio source slugs and tokens
//!
//! Configuration is stored at `~/.config/apneaflow/config.toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use super::data_dir;
use crate::audio::{SourcePlan, SourceRef, TrackId};
use crate::error::{ConfigError, Result, ValidationError};
use crate::metrics::StudentIdentity;
use crate::session::{
    AmbientSound, BreathStyle, ControllerSettings, SecondaryTrack, SessionConfig, Volumes,
};

/// Session shape used when the caller does not override it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDefaults {
    #[serde(default = "default_breaths_per_cycle")]
    pub breaths_per_cycle: u32,
    #[serde(default = "default_pace")]
    pub inhale_seconds: f64,
    #[serde(default = "default_pace")]
    pub exhale_seconds: f64,
    #[serde(default = "default_recovery_seconds")]
    pub recovery_seconds: f64,
    #[serde(default = "default_cycles")]
    pub cycles: u32,
    #[serde(default)]
    pub breath_style: BreathStyle,
    #[serde(default = "default_ambient")]
    pub ambient: AmbientSound,
    #[serde(default)]
    pub secondary: SecondaryTrack,
    #[serde(default = "default_one")]
    pub pre_apnea_lead_breaths: u32,
}

/// Hold-to-confirm durations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GestureConfig {
    #[serde(default = "default_1500")]
    pub end_apnea_hold_ms: u64,
    #[serde(default = "default_1000")]
    pub stop_hold_ms: u64,
    #[serde(default = "default_1500")]
    pub final_close_hold_ms: u64,
    #[serde(default = "default_hold_poll_ms")]
    pub hold_poll_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_true")]
    pub keep_ambient_on_complete: bool,
}

/// Remote student record. An empty `base_url` disables every remote call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub student_id: String,
    #[serde(default)]
    pub possession_token: String,
}

/// A remote audio source. An empty slug disables the track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub token: String,
}

impl SourceEntry {
    fn named(slug: &str) -> Self {
        Self {
            slug: slug.into(),
            token: String::new(),
        }
    }

    pub fn to_ref(&self) -> Option<SourceRef> {
        let slug = self.slug.trim();
        if slug.is_empty() {
            return None;
        }
        Some(match self.token.trim() {
            "" => SourceRef::new(slug),
            token => SourceRef::with_token(slug, token),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_breath_source")]
    pub breath: SourceEntry,
    /// Overrides the student's own apnea track when set.
    #[serde(default)]
    pub apnea: SourceEntry,
    #[serde(default = "default_apnea_end_source")]
    pub apnea_end: SourceEntry,
    #[serde(default)]
    pub pre_apnea: SourceEntry,
    #[serde(default)]
    pub final_cue: SourceEntry,
    #[serde(default = "default_forest_source")]
    pub forest: SourceEntry,
    #[serde(default = "default_ocean_source")]
    pub ocean: SourceEntry,
    #[serde(default = "default_balance_source")]
    pub balance: SourceEntry,
    #[serde(default = "default_gamma_source")]
    pub gamma: SourceEntry,
    #[serde(default = "default_trance_source")]
    pub trance: SourceEntry,
}

/// Application configuration.
///
/// Serialized to/from TOML at `~/.config/apneaflow/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub session: SessionDefaults,
    #[serde(default)]
    pub volumes: Volumes,
    #[serde(default)]
    pub gestures: GestureConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

// Default functions
fn default_breaths_per_cycle() -> u32 {
    30
}
fn default_pace() -> f64 {
    2.0
}
fn default_recovery_seconds() -> f64 {
    15.0
}
fn default_cycles() -> u32 {
    3
}
fn default_ambient() -> AmbientSound {
    AmbientSound::Forest
}
fn default_one() -> u32 {
    1
}
fn default_1500() -> u64 {
    1_500
}
fn default_1000() -> u64 {
    1_000
}
fn default_hold_poll_ms() -> u64 {
    30
}
fn default_tick_ms() -> u64 {
    100
}
fn default_true() -> bool {
    true
}
fn default_breath_source() -> SourceEntry {
    SourceEntry::named("respira")
}
fn default_apnea_end_source() -> SourceEntry {
    SourceEntry::named("inala")
}
fn default_forest_source() -> SourceEntry {
    SourceEntry::named("bosq")
}
fn default_ocean_source() -> SourceEntry {
    SourceEntry::named("oceano")
}
fn default_balance_source() -> SourceEntry {
    SourceEntry::named("balance")
}
fn default_gamma_source() -> SourceEntry {
    SourceEntry::named("gamma")
}
fn default_trance_source() -> SourceEntry {
    SourceEntry::named("trance")
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            breaths_per_cycle: default_breaths_per_cycle(),
            inhale_seconds: default_pace(),
            exhale_seconds: default_pace(),
            recovery_seconds: default_recovery_seconds(),
            cycles: default_cycles(),
            breath_style: BreathStyle::default(),
            ambient: default_ambient(),
            secondary: SecondaryTrack::default(),
            pre_apnea_lead_breaths: default_one(),
        }
    }
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            end_apnea_hold_ms: 1_500,
            stop_hold_ms: 1_000,
            final_close_hold_ms: 1_500,
            hold_poll_ms: 30,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            keep_ambient_on_complete: true,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            breath: default_breath_source(),
            apnea: SourceEntry::default(),
            apnea_end: default_apnea_end_source(),
            pre_apnea: SourceEntry::default(),
            final_cue: SourceEntry::default(),
            forest: default_forest_source(),
            ocean: default_ocean_source(),
            balance: default_balance_source(),
            gamma: default_gamma_source(),
            trance: default_trance_source(),
        }
    }
}

impl AppConfig {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> std::result::Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut parts = key.split('.').peekable();
        if key.is_empty() {
            return Err(unknown());
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value.parse::<bool>().map_err(|e| invalid(e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => {
                        if let Ok(n) = value.parse::<u64>() {
                            serde_json::Value::Number(n.into())
                        } else if let Ok(n) = value.parse::<f64>() {
                            serde_json::Number::from_f64(n)
                                .map(serde_json::Value::Number)
                                .ok_or_else(|| invalid(format!("cannot parse '{value}' as number")))?
                        } else {
                            return Err(invalid(format!("cannot parse '{value}' as number")));
                        }
                    }
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    fn path() -> Result<PathBuf> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from disk, writing the defaults first if no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let cfg = Self::default();
            cfg.save_to(path)?;
            return Ok(cfg);
        }
        let load_failed = |message: String| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = std::fs::read_to_string(path).map_err(|e| load_failed(e.to_string()))?;
        let cfg = toml::from_str(&content).map_err(|e| load_failed(e.to_string()))?;
        Ok(cfg)
    }

    /// Persist to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))?;
        Ok(())
    }

    /// Load from disk, returning default on error.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "falling back to default config");
            Self::default()
        })
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Update a value by dot-separated key without saving.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or the value does not fit it.
    pub fn update(&mut self, key: &str, value: &str) -> Result<()> {
        let mut json = serde_json::to_value(&*self)?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        *self = serde_json::from_value(json).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// Set a value by key and persist.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown, the value cannot be parsed,
    /// or the config cannot be saved.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.update(key, value)?;
        self.save()
    }

    /// Build a validated session config from the defaults.
    pub fn session_config(&self) -> std::result::Result<SessionConfig, ValidationError> {
        let s = &self.session;
        let config = SessionConfig {
            breaths_per_cycle: s.breaths_per_cycle,
            inhale_seconds: s.inhale_seconds,
            exhale_seconds: s.exhale_seconds,
            recovery_seconds: s.recovery_seconds,
            cycles: s.cycles,
            breath_style: s.breath_style,
            ambient: s.ambient,
            secondary: s.secondary,
            volumes: self.volumes,
            pre_apnea_lead_breaths: s.pre_apnea_lead_breaths,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            end_apnea_hold_ms: self.gestures.end_apnea_hold_ms,
            stop_hold_ms: self.gestures.stop_hold_ms,
            final_close_hold_ms: self.gestures.final_close_hold_ms,
            hold_poll_ms: self.gestures.hold_poll_ms,
            keep_ambient_on_complete: self.timing.keep_ambient_on_complete,
        }
    }

    pub fn identity(&self) -> StudentIdentity {
        StudentIdentity::new(
            self.remote.student_id.trim(),
            self.remote.possession_token.trim(),
        )
    }

    /// The remote base URL, or `None` when remote calls are disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if `remote.base_url` is set but not a valid URL.
    pub fn remote_base(&self) -> Result<Option<Url>> {
        let raw = self.remote.base_url.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        // `join` drops the last path segment unless it ends with a slash.
        let normalized = if raw.ends_with('/') {
            raw.to_string()
        } else {
            format!("{raw}/")
        };
        let url = Url::parse(&normalized).map_err(|e| ConfigError::InvalidValue {
            key: "remote.base_url".into(),
            message: e.to_string(),
        })?;
        Ok(Some(url))
    }

    /// Tracks to resolve for a session with `config`'s sound choices.
    pub fn source_plan(&self, config: &SessionConfig) -> SourcePlan {
        let sources = &self.sources;
        let apnea = sources.apnea.to_ref().or_else(|| {
            let identity = self.identity();
            (!identity.student_id.is_empty()).then(|| {
                if identity.possession_token.is_empty() {
                    SourceRef::new(identity.student_id)
                } else {
                    SourceRef::with_token(identity.student_id, identity.possession_token)
                }
            })
        });
        let ambient = match config.ambient {
            AmbientSound::None => None,
            AmbientSound::Forest => sources.forest.to_ref(),
            AmbientSound::Ocean => sources.ocean.to_ref(),
        };
        let secondary = match config.secondary {
            SecondaryTrack::None => None,
            SecondaryTrack::Balance => sources.balance.to_ref(),
            SecondaryTrack::Gamma => sources.gamma.to_ref(),
            SecondaryTrack::Trance => sources.trance.to_ref(),
        };

        let entries = [
            (TrackId::BreathCue, sources.breath.to_ref()),
            (TrackId::ApneaCue, apnea),
            (TrackId::ApneaEndCue, sources.apnea_end.to_ref()),
            (TrackId::PreApneaCue, sources.pre_apnea.to_ref()),
            (TrackId::FinalCue, sources.final_cue.to_ref()),
            (TrackId::Ambient, ambient),
            (TrackId::Secondary, secondary),
        ]
        .into_iter()
        .filter_map(|(track, source)| source.map(|s| (track, s)))
        .collect();
        SourcePlan { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrip() {
        let cfg = AppConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, cfg);
        assert_eq!(parsed.session.breaths_per_cycle, 30);
        assert_eq!(parsed.gestures.end_apnea_hold_ms, 1_500);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let parsed: AppConfig = toml::from_str("[session]\ncycles = 5\n").unwrap();
        assert_eq!(parsed.session.cycles, 5);
        assert_eq!(parsed.session.recovery_seconds, 15.0);
        assert_eq!(parsed.timing.tick_ms, 100);
        assert_eq!(parsed.sources.breath.slug, "respira");
    }

    #[test]
    fn get_supports_dot_path_keys() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.get("session.cycles").as_deref(), Some("3"));
        assert_eq!(cfg.get("session.breath_style").as_deref(), Some("reset"));
        assert_eq!(cfg.get("timing.keep_ambient_on_complete").as_deref(), Some("true"));
        assert!(cfg.get("session.missing_key").is_none());
    }

    #[test]
    fn update_changes_nested_values() {
        let mut cfg = AppConfig::default();
        cfg.update("session.cycles", "5").unwrap();
        cfg.update("session.recovery_seconds", "12.5").unwrap();
        cfg.update("session.ambient", "ocean").unwrap();
        cfg.update("remote.student_id", "ana").unwrap();
        assert_eq!(cfg.session.cycles, 5);
        assert_eq!(cfg.session.recovery_seconds, 12.5);
        assert_eq!(cfg.session.ambient, AmbientSound::Ocean);
        assert_eq!(cfg.remote.student_id, "ana");
    }

    #[test]
    fn update_rejects_unknown_key_and_bad_values() {
        let mut cfg = AppConfig::default();
        assert!(matches!(
            cfg.update("session.nonexistent", "1"),
            Err(crate::CoreError::Config(ConfigError::UnknownKey(_)))
        ));
        assert!(cfg.update("timing.keep_ambient_on_complete", "maybe").is_err());
        assert!(cfg.update("session.breath_style", "turbo").is_err());
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn session_config_is_validated() {
        let mut cfg = AppConfig::default();
        assert!(cfg.session_config().is_ok());
        cfg.session.recovery_seconds = 0.0;
        assert!(cfg.session_config().is_err());
    }

    #[test]
    fn source_plan_follows_sound_choices() {
        let mut cfg = AppConfig::default();
        cfg.remote.student_id = "ana".into();
        cfg.remote.possession_token = "tok-1".into();
        let mut session = cfg.session_config().unwrap();
        session.ambient = AmbientSound::Ocean;
        session.secondary = SecondaryTrack::Gamma;

        let plan = cfg.source_plan(&session);
        assert_eq!(plan.get(TrackId::ApneaCue), Some(&SourceRef::with_token("ana", "tok-1")));
        assert_eq!(plan.get(TrackId::Ambient).map(|s| s.slug.as_str()), Some("oceano"));
        assert_eq!(plan.get(TrackId::Secondary).map(|s| s.slug.as_str()), Some("gamma"));
        assert!(plan.get(TrackId::PreApneaCue).is_none());
    }

    #[test]
    fn no_identity_means_no_apnea_source() {
        let cfg = AppConfig::default();
        let plan = cfg.source_plan(&cfg.session_config().unwrap());
        assert!(plan.get(TrackId::ApneaCue).is_none());
        assert!(plan.get(TrackId::BreathCue).is_some());
    }

    #[test]
    fn remote_base_is_optional_and_normalized() {
        let mut cfg = AppConfig::default();
        assert_eq!(cfg.remote_base().unwrap(), None);
        cfg.remote.base_url = "https://example.com/app".into();
        let base = cfg.remote_base().unwrap().unwrap();
        assert_eq!(base.join("api/audio").unwrap().path(), "/app/api/audio");
        cfg.remote.base_url = "not a url".into();
        assert!(cfg.remote_base().is_err());
    }

    #[test]
    fn load_from_writes_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert!(path.exists());

        std::fs::write(&path, "[session]\ncycles = \"many\"\n").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }
}
