//! Session configuration
//!
//! One TOML document with `[link]`, `[engine]`, `[athena]`, `[health]`,
//! `[registry]` and `[events]` sections. Every field has a default, so an
//! empty file is a valid configuration. Durations are given in
//! milliseconds. A handful of `ORCHESTRA_*` environment variables override
//! the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::athena::AthenaSettings;
use crate::engine::EngineConfig;
use crate::events::{CHANNEL_CAPACITY, REPLAY_CAPACITY};
use crate::registry::{default_catalog, HealthPolicy, ModelProfile};
use crate::synthesis::SynthesisConfig;
use crate::trace::DEFAULT_TRACE_CAPACITY;
use crate::transport::{LinkConfig, ReconnectPolicy};

/// Errors from loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value {value:?} for {var}")]
    Env { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// `[link]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSection {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub latency_window: usize,
    pub reconnect_max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Fraction of the delay, 0.2 = ±20%
    pub backoff_jitter: f64,
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7400,
            connect_timeout_ms: 5_000,
            probe_interval_ms: 2_000,
            request_timeout_ms: 30_000,
            latency_window: 10,
            reconnect_max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            backoff_jitter: 0.2,
        }
    }
}

/// `[engine]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub call_timeout_ms: u64,
    /// `None` disables the run timeout
    pub run_timeout_ms: Option<u64>,
    pub default_confidence: f32,
    pub similarity_threshold: f32,
    pub supplement_threshold: f32,
}

impl Default for EngineSection {
    fn default() -> Self {
        let synthesis = SynthesisConfig::default();
        Self {
            call_timeout_ms: 30_000,
            run_timeout_ms: Some(120_000),
            default_confidence: 0.7,
            similarity_threshold: synthesis.similarity_threshold,
            supplement_threshold: synthesis.supplement_threshold,
        }
    }
}

/// Where the registry's models come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrySource {
    /// Models listed in configuration (or the built-in catalog)
    #[default]
    Static,
    /// Models reported by the backend after connecting
    Discovery,
}

impl std::str::FromStr for RegistrySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "static" => Ok(RegistrySource::Static),
            "discovery" => Ok(RegistrySource::Discovery),
            other => Err(format!("unknown registry source: {}", other)),
        }
    }
}

/// `[registry]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RegistrySection {
    pub source: RegistrySource,
    /// Static models; the built-in catalog is used when empty
    pub models: Vec<ModelProfile>,
}

impl RegistrySection {
    /// Profiles to register before connecting
    pub fn initial_profiles(&self) -> Vec<ModelProfile> {
        match self.source {
            RegistrySource::Discovery => self.models.clone(),
            RegistrySource::Static if self.models.is_empty() => default_catalog(),
            RegistrySource::Static => self.models.clone(),
        }
    }
}

/// `[events]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    pub channel_capacity: usize,
    pub replay_capacity: usize,
    pub trace_capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            channel_capacity: CHANNEL_CAPACITY,
            replay_capacity: REPLAY_CAPACITY,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
        }
    }
}

/// Complete session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestraConfig {
    pub link: LinkSection,
    pub engine: EngineSection,
    pub athena: AthenaSettings,
    pub health: HealthPolicy,
    pub registry: RegistrySection,
    pub events: EventsSection,
}

impl OrchestraConfig {
    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file and validate it (no environment overrides)
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loading configuration");
        Self::from_toml_str(&content)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `ORCHESTRA_*` overrides from the process environment
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from `lookup` and re-validate
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        fn parse<T: std::str::FromStr>(var: &str, value: &str) -> ConfigResult<T> {
            value.trim().parse().map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value: value.to_string(),
            })
        }

        if let Some(v) = lookup("ORCHESTRA_HOST") {
            self.link.host = v;
        }
        if let Some(v) = lookup("ORCHESTRA_PORT") {
            self.link.port = parse("ORCHESTRA_PORT", &v)?;
        }
        if let Some(v) = lookup("ORCHESTRA_CALL_TIMEOUT_MS") {
            self.engine.call_timeout_ms = parse("ORCHESTRA_CALL_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("ORCHESTRA_RUN_TIMEOUT_MS") {
            self.engine.run_timeout_ms = match v.trim().to_lowercase().as_str() {
                "off" | "none" => None,
                _ => Some(parse("ORCHESTRA_RUN_TIMEOUT_MS", &v)?),
            };
        }
        if let Some(v) = lookup("ORCHESTRA_RECONNECT_MAX_ATTEMPTS") {
            self.link.reconnect_max_attempts = parse("ORCHESTRA_RECONNECT_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("ORCHESTRA_AUTO_APPLY") {
            self.athena.auto_apply = match v.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::Env {
                        var: "ORCHESTRA_AUTO_APPLY".to_string(),
                        value: v,
                    })
                }
            };
        }
        if let Some(v) = lookup("ORCHESTRA_AUTO_APPLY_THRESHOLD") {
            self.athena.auto_apply_threshold = parse("ORCHESTRA_AUTO_APPLY_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("ORCHESTRA_REGISTRY_SOURCE") {
            self.registry.source = parse("ORCHESTRA_REGISTRY_SOURCE", &v)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let unit = |name: &str, v: f32| -> ConfigResult<()> {
            if v.is_finite() && (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!(
                    "{} must be within [0, 1], got {}",
                    name, v
                )))
            }
        };

        let link = &self.link;
        if link.connect_timeout_ms == 0 {
            return invalid("link.connect_timeout_ms must be positive".into());
        }
        if link.probe_interval_ms == 0 {
            return invalid("link.probe_interval_ms must be positive".into());
        }
        if link.request_timeout_ms == 0 {
            return invalid("link.request_timeout_ms must be positive".into());
        }
        if link.backoff_base_ms == 0 {
            return invalid("link.backoff_base_ms must be positive".into());
        }
        if link.backoff_cap_ms < link.backoff_base_ms {
            return invalid(format!(
                "link.backoff_cap_ms ({}) is below link.backoff_base_ms ({})",
                link.backoff_cap_ms, link.backoff_base_ms
            ));
        }
        if !(0.0..=1.0).contains(&link.backoff_jitter) {
            return invalid(format!(
                "link.backoff_jitter must be within [0, 1], got {}",
                link.backoff_jitter
            ));
        }
        if link.latency_window == 0 {
            return invalid("link.latency_window must be positive".into());
        }

        if self.engine.call_timeout_ms == 0 {
            return invalid("engine.call_timeout_ms must be positive".into());
        }
        if self.engine.run_timeout_ms == Some(0) {
            return invalid("engine.run_timeout_ms must be positive".into());
        }
        unit("engine.default_confidence", self.engine.default_confidence)?;
        unit("engine.similarity_threshold", self.engine.similarity_threshold)?;
        unit("engine.supplement_threshold", self.engine.supplement_threshold)?;

        unit("athena.auto_apply_threshold", self.athena.auto_apply_threshold)?;
        unit("athena.policy.marginal_cutoff", self.athena.policy.marginal_cutoff)?;
        unit("athena.policy.min_fit", self.athena.policy.min_fit)?;
        if self.athena.policy.max_models == 0 {
            return invalid("athena.policy.max_models must be positive".into());
        }

        let health = &self.health;
        unit("health.success_alpha", health.success_alpha)?;
        unit("health.latency_alpha", health.latency_alpha)?;
        unit("health.healthy_threshold", health.healthy_threshold)?;
        unit("health.degraded_threshold", health.degraded_threshold)?;
        if health.degraded_threshold > health.healthy_threshold {
            return invalid("health.degraded_threshold exceeds health.healthy_threshold".into());
        }

        if self.events.channel_capacity == 0 {
            return invalid("events.channel_capacity must be positive".into());
        }
        Ok(())
    }

    pub fn link_config(&self) -> LinkConfig {
        let link = &self.link;
        LinkConfig {
            connect_timeout: Duration::from_millis(link.connect_timeout_ms),
            probe_interval: Duration::from_millis(link.probe_interval_ms),
            latency_window: link.latency_window,
            request_timeout: Duration::from_millis(link.request_timeout_ms),
            reconnect: ReconnectPolicy {
                max_attempts: link.reconnect_max_attempts,
                base: Duration::from_millis(link.backoff_base_ms),
                cap: Duration::from_millis(link.backoff_cap_ms),
                jitter: link.backoff_jitter,
            },
            ..LinkConfig::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            call_timeout: Duration::from_millis(self.engine.call_timeout_ms),
            run_timeout: self.engine.run_timeout_ms.map(Duration::from_millis),
            default_confidence: self.engine.default_confidence,
            synthesis: SynthesisConfig {
                similarity_threshold: self.engine.similarity_threshold,
                supplement_threshold: self.engine.supplement_threshold,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_empty_document_is_default() {
        let config = OrchestraConfig::from_toml_str("").unwrap();
        assert_eq!(config.link, LinkSection::default());
        assert_eq!(config.engine_config().default_confidence, 0.7);
        assert_eq!(config.athena.auto_apply_threshold, 0.75);
        assert_eq!(config.registry.source, RegistrySource::Static);
        assert!(!config.registry.initial_profiles().is_empty());
    }

    #[test]
    fn test_sections_parse() {
        let config = OrchestraConfig::from_toml_str(
            r#"
            [link]
            port = 9000
            backoff_base_ms = 200
            backoff_cap_ms = 800

            [engine]
            call_timeout_ms = 1500

            [athena]
            auto_apply = true

            [registry]
            source = "static"

            [[registry.models]]
            id = "local"
            capabilities = { coding = 0.8 }
            "#,
        )
        .unwrap();

        assert_eq!(config.link.port, 9000);
        let link = config.link_config();
        assert_eq!(link.reconnect.cap, Duration::from_millis(800));
        assert_eq!(config.engine_config().call_timeout, Duration::from_millis(1500));
        assert!(config.athena.auto_apply);
        let profiles = config.registry.initial_profiles();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].capability(crate::state::Capability::Coding), 0.8);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        for doc in [
            "[link]\nbackoff_base_ms = 500\nbackoff_cap_ms = 100",
            "[engine]\ncall_timeout_ms = 0",
            "[engine]\nrun_timeout_ms = 0",
            "[athena]\nauto_apply_threshold = 1.5",
            "[health]\nhealthy_threshold = 0.4\ndegraded_threshold = 0.6",
        ] {
            assert!(
                matches!(OrchestraConfig::from_toml_str(doc), Err(ConfigError::Invalid(_))),
                "accepted: {}",
                doc
            );
        }
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ORCHESTRA_HOST", "backend.local"),
            ("ORCHESTRA_PORT", "9100"),
            ("ORCHESTRA_RUN_TIMEOUT_MS", "off"),
            ("ORCHESTRA_AUTO_APPLY", "true"),
            ("ORCHESTRA_AUTO_APPLY_THRESHOLD", "0.6"),
            ("ORCHESTRA_REGISTRY_SOURCE", "discovery"),
        ]);
        let mut config = OrchestraConfig::default();
        config
            .apply_overrides(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.link.host, "backend.local");
        assert_eq!(config.link.port, 9100);
        assert_eq!(config.engine_config().run_timeout, None);
        assert!(config.athena.auto_apply);
        assert_eq!(config.athena.auto_apply_threshold, 0.6);
        assert_eq!(config.registry.source, RegistrySource::Discovery);
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut config = OrchestraConfig::default();
        let err = config
            .apply_overrides(|var| (var == "ORCHESTRA_PORT").then(|| "not-a-port".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { ref var, .. } if var == "ORCHESTRA_PORT"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[link]\nhost = \"10.0.0.5\"").unwrap();
        let config = OrchestraConfig::load(file.path()).unwrap();
        assert_eq!(config.link.host, "10.0.0.5");

        let missing = OrchestraConfig::load(Path::new("/nonexistent/orchestra.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
