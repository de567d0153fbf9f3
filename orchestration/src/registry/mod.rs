//! Model Registry: capability profiles, live health and usage counters
//!
//! Tracks every model a session can dispatch to. Profiles come from static
//! configuration or backend discovery; health and usage are updated after
//! every completed call using exponential moving averages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::state::{Capability, ModelId, ModelResult};

/// Static description of a model backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub id: ModelId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub provider: String,
    /// Specialization scores in [0, 1]
    #[serde(default)]
    pub capabilities: HashMap<Capability, f32>,
    /// Cost in USD per 1000 tokens
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
}

impl ModelProfile {
    pub fn new(id: impl Into<ModelId>) -> Self {
        let id = id.into();
        Self {
            display_name: id.to_string(),
            id,
            provider: String::new(),
            capabilities: HashMap::new(),
            cost_per_1k_tokens: 0.0,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_capability(mut self, capability: Capability, score: f32) -> Self {
        self.capabilities.insert(capability, score.clamp(0.0, 1.0));
        self
    }

    pub fn with_cost(mut self, cost_per_1k_tokens: f64) -> Self {
        self.cost_per_1k_tokens = cost_per_1k_tokens.max(0.0);
        self
    }

    /// Force every score into [0, 1] and the cost to a non-negative value.
    /// Profiles deserialized from TOML or the wire skip the builder clamps.
    /// Returns the capabilities that had to be adjusted.
    fn normalize(&mut self) -> Vec<Capability> {
        let mut adjusted = Vec::new();
        for (capability, score) in self.capabilities.iter_mut() {
            let fixed = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };
            if fixed != *score {
                adjusted.push(*capability);
                *score = fixed;
            }
        }
        if !self.cost_per_1k_tokens.is_finite() || self.cost_per_1k_tokens < 0.0 {
            self.cost_per_1k_tokens = 0.0;
        }
        adjusted.sort();
        adjusted
    }

    /// Score for a specialization, 0 when not declared
    pub fn capability(&self, capability: Capability) -> f32 {
        self.capabilities.get(&capability).copied().unwrap_or(0.0)
    }
}

/// Built-in catalog used when configuration lists no models
pub fn default_catalog() -> Vec<ModelProfile> {
    use Capability::*;

    vec![
        ModelProfile::new("claude-sonnet")
            .with_provider("anthropic")
            .with_capability(Reasoning, 0.92)
            .with_capability(Writing, 0.9)
            .with_capability(Coding, 0.88)
            .with_capability(Analysis, 0.88)
            .with_capability(Safety, 0.95)
            .with_capability(Conversation, 0.85)
            .with_capability(Creativity, 0.8)
            .with_capability(Math, 0.75)
            .with_cost(0.009),
        ModelProfile::new("gpt-4o")
            .with_provider("openai")
            .with_capability(Reasoning, 0.88)
            .with_capability(Coding, 0.87)
            .with_capability(Math, 0.82)
            .with_capability(Conversation, 0.9)
            .with_capability(Creativity, 0.85)
            .with_capability(Writing, 0.85)
            .with_capability(Analysis, 0.84)
            .with_capability(Safety, 0.8)
            .with_cost(0.0075),
        ModelProfile::new("gemini-pro")
            .with_provider("google")
            .with_capability(Analysis, 0.9)
            .with_capability(Reasoning, 0.85)
            .with_capability(Math, 0.86)
            .with_capability(Writing, 0.78)
            .with_capability(Coding, 0.8)
            .with_capability(Conversation, 0.8)
            .with_capability(Creativity, 0.75)
            .with_capability(Safety, 0.8)
            .with_cost(0.005),
        ModelProfile::new("deepseek-coder")
            .with_provider("deepseek")
            .with_capability(Coding, 0.93)
            .with_capability(Math, 0.8)
            .with_capability(Reasoning, 0.72)
            .with_capability(Analysis, 0.65)
            .with_capability(Conversation, 0.45)
            .with_cost(0.0014),
        ModelProfile::new("mistral-large")
            .with_provider("mistral")
            .with_capability(Writing, 0.82)
            .with_capability(Creativity, 0.84)
            .with_capability(Conversation, 0.82)
            .with_capability(Reasoning, 0.74)
            .with_capability(Coding, 0.7)
            .with_capability(Analysis, 0.7)
            .with_cost(0.004),
        ModelProfile::new("llama-70b")
            .with_provider("meta")
            .with_capability(Conversation, 0.8)
            .with_capability(Creativity, 0.78)
            .with_capability(Writing, 0.75)
            .with_capability(Reasoning, 0.7)
            .with_capability(Coding, 0.68)
            .with_cost(0.0009),
    ]
}

/// Smoothing constants and thresholds for model health
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// EMA factor applied to the success indicator
    pub success_alpha: f32,
    /// EMA factor applied to latency samples
    pub latency_alpha: f32,
    /// Success rate at or above which a model is healthy
    pub healthy_threshold: f32,
    /// Success rate at or above which a model is degraded (below: unhealthy)
    pub degraded_threshold: f32,
    /// Latency at which the latency penalty reaches half its maximum
    pub latency_reference_ms: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            success_alpha: 0.2,
            latency_alpha: 0.3,
            healthy_threshold: 0.8,
            degraded_threshold: 0.5,
            latency_reference_ms: 2_000.0,
        }
    }
}

/// Health classification derived from the smoothed success rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Live health of a model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHealth {
    pub status: HealthStatus,
    /// EMA of call success in [0, 1]
    pub success_rate: f32,
    /// EMA of successful call latency; `None` until the first success
    pub avg_latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub last_updated: DateTime<Utc>,
}

impl ModelHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            success_rate: 1.0,
            avg_latency_ms: None,
            consecutive_failures: 0,
            last_updated: Utc::now(),
        }
    }

    /// Fold one call outcome into the averages
    pub fn record(&mut self, success: bool, latency_ms: u64, policy: &HealthPolicy) {
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate =
            policy.success_alpha * sample + (1.0 - policy.success_alpha) * self.success_rate;

        if success {
            let latency = latency_ms as f64;
            let alpha = policy.latency_alpha as f64;
            self.avg_latency_ms = Some(match self.avg_latency_ms {
                Some(avg) => alpha * latency + (1.0 - alpha) * avg,
                None => latency,
            });
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }

        self.status = if self.success_rate >= policy.healthy_threshold {
            HealthStatus::Healthy
        } else if self.success_rate >= policy.degraded_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };
        self.last_updated = Utc::now();
    }

    /// Combined health score in [0, 1]: success rate discounted by latency.
    ///
    /// The latency discount is at most 30% and reaches 15% at the policy's
    /// reference latency.
    pub fn score(&self, policy: &HealthPolicy) -> f32 {
        let latency_factor = match self.avg_latency_ms {
            Some(avg) if policy.latency_reference_ms > 0.0 => {
                1.0 - 0.3 * (avg / (avg + policy.latency_reference_ms))
            }
            _ => 1.0,
        };
        (self.success_rate * latency_factor as f32).clamp(0.0, 1.0)
    }
}

/// Usage counters for a model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub calls: u64,
    pub failures: u64,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

/// A registered model: profile, health and usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub profile: ModelProfile,
    pub health: ModelHealth,
    pub usage: ModelUsage,
}

impl Model {
    pub fn new(profile: ModelProfile) -> Self {
        Self {
            profile,
            health: ModelHealth::healthy(),
            usage: ModelUsage::default(),
        }
    }

    pub fn id(&self) -> &ModelId {
        &self.profile.id
    }

    pub fn capability(&self, capability: Capability) -> f32 {
        self.profile.capability(capability)
    }

}

/// Shared reference to ModelRegistry
pub type SharedModelRegistry = Arc<ModelRegistry>;

/// Registry of all known models.
///
/// A single lock guards the map so concurrent call completions never lose
/// an update; snapshots are returned by value.
pub struct ModelRegistry {
    entries: RwLock<BTreeMap<ModelId, Model>>,
    policy: HealthPolicy,
}

impl ModelRegistry {
    /// Create an empty registry
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            policy,
        }
    }

    /// Create a registry pre-populated with profiles
    pub fn from_profiles(profiles: Vec<ModelProfile>, policy: HealthPolicy) -> Self {
        let registry = Self::new(policy);
        for profile in profiles {
            registry.register(profile);
        }
        registry
    }

    /// Create a shared reference to this registry
    pub fn shared(self) -> SharedModelRegistry {
        Arc::new(self)
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Register a model. Existing entries keep their health and usage; only
    /// the profile is refreshed. Scores outside [0, 1] are clamped. Returns
    /// true when the model is new.
    pub fn register(&self, mut profile: ModelProfile) -> bool {
        let adjusted = profile.normalize();
        if !adjusted.is_empty() {
            warn!(model = %profile.id, ?adjusted, "Capability scores clamped to [0, 1]");
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(&profile.id) {
            Some(existing) => {
                debug!(model = %profile.id, "Refreshing model profile");
                existing.profile = profile;
                false
            }
            None => {
                info!(model = %profile.id, provider = %profile.provider, "Model registered");
                entries.insert(profile.id.clone(), Model::new(profile));
                true
            }
        }
    }

    pub fn contains(&self, model: &ModelId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(model)
    }

    /// Snapshot of one model
    pub fn get(&self, model: &ModelId) -> Option<Model> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model)
            .cloned()
    }

    /// Snapshot of every model, ordered by id
    pub fn snapshot(&self) -> Vec<Model> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<ModelId> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Health score of a model (0 for unknown models)
    pub fn health_score(&self, model: &ModelId) -> f32 {
        self.get(model)
            .map(|m| m.health.score(&self.policy))
            .unwrap_or(0.0)
    }

    /// Fold a finished call into health and usage. Returns the updated
    /// health, or `None` for an unknown model.
    pub fn record_result(&self, result: &ModelResult) -> Option<ModelHealth> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get_mut(&result.model_id) else {
            warn!(model = %result.model_id, "Result for unregistered model ignored");
            return None;
        };

        let previous = entry.health.status;
        entry
            .health
            .record(result.success, result.latency_ms, &self.policy);

        entry.usage.calls += 1;
        if !result.success {
            entry.usage.failures += 1;
        }
        entry.usage.tokens_used += u64::from(result.tokens_used);
        entry.usage.cost_usd +=
            f64::from(result.tokens_used) / 1000.0 * entry.profile.cost_per_1k_tokens;

        if previous != entry.health.status {
            info!(
                model = %result.model_id,
                from = ?previous,
                to = ?entry.health.status,
                success_rate = entry.health.success_rate,
                "Model health changed"
            );
        }

        Some(entry.health.clone())
    }

}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::from_profiles(default_catalog(), HealthPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FailureKind, ModelFailure};

    fn ok(model: &str, latency_ms: u64, tokens: u32) -> ModelResult {
        ModelResult::success(
            "run".to_string(),
            ModelId::from(model),
            "answer".to_string(),
            0.8,
            tokens,
            latency_ms,
        )
    }

    fn failed(model: &str) -> ModelResult {
        ModelResult::failure(
            "run".to_string(),
            ModelId::from(model),
            ModelFailure::new(FailureKind::Backend, "500"),
            10,
        )
    }

    #[test]
    fn test_default_registry_populated() {
        let registry = ModelRegistry::default();
        assert_eq!(registry.len(), default_catalog().len());
        assert!(registry.contains(&ModelId::from("claude-sonnet")));
        assert!(registry.contains(&ModelId::from("deepseek-coder")));
    }

    #[test]
    fn test_register_keeps_health() {
        let registry = ModelRegistry::new(HealthPolicy::default());
        assert!(registry.register(ModelProfile::new("a")));
        registry.record_result(&failed("a"));

        let refreshed = ModelProfile::new("a").with_capability(Capability::Coding, 0.9);
        assert!(!registry.register(refreshed));

        let model = registry.get(&ModelId::from("a")).unwrap();
        assert_eq!(model.capability(Capability::Coding), 0.9);
        assert_eq!(model.usage.failures, 1);
    }

    #[test]
    fn test_health_decays_and_recovers() {
        let policy = HealthPolicy::default();
        let mut health = ModelHealth::healthy();

        for _ in 0..4 {
            health.record(false, 0, &policy);
        }
        // 0.8^4 = 0.4096
        assert!((health.success_rate - 0.4096).abs() < 1e-4);
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.consecutive_failures, 4);

        for _ in 0..10 {
            health.record(true, 100, &policy);
        }
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn test_latency_ema() {
        let policy = HealthPolicy::default();
        let mut health = ModelHealth::healthy();
        health.record(true, 1000, &policy);
        assert_eq!(health.avg_latency_ms, Some(1000.0));
        health.record(true, 2000, &policy);
        // 0.3 * 2000 + 0.7 * 1000
        assert!((health.avg_latency_ms.unwrap() - 1300.0).abs() < 1e-3);
    }

    #[test]
    fn test_health_score_latency_discount() {
        let policy = HealthPolicy::default();
        let mut health = ModelHealth::healthy();
        assert_eq!(health.score(&policy), 1.0);

        health.avg_latency_ms = Some(policy.latency_reference_ms);
        assert!((health.score(&policy) - 0.85).abs() < 1e-4);
    }

    #[test]
    fn test_usage_counters() {
        let registry = ModelRegistry::new(HealthPolicy::default());
        registry.register(ModelProfile::new("a").with_cost(0.01));

        registry.record_result(&ok("a", 100, 2000));
        registry.record_result(&failed("a"));

        let model = registry.get(&ModelId::from("a")).unwrap();
        assert_eq!(model.usage.calls, 2);
        assert_eq!(model.usage.failures, 1);
        assert_eq!(model.usage.tokens_used, 2000);
        assert!((model.usage.cost_usd - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_ignored() {
        let registry = ModelRegistry::new(HealthPolicy::default());
        assert!(registry.record_result(&ok("ghost", 1, 1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_clamps_deserialized_scores() {
        let profile: ModelProfile = serde_json::from_str(
            r#"{"id": "big", "capabilities": {"coding": 1.6, "math": -0.4, "writing": 0.5}, "cost_per_1k_tokens": -1.0}"#,
        )
        .unwrap();
        assert_eq!(profile.capability(Capability::Coding), 1.6);

        let registry = ModelRegistry::new(HealthPolicy::default());
        registry.register(profile);

        let model = registry.get(&ModelId::from("big")).unwrap();
        assert_eq!(model.capability(Capability::Coding), 1.0);
        assert_eq!(model.capability(Capability::Math), 0.0);
        assert_eq!(model.capability(Capability::Writing), 0.5);
        assert_eq!(model.profile.cost_per_1k_tokens, 0.0);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let registry = Arc::new(ModelRegistry::new(HealthPolicy::default()));
        registry.register(ModelProfile::new("a"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        registry.record_result(&ok("a", 10, 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let model = registry.get(&ModelId::from("a")).unwrap();
        assert_eq!(model.usage.calls, 800);
        assert_eq!(model.usage.tokens_used, 800);
    }
}
