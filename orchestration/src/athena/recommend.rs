//! Model and strategy recommendation
//!
//! Every registered model is scored as `capability fit × live health`.
//! Models are added in score order while the marginal gain
//! `score_i × Π(1 − score_j)` over already selected models stays above the
//! cutoff. The strategy comes from a fixed table keyed by complexity tier
//! and the number of selected models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

use super::analysis::{ComplexityTier, PromptAnalysis};
use crate::registry::{HealthStatus, Model, ModelRegistry};
use crate::state::{ModelId, OrchestrationRequest, Strategy};

/// Errors from recommendation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecommendError {
    #[error("Model registry is empty")]
    EmptyRegistry,

    #[error("No viable model: {0}")]
    NoViableModels(String),
}

/// Tuning for model selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationPolicy {
    /// Minimum marginal gain for adding another model
    pub marginal_cutoff: f32,
    pub max_models: usize,
    /// Models with a lower capability fit are excluded
    pub min_fit: f32,
}

impl Default for RecommendationPolicy {
    fn default() -> Self {
        Self {
            marginal_cutoff: 0.08,
            max_models: 4,
            min_fit: 0.15,
        }
    }
}

/// One step of the reasoning behind a recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    /// `category`, `include`, `exclude` or `strategy`
    pub step: String,
    pub detail: String,
}

impl ReasoningStep {
    fn new(step: &str, detail: impl Into<String>) -> Self {
        Self {
            step: step.to_string(),
            detail: detail.into(),
        }
    }
}

/// Proposed models, strategy and weights for a prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub prompt: String,
    pub analysis: PromptAnalysis,
    /// Selected models, best first
    pub models: Vec<ModelId>,
    pub strategy: Strategy,
    pub weights: BTreeMap<ModelId, f32>,
    pub model_confidence: BTreeMap<ModelId, f32>,
    pub overall_confidence: f32,
    pub reasoning: Vec<ReasoningStep>,
    pub created_at: DateTime<Utc>,
}

impl Recommendation {
    /// Request that applies this recommendation
    pub fn to_request(&self) -> OrchestrationRequest {
        OrchestrationRequest::new(self.prompt.clone(), self.models.clone(), self.strategy)
            .with_weights(self.weights.iter().map(|(m, w)| (m.clone(), *w)).collect())
            .with_category(self.analysis.category)
    }
}

#[derive(Debug, Clone)]
struct Scored {
    model: ModelId,
    fit: f32,
    health: f32,
    score: f32,
}

/// Strategy for a complexity tier and model count
pub fn strategy_for(complexity: ComplexityTier, count: usize) -> Strategy {
    use ComplexityTier::*;
    use Strategy::*;

    match (complexity, count) {
        (_, 0 | 1) => Adaptive,
        (Simple, _) => Parallel,
        (Moderate, 2) => Parallel,
        (Moderate, _) => Consensus,
        (Complex, 2) => Cascade,
        (Complex, _) => Consensus,
        (Expert, 2 | 3) => Cascade,
        (Expert, _) => Consensus,
    }
}

/// Capability fit of a model for the analysis' required capabilities:
/// importance-weighted mean of the model's scores
pub fn capability_fit(model: &Model, analysis: &PromptAnalysis) -> f32 {
    let total: f32 = analysis.required_capabilities.values().sum();
    if total <= 0.0 {
        return 0.0;
    }
    analysis
        .required_capabilities
        .iter()
        .map(|(capability, importance)| importance * model.capability(*capability))
        .sum::<f32>()
        / total
}

/// Scores models and assembles recommendations
#[derive(Debug, Clone, Default)]
pub struct Recommender {
    policy: RecommendationPolicy,
}

impl Recommender {
    pub fn new(policy: RecommendationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RecommendationPolicy {
        &self.policy
    }

    pub fn recommend(
        &self,
        prompt: &str,
        analysis: &PromptAnalysis,
        registry: &ModelRegistry,
    ) -> Result<Recommendation, RecommendError> {
        let models = registry.snapshot();
        if models.is_empty() {
            return Err(RecommendError::EmptyRegistry);
        }

        let mut reasoning = vec![ReasoningStep::new(
            "category",
            format!(
                "{}{}",
                analysis.summary(),
                if analysis.in_taxonomy {
                    ""
                } else {
                    " (no taxonomy signal, generic)"
                }
            ),
        )];

        let policy = registry.policy();
        let mut viable = Vec::new();
        for model in &models {
            let fit = capability_fit(model, analysis);
            if model.health.status == HealthStatus::Unhealthy {
                reasoning.push(ReasoningStep::new(
                    "exclude",
                    format!(
                        "{}: unhealthy (success rate {:.2})",
                        model.id(),
                        model.health.success_rate
                    ),
                ));
                continue;
            }
            if fit < self.policy.min_fit {
                reasoning.push(ReasoningStep::new(
                    "exclude",
                    format!("{}: fit {:.2} below {:.2}", model.id(), fit, self.policy.min_fit),
                ));
                continue;
            }
            let health = model.health.score(policy);
            viable.push(Scored {
                model: model.id().clone(),
                fit,
                health,
                score: fit * health,
            });
        }

        viable.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.model.cmp(&b.model))
        });

        // Diminishing returns: the gain only shrinks down the ranking, so the
        // first rejection ends selection
        let mut selected: Vec<Scored> = Vec::new();
        let mut uncovered = 1.0_f32;
        for candidate in viable {
            let gain = candidate.score * uncovered;
            if selected.len() < self.policy.max_models && gain >= self.policy.marginal_cutoff {
                reasoning.push(ReasoningStep::new(
                    "include",
                    format!(
                        "{}: fit {:.2} × health {:.2} = {:.2}, gain {:.3}",
                        candidate.model, candidate.fit, candidate.health, candidate.score, gain
                    ),
                ));
                uncovered *= 1.0 - candidate.score;
                selected.push(candidate);
            } else {
                let why = if selected.len() >= self.policy.max_models {
                    format!("limit of {} models reached", self.policy.max_models)
                } else {
                    format!(
                        "gain {:.3} below cutoff {:.3}",
                        gain, self.policy.marginal_cutoff
                    )
                };
                reasoning.push(ReasoningStep::new(
                    "exclude",
                    format!("{}: {}", candidate.model, why),
                ));
            }
        }

        if selected.is_empty() {
            return Err(RecommendError::NoViableModels(format!(
                "no model fits {} with a usable score",
                analysis.category
            )));
        }

        let strategy = strategy_for(analysis.complexity, selected.len());
        reasoning.push(ReasoningStep::new(
            "strategy",
            format!(
                "{} for {} prompt with {} model(s)",
                strategy,
                analysis.complexity,
                selected.len()
            ),
        ));

        let top = selected[0].score;
        let weights: BTreeMap<ModelId, f32> = selected
            .iter()
            .map(|s| (s.model.clone(), s.score / top))
            .collect();
        let model_confidence: BTreeMap<ModelId, f32> = selected
            .iter()
            .map(|s| (s.model.clone(), s.score))
            .collect();
        let overall_confidence = overall_confidence(&weights, &model_confidence, analysis.certainty);

        debug!(
            models = selected.len(),
            %strategy,
            overall_confidence,
            "Recommendation assembled"
        );

        Ok(Recommendation {
            id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.to_string(),
            analysis: analysis.clone(),
            models: selected.into_iter().map(|s| s.model).collect(),
            strategy,
            weights,
            model_confidence,
            overall_confidence,
            reasoning,
            created_at: Utc::now(),
        })
    }
}

/// Weighted mean of per-model confidence, scaled by `0.5 + 0.5 × certainty`
pub fn overall_confidence(
    weights: &BTreeMap<ModelId, f32>,
    confidence: &BTreeMap<ModelId, f32>,
    certainty: f32,
) -> f32 {
    let total: f32 = weights.values().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let mean = weights
        .iter()
        .map(|(model, w)| w * confidence.get(model).copied().unwrap_or(0.0))
        .sum::<f32>()
        / total;
    (mean * (0.5 + 0.5 * certainty.clamp(0.0, 1.0))).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::athena::analysis::PromptAnalyzer;
    use crate::registry::{HealthPolicy, ModelProfile};
    use crate::state::{Capability, ModelFailure, ModelResult, FailureKind};

    fn registry() -> ModelRegistry {
        ModelRegistry::from_profiles(
            vec![
                ModelProfile::new("coder").with_capability(Capability::Coding, 0.95),
                ModelProfile::new("generalist")
                    .with_capability(Capability::Coding, 0.7)
                    .with_capability(Capability::Writing, 0.7),
                ModelProfile::new("poet").with_capability(Capability::Creativity, 0.9),
            ],
            HealthPolicy::default(),
        )
    }

    fn coding_analysis() -> PromptAnalysis {
        PromptAnalyzer::new().analyze("Debug this Rust function, it fails to compile")
    }

    #[test]
    fn test_discovered_scores_above_one_stay_bounded() {
        let oversized: ModelProfile =
            serde_json::from_str(r#"{"id": "big", "capabilities": {"coding": 1.6}}"#).unwrap();
        let registry = ModelRegistry::from_profiles(
            vec![
                oversized,
                ModelProfile::new("good").with_capability(Capability::Coding, 0.8),
            ],
            HealthPolicy::default(),
        );

        let rec = Recommender::default()
            .recommend("p", &coding_analysis(), &registry)
            .unwrap();

        assert_eq!(rec.models[0], ModelId::from("big"));
        assert!(rec.model_confidence.values().all(|c| (0.0..=1.0).contains(c)));
        assert!(rec.overall_confidence <= 1.0);
        assert!(!rec
            .reasoning
            .iter()
            .any(|s| s.detail.contains("gain -")));
    }

    #[test]
    fn test_strategy_table() {
        use ComplexityTier::*;
        assert_eq!(strategy_for(Expert, 1), Strategy::Adaptive);
        assert_eq!(strategy_for(Simple, 3), Strategy::Parallel);
        assert_eq!(strategy_for(Moderate, 2), Strategy::Parallel);
        assert_eq!(strategy_for(Moderate, 3), Strategy::Consensus);
        assert_eq!(strategy_for(Complex, 2), Strategy::Cascade);
        assert_eq!(strategy_for(Complex, 4), Strategy::Consensus);
        assert_eq!(strategy_for(Expert, 3), Strategy::Cascade);
        assert_eq!(strategy_for(Expert, 4), Strategy::Consensus);
    }

    #[test]
    fn test_selects_best_fit_first_and_excludes_poor_fit() {
        let rec = Recommender::default()
            .recommend("p", &coding_analysis(), &registry())
            .unwrap();

        assert_eq!(rec.models[0], ModelId::new("coder"));
        assert!(!rec.models.contains(&ModelId::new("poet")));
        assert_eq!(rec.weights[&ModelId::new("coder")], 1.0);
        assert!(rec
            .reasoning
            .iter()
            .any(|s| s.step == "exclude" && s.detail.starts_with("poet")));
        assert!(rec.reasoning.iter().any(|s| s.step == "strategy"));
    }

    #[test]
    fn test_diminishing_returns_bounds_selection() {
        // coder 0.95 leaves 0.05 uncovered; generalist gain 0.7 × 0.05 < 0.08
        let rec = Recommender::default()
            .recommend("p", &coding_analysis(), &registry())
            .unwrap();
        assert_eq!(rec.models, vec![ModelId::new("coder")]);
        assert_eq!(rec.strategy, Strategy::Adaptive);
    }

    #[test]
    fn test_unhealthy_models_are_excluded() {
        let registry = registry();
        for _ in 0..10 {
            registry.record_result(&ModelResult::failure(
                "r".into(),
                ModelId::new("coder"),
                ModelFailure::new(FailureKind::Backend, "down"),
                10,
            ));
        }
        let rec = Recommender::default()
            .recommend("p", &coding_analysis(), &registry)
            .unwrap();
        assert_eq!(rec.models[0], ModelId::new("generalist"));
    }

    #[test]
    fn test_empty_registry() {
        let registry = ModelRegistry::from_profiles(vec![], HealthPolicy::default());
        let err = Recommender::default()
            .recommend("p", &coding_analysis(), &registry)
            .unwrap_err();
        assert_eq!(err, RecommendError::EmptyRegistry);
    }

    #[test]
    fn test_no_viable_models() {
        let registry = ModelRegistry::from_profiles(
            vec![ModelProfile::new("poet").with_capability(Capability::Creativity, 0.9)],
            HealthPolicy::default(),
        );
        let err = Recommender::default()
            .recommend("p", &coding_analysis(), &registry)
            .unwrap_err();
        assert!(matches!(err, RecommendError::NoViableModels(_)));
    }

    #[test]
    fn test_overall_confidence_formula() {
        let weights = BTreeMap::from([(ModelId::new("a"), 1.0), (ModelId::new("b"), 0.5)]);
        let conf = BTreeMap::from([(ModelId::new("a"), 0.8), (ModelId::new("b"), 0.4)]);
        // mean = (0.8 + 0.2) / 1.5, scaled by 0.5 + 0.5 × 0.6
        let expected = (1.0 / 1.5) * 0.8;
        assert!((overall_confidence(&weights, &conf, 0.6) - expected).abs() < 1e-6);
    }
}
