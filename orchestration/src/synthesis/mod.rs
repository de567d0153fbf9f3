//! Synthesis stage: merges accepted model outputs into one answer
//!
//! Each strategy has its own merge rule:
//!
//! | Strategy  | Rule                                                        |
//! |-----------|-------------------------------------------------------------|
//! | parallel  | top-ranked answer plus novel sentences from the others      |
//! | consensus | representative of the majority similarity cluster           |
//! | adaptive  | the single successful answer                                |
//! | cascade   | the last model's answer, else the best earlier answer       |
//!
//! Ranking is `weight * confidence` descending with request order breaking
//! ties. Aggregate confidence is the weighted mean over the contributors.

pub mod similarity;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

use crate::state::{ModelId, ModelResult, OrchestrationRequest, Strategy};

pub use similarity::{jaccard, similarity, split_sentences, word_set};

/// Errors from synthesis
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SynthesisError {
    #[error("No viable results: {failed} model(s) failed ({summary})")]
    NoViableResults { failed: usize, summary: String },
}

/// Result type for synthesis
pub type SynthesisResult<T> = Result<T, SynthesisError>;

/// Merge thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Minimum similarity for a result to join a consensus cluster
    pub similarity_threshold: f32,
    /// Sentences at or above this similarity to included text are dropped
    /// from a weighted merge
    pub supplement_threshold: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            supplement_threshold: 0.5,
        }
    }
}

/// How the final answer was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    WeightedMerge,
    MajorityCluster,
    /// Consensus had no majority
    HighestWeighted,
    SingleBest,
    ChainFinal,
    /// The last cascade model failed
    ChainFallback,
}

/// Synthesized answer for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub content: String,
    pub confidence: f32,
    pub contributors: Vec<ModelId>,
    pub method: MergeMethod,
    pub strategy: Strategy,
    /// Share of successful results in the majority cluster (consensus only)
    pub agreement: Option<f32>,
    pub succeeded: usize,
    pub failed: usize,
}

impl Synthesis {
    pub fn is_partial(&self) -> bool {
        self.failed > 0
    }
}

/// A successful result with its effective weight and request position
#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    result: &'a ModelResult,
    weight: f32,
    position: usize,
}

impl Candidate<'_> {
    fn rank_key(&self) -> f32 {
        self.weight * self.result.confidence
    }
}

/// Merge `results` according to the request's strategy
pub fn synthesize(
    results: &[ModelResult],
    request: &OrchestrationRequest,
    config: &SynthesisConfig,
) -> SynthesisResult<Synthesis> {
    let failed = results.iter().filter(|r| !r.success).count();
    let candidates = candidates(results, request);

    if candidates.is_empty() {
        let summary = results
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.model_id, e)))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(SynthesisError::NoViableResults {
            failed,
            summary: if summary.is_empty() {
                "no results".to_string()
            } else {
                summary
            },
        });
    }

    let succeeded = candidates.len();
    let (content, contributors, method, agreement) = match request.strategy {
        Strategy::Parallel => weighted_merge(&candidates, config),
        Strategy::Consensus => consensus(&candidates, config),
        Strategy::Adaptive => single_best(&candidates),
        Strategy::Cascade => chain(results, &candidates),
    };

    let confidence = weighted_confidence(&contributors);
    debug!(
        strategy = %request.strategy,
        ?method,
        succeeded,
        failed,
        confidence,
        "Synthesized"
    );

    Ok(Synthesis {
        content,
        confidence,
        contributors: contributors.iter().map(|c| c.result.model_id.clone()).collect(),
        method,
        strategy: request.strategy,
        agreement,
        succeeded,
        failed,
    })
}

/// Successful results with effective weights. Falls back to uniform weights
/// when every supplied weight is zero.
fn candidates<'a>(results: &'a [ModelResult], request: &OrchestrationRequest) -> Vec<Candidate<'a>> {
    let mut candidates: Vec<Candidate<'a>> = results
        .iter()
        .filter(|r| r.success)
        .map(|r| Candidate {
            result: r,
            weight: request.weight_for(&r.model_id).max(0.0),
            position: request.position_of(&r.model_id),
        })
        .collect();

    let total: f32 = candidates.iter().map(|c| c.weight).sum();
    if total <= 0.0 {
        for c in &mut candidates {
            c.weight = 1.0;
        }
    }
    candidates
}

fn by_rank(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    b.rank_key()
        .partial_cmp(&a.rank_key())
        .unwrap_or(Ordering::Equal)
        .then(a.position.cmp(&b.position))
}

fn ranked<'a>(candidates: &[Candidate<'a>]) -> Vec<Candidate<'a>> {
    let mut ranked = candidates.to_vec();
    ranked.sort_by(by_rank);
    ranked
}

/// Weighted mean confidence, renormalized over `contributors`
fn weighted_confidence(contributors: &[Candidate<'_>]) -> f32 {
    let total: f32 = contributors.iter().map(|c| c.weight).sum();
    if total <= 0.0 {
        let n = contributors.len().max(1) as f32;
        return contributors.iter().map(|c| c.result.confidence).sum::<f32>() / n;
    }
    contributors
        .iter()
        .map(|c| c.weight * c.result.confidence)
        .sum::<f32>()
        / total
}

type Merged<'a> = (String, Vec<Candidate<'a>>, MergeMethod, Option<f32>);

fn weighted_merge<'a>(candidates: &[Candidate<'a>], config: &SynthesisConfig) -> Merged<'a> {
    let ranked = ranked(candidates);
    let primary = &ranked[0].result.content;

    let mut included: Vec<String> = split_sentences(primary);
    let mut supplements = Vec::new();
    for candidate in ranked.iter().skip(1) {
        for sentence in split_sentences(&candidate.result.content) {
            let best = included
                .iter()
                .map(|s| similarity(s, &sentence))
                .fold(0.0_f32, f32::max);
            if best < config.supplement_threshold {
                included.push(sentence.clone());
                supplements.push(sentence);
            }
        }
    }

    let content = if supplements.is_empty() {
        primary.clone()
    } else {
        let points = supplements
            .iter()
            .map(|s| format!("- {}", s))
            .collect::<Vec<_>>()
            .join("\n");
        format!("{}\n\nAdditional points:\n{}", primary.trim_end(), points)
    };

    (content, ranked, MergeMethod::WeightedMerge, None)
}

fn consensus<'a>(candidates: &[Candidate<'a>], config: &SynthesisConfig) -> Merged<'a> {
    let ranked = ranked(candidates);

    // Greedy clustering: join the first cluster whose representative is close enough
    let mut clusters: Vec<Vec<Candidate<'a>>> = Vec::new();
    for candidate in &ranked {
        let home = clusters.iter_mut().find(|cluster| {
            similarity(&cluster[0].result.content, &candidate.result.content)
                >= config.similarity_threshold
        });
        match home {
            Some(cluster) => cluster.push(*candidate),
            None => clusters.push(vec![*candidate]),
        }
    }

    // Most members, then larger total weight, then earlier cluster
    let mut majority = 0;
    for (i, cluster) in clusters.iter().enumerate().skip(1) {
        let best = &clusters[majority];
        let weight = |c: &Vec<Candidate<'_>>| c.iter().map(|m| m.weight).sum::<f32>();
        if cluster.len() > best.len()
            || (cluster.len() == best.len() && weight(cluster) > weight(best))
        {
            majority = i;
        }
    }

    let total = candidates.len();
    let members = clusters.swap_remove(majority);
    let agreement = members.len() as f32 / total as f32;
    debug!(
        clusters = clusters.len() + 1,
        majority = members.len(),
        total,
        "Consensus clustering"
    );

    if members.len() * 2 > total {
        let content = members[0].result.content.clone();
        return (content, members, MergeMethod::MajorityCluster, Some(agreement));
    }

    // No majority: highest weight, then higher confidence, then request order
    let mut fallback = candidates.to_vec();
    fallback.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(Ordering::Equal)
            .then(
                b.result
                    .confidence
                    .partial_cmp(&a.result.confidence)
                    .unwrap_or(Ordering::Equal),
            )
            .then(a.position.cmp(&b.position))
    });
    let chosen = fallback[0];
    (
        chosen.result.content.clone(),
        vec![chosen],
        MergeMethod::HighestWeighted,
        Some(agreement),
    )
}

fn single_best<'a>(candidates: &[Candidate<'a>]) -> Merged<'a> {
    let best = ranked(candidates)[0];
    (
        best.result.content.clone(),
        vec![best],
        MergeMethod::SingleBest,
        None,
    )
}

fn chain<'a>(results: &'a [ModelResult], candidates: &[Candidate<'a>]) -> Merged<'a> {
    let last_ok = results.last().filter(|r| r.success).and_then(|last| {
        candidates
            .iter()
            .find(|c| std::ptr::eq(c.result, last))
            .copied()
    });
    if let Some(last) = last_ok {
        return (
            last.result.content.clone(),
            vec![last],
            MergeMethod::ChainFinal,
            None,
        );
    }

    let best = ranked(candidates)[0];
    (
        best.result.content.clone(),
        vec![best],
        MergeMethod::ChainFallback,
        None,
    )
}
