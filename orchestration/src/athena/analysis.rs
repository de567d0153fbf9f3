//! Prompt analysis: category, complexity tier and required capabilities
//!
//! A keyword lexicon scores each category of the taxonomy; code fences and
//! arithmetic expressions add extra weight to coding and math. Analysis always
//! completes: a prompt with no signal is treated as generic conversation with
//! low certainty.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::state::Capability;

static CODE_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```|\bfn\s+\w+\s*\(|\bdef\s+\w+\s*\(").expect("CODE_FENCE_RE regex should compile")
});

static MATH_EXPR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+(?:\.\d+)?\s*[-+*/^=]\s*\d+|[∫∑√π]|\b[a-z]\s*\^\s*\d")
        .expect("MATH_EXPR_RE regex should compile")
});

/// Certainty assigned to prompts outside the taxonomy
const GENERIC_CERTAINTY: f32 = 0.3;

/// Single-word keywords and phrases per category
const LEXICON: &[(Capability, &[&str])] = &[
    (
        Capability::Reasoning,
        &[
            "why", "reason", "logic", "logical", "deduce", "infer", "puzzle", "riddle",
            "argument", "implies", "therefore", "cause", "explain why", "step by step",
        ],
    ),
    (
        Capability::Creativity,
        &[
            "story", "poem", "creative", "imagine", "invent", "brainstorm", "fiction",
            "lyrics", "character", "plot", "novel", "idea", "ideas",
        ],
    ),
    (
        Capability::Coding,
        &[
            "code", "function", "bug", "debug", "compile", "compiler", "rust", "python",
            "javascript", "typescript", "api", "refactor", "algorithm", "implement",
            "struct", "class", "sql", "regex", "async", "stack trace", "unit test",
        ],
    ),
    (
        Capability::Analysis,
        &[
            "analyze", "analyse", "analysis", "compare", "comparison", "evaluate",
            "assess", "data", "trend", "trends", "metrics", "pros", "cons", "trade-off",
            "tradeoff", "review", "summarize", "summarise",
        ],
    ),
    (
        Capability::Writing,
        &[
            "write", "essay", "article", "email", "letter", "draft", "rewrite", "edit",
            "proofread", "grammar", "tone", "blog", "paragraph", "headline",
        ],
    ),
    (
        Capability::Math,
        &[
            "math", "equation", "solve", "integral", "derivative", "calculate", "compute",
            "probability", "proof", "prove", "theorem", "matrix", "algebra", "geometry",
            "statistics",
        ],
    ),
    (
        Capability::Conversation,
        &[
            "hello", "hi", "hey", "thanks", "thank", "chat", "how are you", "opinion",
            "recommend", "advice", "favorite",
        ],
    ),
    (
        Capability::Safety,
        &[
            "safe", "safety", "harm", "harmful", "ethical", "ethics", "illegal", "privacy",
            "bias", "dangerous", "risk", "risks", "consent", "abuse",
        ],
    ),
];

/// Terms that push a prompt towards a higher complexity tier
const COMPLEXITY_MARKERS: &[&str] = &[
    "optimize", "optimise", "architecture", "distributed", "concurrency", "scalable",
    "trade-off", "tradeoff", "rigorous", "formal", "prove", "multi-step", "step by step",
    "in depth", "in-depth", "comprehensive", "edge cases", "production",
];

/// Complexity tier of a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Simple,
    Moderate,
    Complex,
    Expert,
}

impl ComplexityTier {
    pub fn from_score(score: f32) -> Self {
        if score < 0.2 {
            ComplexityTier::Simple
        } else if score < 0.4 {
            ComplexityTier::Moderate
        } else if score < 0.65 {
            ComplexityTier::Complex
        } else {
            ComplexityTier::Expert
        }
    }
}

impl std::fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComplexityTier::Simple => "simple",
            ComplexityTier::Moderate => "moderate",
            ComplexityTier::Complex => "complex",
            ComplexityTier::Expert => "expert",
        };
        f.write_str(s)
    }
}

/// Result of analyzing a prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptAnalysis {
    pub category: Capability,
    pub secondary: Option<Capability>,
    pub complexity: ComplexityTier,
    /// Raw complexity in [0, 1]
    pub complexity_score: f32,
    /// Capability → importance in (0, 1]; the primary category is 1.0
    pub required_capabilities: BTreeMap<Capability, f32>,
    /// Certainty of the category in [0, 1]
    pub certainty: f32,
    /// False when no taxonomy signal was found
    pub in_taxonomy: bool,
    pub word_count: usize,
}

impl PromptAnalysis {
    /// Compact summary for logs and traces
    pub fn summary(&self) -> String {
        let secondary = self
            .secondary
            .map(|c| format!(" (+{})", c))
            .unwrap_or_default();
        format!(
            "category={}{} complexity={} ({:.2}) certainty={:.2}",
            self.category, secondary, self.complexity, self.complexity_score, self.certainty
        )
    }
}

/// Heuristic prompt analyzer
#[derive(Debug, Clone, Default)]
pub struct PromptAnalyzer;

impl PromptAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, prompt: &str) -> PromptAnalysis {
        let text = prompt.to_lowercase();
        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric() && c != '-')
            .filter(|w| !w.is_empty())
            .collect();
        let contains = |kw: &str| {
            if kw.contains(' ') {
                text.contains(kw)
            } else {
                words.iter().any(|w| *w == kw)
            }
        };

        // ── Category scoring ─────────────────────────────────────────────────
        let mut hits: BTreeMap<Capability, f32> = BTreeMap::new();
        for (capability, keywords) in LEXICON {
            let count = keywords.iter().filter(|kw| contains(kw)).count();
            if count > 0 {
                hits.insert(*capability, count as f32);
            }
        }
        let has_code = CODE_FENCE_RE.is_match(prompt);
        if has_code {
            *hits.entry(Capability::Coding).or_insert(0.0) += 2.0;
        }
        if MATH_EXPR_RE.is_match(&text) {
            *hits.entry(Capability::Math).or_insert(0.0) += 2.0;
        }

        // ── Complexity ───────────────────────────────────────────────────────
        let mut complexity_score: f32 = match words.len() {
            0..=11 => 0.0,
            12..=39 => 0.15,
            40..=119 => 0.3,
            _ => 0.45,
        };
        let markers = COMPLEXITY_MARKERS.iter().filter(|m| contains(m)).count();
        complexity_score += (markers as f32 * 0.1).min(0.4);
        if has_code {
            complexity_score += 0.1;
        }
        if prompt.matches('?').count() > 1 {
            complexity_score += 0.1;
        }
        if hits.len() >= 3 {
            complexity_score += 0.1;
        }
        let complexity_score = complexity_score.clamp(0.0, 1.0);
        let complexity = ComplexityTier::from_score(complexity_score);

        if hits.is_empty() {
            return PromptAnalysis {
                category: Capability::Conversation,
                secondary: None,
                complexity,
                complexity_score,
                required_capabilities: BTreeMap::from([(Capability::Conversation, 1.0)]),
                certainty: GENERIC_CERTAINTY,
                in_taxonomy: false,
                word_count: words.len(),
            };
        }

        // Highest hit count wins; taxonomy order breaks ties
        let mut ranked: Vec<(Capability, f32)> = hits.iter().map(|(c, h)| (*c, *h)).collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        let (category, top) = ranked[0];
        let second = ranked.get(1).map(|(_, h)| *h).unwrap_or(0.0);

        let separation = (top - second) / top;
        let strength = (top / 3.0).min(1.0);
        let certainty = (0.35 + 0.35 * separation + 0.3 * strength).clamp(0.0, 1.0);

        let required_capabilities = ranked
            .iter()
            .map(|(c, h)| {
                let importance = if *c == category { 1.0 } else { 0.4 + 0.6 * h / top };
                (*c, importance.min(1.0))
            })
            .collect();

        PromptAnalysis {
            category,
            secondary: ranked.get(1).map(|(c, _)| *c),
            complexity,
            complexity_score,
            required_capabilities,
            certainty,
            in_taxonomy: true,
            word_count: words.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coding_prompt() {
        let analysis = PromptAnalyzer::new()
            .analyze("Can you debug this Rust function? It fails to compile:\n```rust\nfn main() {}\n```");
        assert_eq!(analysis.category, Capability::Coding);
        assert!(analysis.in_taxonomy);
        assert!(analysis.certainty > 0.6);
        assert_eq!(analysis.required_capabilities[&Capability::Coding], 1.0);
    }

    #[test]
    fn test_math_expression_detected() {
        let analysis = PromptAnalyzer::new().analyze("What is 12 * 7 + 3?");
        assert_eq!(analysis.category, Capability::Math);
    }

    #[test]
    fn test_out_of_taxonomy_is_generic_conversation() {
        let analysis = PromptAnalyzer::new().analyze("zxqv plorb");
        assert_eq!(analysis.category, Capability::Conversation);
        assert!(!analysis.in_taxonomy);
        assert!((analysis.certainty - GENERIC_CERTAINTY).abs() < 1e-6);
        assert_eq!(analysis.complexity, ComplexityTier::Simple);
    }

    #[test]
    fn test_mixed_prompt_has_lower_certainty() {
        let analyzer = PromptAnalyzer::new();
        let focused = analyzer.analyze("Write an essay draft, then edit the grammar and tone");
        let mixed = analyzer.analyze("Write code to analyze data");
        assert!(focused.certainty > mixed.certainty);
        assert!(mixed.secondary.is_some());
    }

    #[test]
    fn test_complexity_grows_with_markers() {
        let analyzer = PromptAnalyzer::new();
        let simple = analyzer.analyze("hello there");
        let expert = analyzer.analyze(
            "Design a distributed, scalable architecture for a production trading system. \
             Discuss concurrency trade-offs in depth, cover edge cases, and give a rigorous \
             argument for correctness? What would you optimize first? Write code and analyze the data.",
        );
        assert_eq!(simple.complexity, ComplexityTier::Simple);
        assert_eq!(expert.complexity, ComplexityTier::Expert);
    }
}
