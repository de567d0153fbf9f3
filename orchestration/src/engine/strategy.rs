//! Strategy executors: call topology per strategy
//!
//! - parallel / consensus: every model at once, joined on a `JoinSet`
//! - adaptive: best-fit model first, next candidate only on failure
//! - cascade: weight-descending chain, each call refines the last success

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::caller::{CallError, ModelCall, ModelCaller, ModelReply};
use super::run::RunContext;
use super::EngineConfig;
use crate::athena::analysis::PromptAnalyzer;
use crate::registry::SharedModelRegistry;
use crate::state::{
    Capability, ModelId, ModelResult, OrchestrationRequest, RunPhase, Strategy,
};
use crate::trace::Decision;
use crate::transport::wire::{estimate_tokens, extract_confidence};

/// Everything a strategy needs besides the run itself
pub(crate) struct StrategyEnv {
    pub(crate) caller: Arc<dyn ModelCaller>,
    pub(crate) registry: SharedModelRegistry,
    pub(crate) analyzer: PromptAnalyzer,
    pub(crate) config: EngineConfig,
}

/// Run the request's strategy until its completion condition holds
pub(crate) async fn execute(ctx: &Arc<RunContext>, env: &Arc<StrategyEnv>) {
    match ctx.request.strategy {
        Strategy::Parallel | Strategy::Consensus => fan_out(ctx, env).await,
        Strategy::Adaptive => adaptive(ctx, env).await,
        Strategy::Cascade => cascade(ctx, env).await,
    }
}

async fn fan_out(ctx: &Arc<RunContext>, env: &Arc<StrategyEnv>) {
    let mut join_set: JoinSet<Option<ModelResult>> = JoinSet::new();
    for model in ctx.request.models.clone() {
        let ctx = Arc::clone(ctx);
        let env = Arc::clone(env);
        join_set.spawn(async move { call_model(&ctx, &env, &model, None).await });
    }
    ctx.decide(Decision::engine(
        "dispatch",
        format!(
            "{} fan-out to {} model(s)",
            ctx.request.strategy,
            ctx.request.models.len()
        ),
    ));
    ctx.set_phase(RunPhase::Collecting);

    while let Some(joined) = join_set.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                warn!(run_id = %ctx.id, error = %e, "Model call task panicked");
            }
        }
    }
}

async fn adaptive(ctx: &Arc<RunContext>, env: &Arc<StrategyEnv>) {
    let (category, source) = match ctx.request.category {
        Some(category) => (category, "hint"),
        None => (env.analyzer.analyze(&ctx.request.prompt).category, "analyzer"),
    };
    let order = adaptive_order(&ctx.request, category, &env.registry);
    ctx.decide(Decision::engine(
        "dispatch",
        format!(
            "adaptive for {} ({}), candidate order: {}",
            category,
            source,
            join_ids(&order)
        ),
    ));
    ctx.set_phase(RunPhase::Collecting);

    for model in order {
        match call_model(ctx, env, &model, None).await {
            Some(result) if result.success => break,
            Some(result) => {
                debug!(run_id = %ctx.id, model = %model, kind = ?result.failure_kind(), "Adaptive candidate failed, trying next");
            }
            None => break,
        }
    }
}

async fn cascade(ctx: &Arc<RunContext>, env: &Arc<StrategyEnv>) {
    let order = cascade_order(&ctx.request);
    ctx.decide(Decision::engine(
        "dispatch",
        format!("cascade chain: {}", join_ids(&order)),
    ));
    ctx.set_phase(RunPhase::Collecting);

    let mut context: Option<String> = None;
    for model in order {
        match call_model(ctx, env, &model, context.clone()).await {
            Some(result) if result.success => context = Some(result.content),
            Some(_) => {}
            None => break,
        }
    }
}

/// Candidates by capability for `category`, then health, then weight, then
/// selection order
pub(crate) fn adaptive_order(
    request: &OrchestrationRequest,
    category: Capability,
    registry: &SharedModelRegistry,
) -> Vec<ModelId> {
    let mut scored: Vec<(ModelId, f32, f32, f32, usize)> = request
        .models
        .iter()
        .enumerate()
        .map(|(position, model)| {
            let capability = registry
                .get(model)
                .map(|m| m.capability(category))
                .unwrap_or(0.0);
            (
                model.clone(),
                capability,
                registry.health_score(model),
                request.weight_for(model),
                position,
            )
        })
        .collect();

    scored.sort_by(|a, b| {
        desc(a.1, b.1)
            .then(desc(a.2, b.2))
            .then(desc(a.3, b.3))
            .then(a.4.cmp(&b.4))
    });
    scored.into_iter().map(|(model, ..)| model).collect()
}

/// Weight-descending; ties keep selection order
pub(crate) fn cascade_order(request: &OrchestrationRequest) -> Vec<ModelId> {
    let mut order = request.models.clone();
    order.sort_by(|a, b| desc(request.weight_for(a), request.weight_for(b)));
    order
}

fn desc(a: f32, b: f32) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

fn join_ids(models: &[ModelId]) -> String {
    models
        .iter()
        .map(ModelId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Call one model under the per-call timeout and the run's cancellation.
///
/// Returns the recorded result, or `None` when the run was cancelled or the
/// result was rejected.
async fn call_model(
    ctx: &RunContext,
    env: &StrategyEnv,
    model: &ModelId,
    context: Option<String>,
) -> Option<ModelResult> {
    if ctx.cancel.is_cancelled() {
        return None;
    }
    ctx.mark_in_flight(model);

    let call = ModelCall {
        run_id: ctx.id.clone(),
        model: model.clone(),
        prompt: ctx.request.prompt.clone(),
        context,
        conversation_id: ctx.request.conversation_id.clone(),
    };
    let timeout = env.config.call_timeout;
    let started = Instant::now();

    let outcome = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(CallError::Cancelled),
        r = tokio::time::timeout(timeout, env.caller.call(call)) => match r {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::Timeout(timeout)),
        },
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    let result = match outcome.and_then(|reply| accept(reply, env.config.default_confidence)) {
        Ok((content, confidence, tokens)) => {
            debug!(run_id = %ctx.id, model = %model, latency_ms, confidence, "Model call succeeded");
            ModelResult::success(ctx.id.clone(), model.clone(), content, confidence, tokens, latency_ms)
        }
        Err(err) => {
            let Some(failure) = err.to_failure() else {
                ctx.clear_in_flight(model);
                return None;
            };
            warn!(run_id = %ctx.id, model = %model, latency_ms, error = %err, "Model call failed");
            ModelResult::failure(ctx.id.clone(), model.clone(), failure, latency_ms)
        }
    };

    env.registry.record_result(&result);
    if ctx.record(result.clone()) {
        Some(result)
    } else {
        None
    }
}

/// Validate a reply and fill in confidence and token count
fn accept(reply: ModelReply, default_confidence: f32) -> Result<(String, f32, u32), CallError> {
    if reply.content.trim().is_empty() {
        return Err(CallError::Malformed("empty response".to_string()));
    }
    if let Some(c) = reply.confidence {
        if !c.is_finite() {
            return Err(CallError::Malformed(format!("confidence {} is not finite", c)));
        }
    }
    let confidence = reply
        .confidence
        .or_else(|| extract_confidence(&reply.content))
        .unwrap_or(default_confidence);
    let tokens = reply
        .tokens_used
        .unwrap_or_else(|| estimate_tokens(&reply.content));
    Ok((reply.content, confidence, tokens))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ModelProfile, ModelRegistry};

    fn registry() -> SharedModelRegistry {
        ModelRegistry::from_profiles(
            vec![
                ModelProfile::new("writer").with_capability(Capability::Writing, 0.9),
                ModelProfile::new("coder").with_capability(Capability::Coding, 0.95),
                ModelProfile::new("generalist")
                    .with_capability(Capability::Coding, 0.6)
                    .with_capability(Capability::Writing, 0.6),
            ],
            Default::default(),
        )
        .shared()
    }

    fn request(models: &[&str], strategy: Strategy) -> OrchestrationRequest {
        OrchestrationRequest::new(
            "prompt",
            models.iter().map(|m| ModelId::new(*m)).collect(),
            strategy,
        )
    }

    #[test]
    fn test_adaptive_orders_by_capability() {
        let req = request(&["writer", "generalist", "coder"], Strategy::Adaptive);
        let order = adaptive_order(&req, Capability::Coding, &registry());
        assert_eq!(
            order,
            vec![
                ModelId::new("coder"),
                ModelId::new("generalist"),
                ModelId::new("writer")
            ]
        );
    }

    #[test]
    fn test_cascade_order_is_stable_by_weight() {
        let req = request(&["a", "b", "c", "d"], Strategy::Cascade)
            .with_weight("c", 2.0)
            .with_weight("a", 0.5);
        let order = cascade_order(&req);
        assert_eq!(
            order,
            vec![
                ModelId::new("c"),
                ModelId::new("b"),
                ModelId::new("d"),
                ModelId::new("a")
            ]
        );
    }

    #[test]
    fn test_accept_fills_missing_fields() {
        let (content, confidence, tokens) =
            accept(ModelReply::new("answer [confidence: 0.9]"), 0.7).unwrap();
        assert_eq!(content, "answer [confidence: 0.9]");
        assert!((confidence - 0.9).abs() < 1e-6);
        assert!(tokens > 0);

        let (_, confidence, tokens) =
            accept(ModelReply::new("plain").with_tokens(12), 0.7).unwrap();
        assert!((confidence - 0.7).abs() < 1e-6);
        assert_eq!(tokens, 12);

        assert!(matches!(
            accept(ModelReply::new("   "), 0.7),
            Err(CallError::Malformed(_))
        ));
    }
}
