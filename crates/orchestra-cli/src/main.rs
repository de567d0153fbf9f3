//! `orchestra`: command-line driver for the orchestration engine
//!
//! # Usage
//!
//! ```bash
//! # Start a local backend, then run a prompt across two models
//! orchestra demo-backend --port 7400 --fail gpt-4o &
//! orchestra run "Compare Rust and Go error handling" --models claude-sonnet,gpt-4o --strategy consensus
//!
//! # Ask Athena for a recommendation and apply it
//! orchestra recommend "Prove that the square root of 2 is irrational" --apply
//!
//! # Offline prompt analysis
//! orchestra analyze "Write a haiku about borrow checking"
//! ```
//!
//! Results are printed as JSON on stdout; logs go to stderr
//! (`RUST_LOG=orchestration=debug` for per-call detail).

mod demo_backend;

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use orchestration::athena::Recommender;
use orchestration::registry::{default_catalog, ModelRegistry};
use orchestration::{
    ModelId, OrchestraConfig, OrchestraEvent, OrchestraSession, OrchestrationRequest,
    ProcessOutcome, PromptAnalyzer, RegistrySource, Strategy,
};

use demo_backend::DemoBackendConfig;

#[derive(Parser, Debug)]
#[command(name = "orchestra", author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend host (overrides configuration)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Backend port (overrides configuration)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a prompt across a model subset
    Run {
        prompt: String,
        /// Comma-separated model ids
        #[arg(long, value_delimiter = ',', required = true)]
        models: Vec<String>,
        #[arg(long, default_value = "parallel")]
        strategy: Strategy,
        /// Per-model weight, `model=weight`; repeatable
        #[arg(long = "weight", value_parser = parse_weight)]
        weights: Vec<(String, f32)>,
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Ask Athena for a model and strategy recommendation
    Recommend {
        prompt: String,
        /// Submit the recommendation and wait for the result
        #[arg(long, default_value_t = false)]
        apply: bool,
    },
    /// Analyze a prompt without connecting to a backend
    Analyze { prompt: String },
    /// List registered models
    Models,
    /// Serve a local backend for testing
    DemoBackend {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Listening port (defaults to the configured backend port)
        #[arg(long = "listen-port")]
        listen_port: Option<u16>,
        /// Reply latency in milliseconds
        #[arg(long, default_value_t = 250)]
        latency_ms: u64,
        /// Models that always fail; repeatable
        #[arg(long = "fail")]
        failing: Vec<String>,
    },
}

fn parse_weight(s: &str) -> Result<(String, f32), String> {
    let (model, weight) = s
        .split_once('=')
        .ok_or_else(|| format!("expected model=weight, got '{}'", s))?;
    let weight: f32 = weight
        .trim()
        .parse()
        .map_err(|_| format!("invalid weight '{}'", weight))?;
    Ok((model.trim().to_string(), weight))
}

fn load_config(args: &Args) -> Result<OrchestraConfig> {
    let mut config = match &args.config {
        Some(path) => OrchestraConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => OrchestraConfig::default(),
    };
    config
        .apply_env()
        .context("Invalid ORCHESTRA_* environment override")?;
    if let Some(host) = &args.host {
        config.link.host = host.clone();
    }
    if let Some(port) = args.port {
        config.link.port = port;
    }
    Ok(config)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Offline analysis plus the recommendation the configured catalog would
/// produce. A failed recommendation is reported in `error`.
fn analyze_report(prompt: &str, config: &OrchestraConfig) -> serde_json::Value {
    let analysis = PromptAnalyzer::new().analyze(prompt);
    let registry =
        ModelRegistry::from_profiles(config.registry.initial_profiles(), config.health.clone());
    match Recommender::new(config.athena.policy.clone()).recommend(prompt, &analysis, &registry) {
        Ok(recommendation) => json!({
            "analysis": analysis,
            "recommendation": recommendation,
        }),
        Err(e) => {
            warn!(error = %e, "No recommendation");
            json!({
                "analysis": analysis,
                "recommendation": null,
                "error": e.to_string(),
            })
        }
    }
}

async fn connected_session(config: OrchestraConfig) -> Result<OrchestraSession> {
    let session = OrchestraSession::new(config);
    let endpoint = format!(
        "{}:{}",
        session.config().link.host,
        session.config().link.port
    );
    session
        .connect()
        .await
        .with_context(|| format!("Failed to connect to backend at {}", endpoint))?;
    spawn_event_logger(&session);
    Ok(session)
}

/// Log result events to stderr while the command runs
fn spawn_event_logger(session: &OrchestraSession) {
    let mut rx = session.bus().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match &event {
                OrchestraEvent::ModelResultReceived { result, .. } => info!(
                    model = %result.model_id,
                    success = result.success,
                    latency_ms = result.latency_ms,
                    "Model result"
                ),
                OrchestraEvent::ConnectionChanged { state, .. } => {
                    info!(status = %state.status, "Connection")
                }
                _ => {}
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orchestration=info,orchestra=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;

    match args.command {
        Command::Run {
            prompt,
            models,
            strategy,
            weights,
            conversation,
        } => {
            let session = connected_session(config).await?;
            let mut request = OrchestrationRequest::new(
                prompt,
                models.into_iter().map(ModelId::new).collect(),
                strategy,
            );
            for (model, weight) in weights {
                request = request.with_weight(model, weight);
            }
            if let Some(conversation) = conversation {
                request = request.with_conversation(conversation);
            }

            let run = session.engine().submit(request)?;
            let finished = run.wait().await;
            let trace = session.trace().for_run(&finished.id);
            session.disconnect().await;
            print_json(&json!({ "run": finished, "trace": trace }))?;
        }

        Command::Recommend { prompt, apply } => {
            let session = connected_session(config).await?;
            let athena = session.athena();
            let outcome = athena.process(&prompt, None)?;

            let run = match outcome {
                ProcessOutcome::AutoApplied { run, .. } => Some(run),
                ProcessOutcome::AwaitingApproval(_) if apply => {
                    Some(athena.apply_recommendation()?)
                }
                ProcessOutcome::AwaitingApproval(_) => None,
            };
            let finished = match run {
                Some(run) => Some(run.wait().await),
                None => None,
            };
            session.disconnect().await;
            print_json(&json!({
                "athena": athena.status(),
                "run": finished,
            }))?;
        }

        Command::Analyze { prompt } => {
            print_json(&analyze_report(&prompt, &config))?;
        }

        Command::Models => {
            let models = if config.registry.source == RegistrySource::Discovery {
                let session = connected_session(config).await?;
                let models = session.registry().snapshot();
                session.disconnect().await;
                models
            } else {
                ModelRegistry::from_profiles(config.registry.initial_profiles(), config.health)
                    .snapshot()
            };
            print_json(&serde_json::to_value(models)?)?;
        }

        Command::DemoBackend {
            bind,
            listen_port,
            latency_ms,
            failing,
        } => {
            let models = if config.registry.models.is_empty() {
                default_catalog()
            } else {
                config.registry.models.clone()
            };
            let failing: HashSet<ModelId> = failing.into_iter().map(ModelId::new).collect();
            for model in &failing {
                if !models.iter().any(|p| &p.id == model) {
                    bail!("--fail names unknown model {}", model);
                }
            }
            let port = listen_port.unwrap_or(config.link.port);
            demo_backend::serve(
                &format!("{}:{}", bind, port),
                DemoBackendConfig {
                    latency: Duration::from_millis(latency_ms),
                    failing,
                    models,
                },
            )
            .await?;
        }
    }

    Ok(())
}
