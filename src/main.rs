//! Remora: policy optimization with multi-turn, tool-augmented rollouts
//!
//! Provides subcommands to exercise each half of the library:
//!
//! - `estimate`      -- Run the configured advantage estimator and actor loss
//! - `rollout`       -- Roll out demo prompts against a scripted engine
//! - `check-config`  -- Validate a configuration file
//! - `print-config`  -- Print the effective configuration as JSON

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use remora::config::TrainerConfig;
use remora::rollout::mock::{demo_batch, ByteTokenizer, ScriptedEngine, ScriptedTurn};
use remora::rollout::{
    AnswerMatchScorer, Collaborators, CropTool, PatchGridProcessor, RolloutMode, RolloutWorker,
    Tokenizer, ZeroVarianceFilter,
};
use remora::training::{
    ActorInputs, ActorLossOutput, ActorObjective, AdvantageEstimator, AdvantageInputs,
    AdvantageOutput,
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Remora: policy optimization with multi-turn, tool-augmented rollouts
#[derive(Parser)]
#[command(name = "remora", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured advantage estimator (and actor loss when log-probs are given).
    Estimate {
        /// JSON file with `token_level_rewards`, `response_mask` and optional
        /// `index`, `values`, `reward_baselines`, `old_log_prob`, `log_prob`.
        #[arg(long)]
        input: Option<PathBuf>,

        /// Rows of the synthetic batch used when no input is given.
        #[arg(long, default_value_t = 8)]
        rows: usize,

        /// Response length of the synthetic batch.
        #[arg(long, default_value_t = 16)]
        len: usize,

        /// Samples per prompt group in the synthetic batch.
        #[arg(long, default_value_t = 4)]
        group_size: usize,

        /// Seed for the synthetic batch.
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },

    /// Roll out demo prompts against a scripted engine and print the batch summary.
    Rollout {
        /// Samples per prompt (overrides `rollout.n`).
        #[arg(long)]
        n: Option<usize>,

        /// Run in validation mode (greedy, `val_n` samples, no validity split).
        #[arg(long)]
        validate: bool,
    },

    /// Validate the configuration and exit.
    CheckConfig,

    /// Print the effective configuration as JSON.
    PrintConfig,
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str::<TrainerConfig>(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        None => TrainerConfig::default(),
    };

    match cli.command {
        Commands::Estimate {
            input,
            rows,
            len,
            group_size,
            seed,
        } => {
            config.validate()?;
            let batch = match input {
                Some(path) => EstimateInput::load(&path)?,
                None => EstimateInput::synthetic(rows, len, group_size, seed),
            };
            cmd_estimate(&config, &batch)
        }
        Commands::Rollout { n, validate } => {
            let mut config = config;
            if let Some(n) = n {
                config.rollout.n = n;
            }
            config.validate()?;
            cmd_rollout(&config, validate).await
        }
        Commands::CheckConfig => cmd_check_config(&config),
        Commands::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// check-config
// ---------------------------------------------------------------------------

fn cmd_check_config(config: &TrainerConfig) -> Result<()> {
    config.validate()?;
    let estimator = AdvantageEstimator::from_config(&config.algorithm)?;
    let actor = ActorObjective::from_config(&config.actor)?;
    let (max_rounds, max_images) = config.rollout.round_limits(false);

    println!("configuration is valid");
    println!("  estimator:        {} (critic: {})", estimator.name(), estimator.uses_critic());
    println!("  policy loss:      {:?}", actor.kind);
    println!("  clip range:       [{}, {}]", actor.clip_low, actor.clip_high);
    println!("  loss aggregation: {}", actor.agg_mode);
    println!("  kl controller:    {}", config.algorithm.kl_ctrl.kind);
    println!("  rounds / images:  {max_rounds} / {max_images}");
    println!("  context budget:   {}", config.rollout.context_budget());
    Ok(())
}

// ---------------------------------------------------------------------------
// estimate
// ---------------------------------------------------------------------------

/// Tensors for the `estimate` command, as nested JSON arrays.
#[derive(Debug, Clone, Deserialize)]
struct EstimateInput {
    token_level_rewards: Vec<Vec<f32>>,
    response_mask: Vec<Vec<f32>>,
    #[serde(default)]
    index: Option<Vec<String>>,
    #[serde(default)]
    values: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    reward_baselines: Option<Vec<f32>>,
    #[serde(default)]
    old_log_prob: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    log_prob: Option<Vec<Vec<f32>>>,
}

impl EstimateInput {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).context("Failed to parse estimator input")
    }

    /// Outcome rewards on the last live token, random lengths, grouped rows.
    fn synthetic(rows: usize, len: usize, group_size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let len = len.max(1);
        let group_size = group_size.max(1);
        let mut rewards = vec![vec![0.0; len]; rows];
        let mut mask = vec![vec![0.0; len]; rows];
        let mut values = vec![vec![0.0; len]; rows];
        let mut old_log_prob = vec![vec![0.0; len]; rows];
        let mut log_prob = vec![vec![0.0; len]; rows];
        for r in 0..rows {
            let live = rng.gen_range(1..=len);
            mask[r][..live].fill(1.0);
            rewards[r][live - 1] = if rng.gen_bool(0.5) { 1.0 } else { 0.0 };
            for t in 0..len {
                values[r][t] = rng.gen_range(-0.5f32..0.5);
                old_log_prob[r][t] = -rng.gen_range(0.1f32..3.0);
                log_prob[r][t] = old_log_prob[r][t] + rng.gen_range(-0.2f32..0.2);
            }
        }
        Self {
            token_level_rewards: rewards,
            response_mask: mask,
            index: Some((0..rows).map(|r| format!("prompt-{}", r / group_size)).collect()),
            values: Some(values),
            reward_baselines: Some(vec![0.5; rows]),
            old_log_prob: Some(old_log_prob),
            log_prob: Some(log_prob),
        }
    }
}

fn to_array2(name: &str, rows: &[Vec<f32>]) -> Result<Array2<f32>> {
    let width = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != width) {
        bail!("{name} is ragged");
    }
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), width), flat).with_context(|| format!("{name} has a bad shape"))
}

#[derive(Serialize)]
struct EstimateReport {
    estimator: &'static str,
    #[serde(flatten)]
    output: AdvantageOutput,
    actor_loss: Option<ActorLossOutput>,
}

fn cmd_estimate(config: &TrainerConfig, input: &EstimateInput) -> Result<()> {
    let estimator = AdvantageEstimator::from_config(&config.algorithm)?;
    tracing::info!(estimator = estimator.name(), "Running advantage estimator");

    let rewards = to_array2("token_level_rewards", &input.token_level_rewards)?;
    let mask = to_array2("response_mask", &input.response_mask)?;
    let values = input
        .values
        .as_deref()
        .map(|v| to_array2("values", v))
        .transpose()?;
    let baselines = input.reward_baselines.clone().map(Array1::from);

    let output = estimator.estimate(&AdvantageInputs {
        token_level_rewards: &rewards,
        response_mask: &mask,
        values: values.as_ref(),
        index: input.index.as_deref(),
        reward_baselines: baselines.as_ref(),
    })?;

    let actor_loss = match (&input.old_log_prob, &input.log_prob) {
        (Some(old), Some(new)) => {
            let old = to_array2("old_log_prob", old)?;
            let new = to_array2("log_prob", new)?;
            let objective = ActorObjective::from_config(&config.actor)?;
            Some(objective.evaluate(&ActorInputs {
                old_log_prob: &old,
                log_prob: &new,
                advantages: &output.advantages,
                response_mask: &mask,
                logits: None,
                ref_log_prob: None,
                exceed: None,
            })?)
        }
        _ => None,
    };

    let report = EstimateReport {
        estimator: estimator.name(),
        output,
        actor_loss,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// rollout
// ---------------------------------------------------------------------------

const DEMO_QUESTIONS: [(&str, &str); 3] = [
    ("What colour is the square?", "red"),
    ("Which colour fills the picture?", "green"),
    ("Name the colour of the image.", "blue"),
];

async fn cmd_rollout(config: &TrainerConfig, validate: bool) -> Result<()> {
    let rollout = config.rollout.clone();
    let tokens = rollout.tokens.clone();
    let tokenizer = ByteTokenizer::new(&tokens);
    let processor = PatchGridProcessor::new(tokens.image_pad_token_id);
    let prompts = demo_batch(&tokenizer, &processor, &tokens, &DEMO_QUESTIONS)?;

    let shared_tokenizer: Arc<dyn Tokenizer> = Arc::new(tokenizer);
    let parts = Collaborators {
        tokenizer: shared_tokenizer.clone(),
        processor: Arc::new(processor),
        tools: Arc::new(CropTool::new(rollout.use_relative_coordinates)),
        scorer: Arc::new(AnswerMatchScorer::new(rollout.max_total_response_length, 0)?),
        val_scorer: None,
        classifier: Arc::new(ZeroVarianceFilter),
    };

    // Every request zooms once, then answers; about half of them guess.
    let engine = ScriptedEngine::new(shared_tokenizer, |round, request_id| {
        if round == 0 {
            return ScriptedTurn::stop(
                r#"<think>Zoom in first.</think><grounding>{"bbox_2d": [28, 28, 84, 84], "source": "original_image"}</grounding>"#,
            );
        }
        let colour = match request_id.bytes().next().unwrap_or(0) % 3 {
            0 => "red",
            1 => "green",
            _ => "blue",
        };
        ScriptedTurn::stop(format!("<answer>{colour}</answer><|im_end|>"))
    });

    let worker = RolloutWorker::new(engine, parts, rollout)?;
    let mode = RolloutMode {
        do_sample: !validate,
        is_validate: validate,
    };
    worker.wake_up().await?;
    let batch = worker.generate_sequences(&prompts, mode).await?;
    worker.sleep().await?;

    println!("{}", serde_json::to_string_pretty(&batch.summary())?);

    if !validate {
        let estimator = AdvantageEstimator::from_config(&config.algorithm)?;
        let mask = batch.response_mask();
        let index = batch.group_index();
        let output = estimator.estimate(&AdvantageInputs {
            token_level_rewards: &batch.reward_tensor,
            response_mask: &mask,
            values: None,
            index: Some(&index),
            reward_baselines: None,
        });
        match output {
            Ok(output) => tracing::info!(
                estimator = estimator.name(),
                mean_abs_advantage = output.advantages.mapv(f32::abs).mean().unwrap_or(0.0),
                "Advantages computed for the rollout batch"
            ),
            Err(e) => tracing::warn!(error = %e, "Estimator needs inputs the demo does not provide"),
        }
    }
    Ok(())
}
