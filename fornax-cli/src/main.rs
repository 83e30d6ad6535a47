//! Text generation CLI.
//!
//! Usage:
//!   # Single prompt against a model directory:
//!   fornax models/stories15M -i "Once upon a time"
//!   # Batched requests from a JSON file:
//!   fornax models/stories15M --input-json requests.json
//!   # Contiguous-cache comparison run:
//!   fornax models/stories15M -i "Once upon a time" --without-paged-attn

mod paths;
mod request_file;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use fornax::{
    AttentionMode, BlockConfig, Model, Result, SamplingParams, StepEngine, Tokenizer,
};
use fornax_runtime::{
    BatchedRunner, Request, RequestIntake, RequestSubmitter, SchedulerConfig,
};

/// CPU text generation with a paged KV cache and continuous batching.
#[derive(Parser, Debug)]
#[command(name = "fornax", version)]
struct Cli {
    /// Path to a model directory (model.bin + tokenizer.bin) or a model
    /// file
    path: PathBuf,

    /// Text prompt
    #[arg(short = 'i', long, conflicts_with = "input_json")]
    prompt: Option<String>,

    /// JSON file with a batch of requests
    #[arg(long)]
    input_json: Option<PathBuf>,

    /// Sampling temperature (0 = greedy)
    #[arg(short, long, default_value_t = 1.0)]
    temperature: f32,

    /// Nucleus sampling threshold
    #[arg(short = 'p', long, default_value_t = 0.9)]
    top_p: f32,

    /// Maximum tokens to generate per request
    #[arg(short = 'n', long = "steps", default_value_t = 256)]
    steps: usize,

    /// Disable the paged KV cache and run against a single contiguous
    /// cache (comparison mode, single sequence only)
    #[arg(long)]
    without_paged_attn: bool,

    /// Base RNG seed; request `i` samples with seed + i
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Tokens per KV cache block
    #[arg(long, default_value_t = 16)]
    block_size: usize,

    /// Total KV cache blocks in the pool
    #[arg(long, default_value_t = 256)]
    num_blocks: usize,

    /// Maximum requests per batch
    #[arg(long, default_value_t = 8)]
    max_batch_size: usize,

    /// Maximum scheduled tokens per batch
    #[arg(long, default_value_t = 512)]
    max_tokens_per_batch: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let (model_path, tokenizer_path) = paths::resolve_model_paths(&cli.path)?;

    let model = Model::load(&model_path)?;
    let tokenizer = Tokenizer::load(&tokenizer_path, model.config.vocab_size)?;
    let n_layers = model.config.n_layers;

    let mode = if cli.without_paged_attn {
        info!("paged attention disabled, using contiguous KV cache");
        AttentionMode::Contiguous
    } else {
        AttentionMode::Paged(BlockConfig {
            block_size: cli.block_size,
            num_blocks: cli.num_blocks,
        })
    };
    let mut engine = StepEngine::new(model, mode);

    let requests = build_requests(cli, n_layers)?;
    let intake = Arc::new(RequestIntake::new());
    let producer = RequestSubmitter::spawn(requests, Arc::clone(&intake));

    let scheduler_config = SchedulerConfig {
        max_batch_size: cli.max_batch_size,
        max_tokens_per_batch: cli.max_tokens_per_batch,
    };
    let mut runner = BatchedRunner::new(&mut engine, scheduler_config, cli.seed)
        .with_tokenizer(&tokenizer)
        .with_streaming(true);

    let metrics = runner.run(&intake)?;
    producer.join().map_err(|_| {
        fornax::Error::Config("request producer thread panicked".into())
    })?;
    drop(runner);

    if let Some(pool) = engine.pool() {
        info!(
            free_blocks = pool.num_free(),
            total_blocks = pool.num_blocks(),
            utilization = pool.utilization(),
            "pool state after run"
        );
    }

    println!("{metrics}");
    Ok(())
}

fn build_requests(cli: &Cli, n_layers: usize) -> Result<Vec<Request>> {
    if let Some(path) = &cli.input_json {
        return request_file::load_requests(path, n_layers);
    }

    let prompt = cli.prompt.as_deref().ok_or_else(|| {
        fornax::Error::Config("either --prompt or --input-json is required".into())
    })?;
    if prompt.is_empty() {
        return Err(fornax::Error::Config("prompt must not be empty".into()));
    }

    let params = SamplingParams {
        temperature: cli.temperature,
        top_p: cli.top_p,
        max_tokens: cli.steps,
    };
    Ok(vec![Request::new(0, prompt, params, n_layers)])
}
