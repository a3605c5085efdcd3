use anyhow::{Context, Result};
use clap::Parser;
use minigpt_modeling::{
    auto_tokenizer,
    logging::{logging, LogOutput},
    AttentionImplementation, ByteTokenizer, Devices, ExecutionEnvironment, Experiment,
    ExperimentConfig, Gpt2Variant, GptConfig, OptimizerDefinition, Precision, Sampler,
    TokenCodec, DEFAULT_TOP_K,
};
use std::{path::PathBuf, sync::Arc};
use tch::Tensor;
use tracing::{info, Level};

#[derive(Parser, Debug, Clone)]
struct Args {
    /// Plain-text training corpus.
    #[arg(long, default_value = "input.txt")]
    corpus: PathBuf,

    #[arg(long, default_value_t = 50)]
    steps: u32,

    #[arg(long, default_value_t = 4)]
    batch_size: usize,

    #[arg(long, default_value_t = 32)]
    sequence_length: usize,

    #[arg(long, default_value_t = 3e-4)]
    learning_rate: f64,

    #[arg(long, default_value_t = 0.9)]
    beta1: f32,

    #[arg(long, default_value_t = 0.999)]
    beta2: f32,

    #[arg(long, default_value_t = 0.01)]
    weight_decay: f32,

    #[arg(long, default_value_t = 1e-8)]
    eps: f32,

    #[arg(long)]
    max_grad_norm: Option<f32>,

    /// Architecture to train from scratch; ignored when --config is given.
    #[arg(long, value_enum, default_value_t = Gpt2Variant::Small)]
    variant: Gpt2Variant,

    /// JSON model config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// tokenizer.json (or a directory holding one). Downloaded from the hub when absent.
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Use one token per byte instead of BPE; forces vocab_size to 256.
    #[arg(long, default_value_t = false)]
    byte_tokenizer: bool,

    #[arg(long, value_enum, default_value_t = AttnImpl::Eager)]
    attn_implementation: AttnImpl,

    #[arg(
        long,
        help = "Device to use: auto, cpu, mps, cuda, cuda:N",
        default_value = "auto"
    )]
    device: Devices,

    /// `mixed` autocasts to fp16 on CUDA.
    #[arg(long, value_enum, default_value_t = Precision::Full)]
    precision: Precision,

    #[arg(long)]
    seed: Option<i64>,

    /// Append per-step metrics as JSON lines to this file.
    #[arg(long)]
    metrics_output: Option<PathBuf>,

    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,

    #[arg(long, value_enum, default_value_t = LogOutput::Console)]
    log_output: LogOutput,

    #[arg(long)]
    write_log: Option<PathBuf>,

    /// Sequences sampled from the trained model; 0 disables sampling.
    #[arg(long, default_value_t = 5)]
    num_sequences: i64,

    #[arg(long, default_value_t = 30)]
    max_length: usize,

    #[arg(long, default_value_t = DEFAULT_TOP_K)]
    top_k: usize,

    #[arg(long, default_value = "Hello, I'm a language model, ")]
    prompt: String,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum AttnImpl {
    Eager,
    Sdpa,
}

impl From<AttnImpl> for AttentionImplementation {
    fn from(val: AttnImpl) -> Self {
        match val {
            AttnImpl::Eager => AttentionImplementation::Eager,
            AttnImpl::Sdpa => AttentionImplementation::Sdpa,
        }
    }
}

fn load_codec(args: &Args) -> Result<Arc<dyn TokenCodec>> {
    if args.byte_tokenizer {
        return Ok(Arc::new(ByteTokenizer));
    }
    let path = match &args.tokenizer {
        Some(path) => path.clone(),
        None => hf_hub::api::sync::Api::new()?
            .model(Gpt2Variant::Small.repo_id().to_string())
            .get("tokenizer.json")
            .context("failed to download tokenizer")?,
    };
    Ok(Arc::new(auto_tokenizer(path)?))
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging()
        .with_output(args.log_output)
        .with_level(args.log_level)
        .with_log_file(args.write_log.clone())
        .init()?;

    let codec = load_codec(&args)?;
    let mut model = match &args.config {
        Some(path) => GptConfig::from_json_file(path)
            .with_context(|| format!("failed to load model config {}", path.display()))?,
        None => args.variant.config(),
    };
    if args.byte_tokenizer {
        model.vocab_size = ByteTokenizer::VOCAB_SIZE;
    }

    let env = ExecutionEnvironment::new(args.device, args.precision);
    info!(
        device = %env.devices,
        accelerated = env.is_accelerated(),
        autocast = env.uses_autocast(),
        "execution environment"
    );

    let config = ExperimentConfig {
        model,
        corpus: args.corpus.clone(),
        steps: args.steps,
        batch_size: args.batch_size,
        sequence_length: args.sequence_length,
        optimizer: OptimizerDefinition::AdamW {
            learning_rate: args.learning_rate,
            betas: [args.beta1, args.beta2],
            weight_decay: args.weight_decay,
            eps: args.eps,
            clip_grad_norm: args.max_grad_norm,
        },
        attn_implementation: args.attn_implementation.into(),
        metrics_output: args.metrics_output.clone(),
        seed: args.seed,
    };
    let report = Experiment::new(config, env, codec.clone())?.run()?;

    if args.num_sequences <= 0 {
        return Ok(());
    }
    let tokens = codec
        .encode(&args.prompt)?
        .into_iter()
        .map(i64::from)
        .collect::<Vec<_>>();
    let seed = Tensor::from_slice(&tokens)
        .unsqueeze(0)
        .repeat([args.num_sequences, 1]);
    let sequences =
        Sampler::new(args.top_k).generate(report.model.as_ref(), &seed, args.max_length)?;
    for row in 0..args.num_sequences {
        let ids = Vec::<i64>::try_from(sequences.get(row))?
            .into_iter()
            .map(|id| id as u32)
            .collect::<Vec<_>>();
        println!(">> {}", codec.decode(&ids)?);
    }
    Ok(())
}
