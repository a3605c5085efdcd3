use anyhow::{Context, Result};
use clap::Parser;
use minigpt_modeling::{
    auto_tokenizer,
    logging::{logging, LogOutput},
    set_torch_rng_seed, AttentionImplementation, CausalLM, Devices, Gpt2Variant, GptForCausalLM,
    Sampler, TokenCodec, DEFAULT_TOP_K,
};
use std::path::PathBuf;
use tch::Tensor;
use tracing::{info, Level};

#[derive(Parser, Debug, Clone)]
struct Args {
    #[arg(long, value_enum, default_value_t = Gpt2Variant::Small)]
    variant: Gpt2Variant,

    /// Local model.safetensors; fetched from the variant's hub repo when absent.
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Local tokenizer.json; fetched from the variant's hub repo when absent.
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    #[arg(long, default_value = "Hello, I'm a language model, ")]
    prompt: String,

    #[arg(long, default_value_t = 5)]
    num_sequences: i64,

    #[arg(long, default_value_t = 30)]
    max_length: usize,

    #[arg(long, default_value_t = DEFAULT_TOP_K)]
    top_k: usize,

    #[arg(long)]
    seed: Option<i64>,

    #[arg(long, default_value_t = false)]
    sdpa: bool,

    #[arg(
        long,
        help = "Device to use: auto, cpu, mps, cuda, cuda:N",
        default_value = "auto"
    )]
    device: Devices,

    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,

    #[arg(long, value_enum, default_value_t = LogOutput::Console)]
    log_output: LogOutput,
}

fn hub_file(variant: Gpt2Variant, local: Option<PathBuf>, filename: &str) -> Result<PathBuf> {
    match local {
        Some(path) => Ok(path),
        None => {
            info!(repo = variant.repo_id(), filename, "fetching from hub");
            hf_hub::api::sync::Api::new()?
                .model(variant.repo_id().to_string())
                .get(filename)
                .with_context(|| format!("failed to download {filename} for {variant}"))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging()
        .with_output(args.log_output)
        .with_level(args.log_level)
        .init()?;
    set_torch_rng_seed(args.seed);

    let checkpoint = hub_file(args.variant, args.checkpoint.clone(), "model.safetensors")?;
    let tokenizer = auto_tokenizer(hub_file(
        args.variant,
        args.tokenizer.clone(),
        "tokenizer.json",
    )?)?;

    let attn_implementation = match args.sdpa {
        true => AttentionImplementation::Sdpa,
        false => AttentionImplementation::Eager,
    };
    let model = GptForCausalLM::from_pretrained(
        args.variant,
        &checkpoint,
        args.device.device(),
        attn_implementation,
    )?;
    info!(
        parameters = model.num_parameters(),
        device = %args.device,
        "loaded pretrained model"
    );

    let tokens = TokenCodec::encode(&tokenizer, &args.prompt)?
        .into_iter()
        .map(i64::from)
        .collect::<Vec<_>>();
    let seed = Tensor::from_slice(&tokens)
        .unsqueeze(0)
        .repeat([args.num_sequences, 1])
        .to(model.device());

    let sequences = Sampler::new(args.top_k).generate(&model, &seed, args.max_length)?;
    for row in 0..args.num_sequences {
        let ids = Vec::<i64>::try_from(sequences.get(row))?
            .into_iter()
            .map(|id| id as u32)
            .collect::<Vec<_>>();
        println!(">> {}", TokenCodec::decode(&tokenizer, &ids)?);
    }
    Ok(())
}
