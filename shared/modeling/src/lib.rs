mod attention;
mod batcher;
mod causal_language_model;
mod config;
mod device_utils;
mod experiment;
pub mod init;
pub mod logging;
pub mod metrics;
mod models;
mod optimizer;
mod sampling;
mod tokenizer;
mod trainer;
mod weight_import;

pub use attention::{causal_mask, AttentionImplementation, CausalSelfAttention};
pub use batcher::{Batch, BatchSource, BatchSourceError};
pub use causal_language_model::{check_input_ids, cross_entropy, CausalLM};
pub use config::{ConfigLoadError, ConfigurationError, Gpt2Variant, GptConfig, UnknownVariant};
pub use device_utils::{
    get_optimal_devices, Devices, DevicesParseError, ExecutionEnvironment, Precision,
};
pub use experiment::{Experiment, ExperimentConfig, ExperimentReport};
pub use models::*;
pub use optimizer::{Optimizer, OptimizerDefinition};
pub use sampling::{GenerationState, Sampler, DEFAULT_TOP_K};
pub use tokenizer::{auto_tokenizer, ByteTokenizer, TokenCodec, TokenizerError};
pub use trainer::{TrainOutput, Trainer};
pub use weight_import::{
    Checkpoint, CheckpointError, ImportSummary, StructuralMismatchError, WeightImporter,
};

/// Seeds libtorch's generator, drawing a random seed when none is given.
/// Returns the seed used.
pub fn set_torch_rng_seed(seed: Option<i64>) -> i64 {
    use rand::Rng;

    let seed = seed.unwrap_or_else(|| rand::rng().random());
    tch::manual_seed(seed);
    tracing::info!(seed, "torch seed set");
    seed
}
