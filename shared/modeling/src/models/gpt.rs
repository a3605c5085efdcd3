//! GPT-2 style decoder.
//!
//! - learned token and position embeddings
//! - pre-norm residual blocks (LayerNorm -> attention, LayerNorm -> GELU MLP)
//! - output projection tied to the token embedding

use crate::{
    attention::{causal_mask, AttentionImplementation, CausalSelfAttention},
    causal_language_model::{check_input_ids, cross_entropy, CausalLM},
    init::{self, ProjectionRole},
    weight_import::{Checkpoint, CheckpointError, ImportSummary, WeightImporter},
    ConfigurationError, Gpt2Variant, GptConfig,
};
use std::{collections::BTreeMap, path::Path};
use tch::{
    nn::{self, Module},
    Device, Kind, Tensor,
};
use tracing::info;

pub const LM_HEAD_WEIGHT: &str = "lm_head.weight";
pub const TOKEN_EMBEDDING_WEIGHT: &str = "transformer.wte.weight";

// ============================================================================
// MLP
// ============================================================================

#[derive(Debug)]
struct Mlp {
    c_fc: nn::Linear,
    c_proj: nn::Linear,
}

impl Mlp {
    fn new(vs: nn::Path, config: &GptConfig) -> Self {
        let n_embd = config.n_embd as i64;
        Self {
            c_fc: init::linear(
                &vs / "c_fc",
                n_embd,
                4 * n_embd,
                ProjectionRole::Standard,
                config,
            ),
            c_proj: init::linear(
                &vs / "c_proj",
                4 * n_embd,
                n_embd,
                ProjectionRole::ResidualOutput,
                config,
            ),
        }
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Tensor {
        self.c_proj.forward(&self.c_fc.forward(xs).gelu("tanh"))
    }
}

// ============================================================================
// Block
// ============================================================================

#[derive(Debug)]
struct Block {
    ln_1: nn::LayerNorm,
    attn: CausalSelfAttention,
    ln_2: nn::LayerNorm,
    mlp: Mlp,
}

fn layer_norm(vs: nn::Path, config: &GptConfig) -> nn::LayerNorm {
    nn::layer_norm(
        vs,
        vec![config.n_embd as i64],
        nn::LayerNormConfig {
            eps: config.layer_norm_epsilon,
            ..Default::default()
        },
    )
}

impl Block {
    fn new(
        vs: nn::Path,
        config: &GptConfig,
        mask: &Tensor,
        attn_implementation: AttentionImplementation,
    ) -> Self {
        Self {
            ln_1: layer_norm(&vs / "ln_1", config),
            attn: CausalSelfAttention::new(&vs / "attn", config, mask, attn_implementation),
            ln_2: layer_norm(&vs / "ln_2", config),
            mlp: Mlp::new(&vs / "mlp", config),
        }
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        // Pre-norm + attention + residual
        let x = x + self.attn.forward(&self.ln_1.forward(x));
        // Pre-norm + MLP + residual
        let h = self.mlp.forward(&self.ln_2.forward(&x));
        x + h
    }
}

// ============================================================================
// Main Model
// ============================================================================

#[derive(Debug)]
pub struct GptForCausalLM {
    var_store: nn::VarStore,
    wte: nn::Embedding,
    wpe: nn::Embedding,
    blocks: Vec<Block>,
    ln_f: nn::LayerNorm,
    /// Same tensor as `wte.ws`.
    lm_head: Tensor,
    config: GptConfig,
    device: Device,
}

impl GptForCausalLM {
    pub fn new(
        config: GptConfig,
        device: Device,
        attn_implementation: AttentionImplementation,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;

        let var_store = nn::VarStore::new(device);
        let _no_grad = tch::no_grad_guard();
        let transformer = var_store.root() / "transformer";

        let wte = init::embedding(
            &transformer / "wte",
            config.vocab_size as i64,
            config.n_embd as i64,
        );
        let wpe = init::embedding(
            &transformer / "wpe",
            config.block_size as i64,
            config.n_embd as i64,
        );

        let mask = causal_mask(config.block_size as i64, device);
        let blocks = (0..config.n_layer)
            .map(|i| Block::new(&transformer / "h" / i, &config, &mask, attn_implementation))
            .collect();

        let ln_f = layer_norm(&transformer / "ln_f", &config);

        // weight sharing: the head is the embedding matrix itself
        let lm_head = wte.ws.shallow_clone();

        Ok(Self {
            var_store,
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            config,
            device,
        })
    }

    /// Builds a `variant`-shaped model and imports the weights stored at `checkpoint`
    /// (a safetensors file in the published GPT-2 layout).
    pub fn from_pretrained(
        variant: Gpt2Variant,
        checkpoint: impl AsRef<Path>,
        device: Device,
        attn_implementation: AttentionImplementation,
    ) -> Result<Self, CheckpointError> {
        info!("loading weights from pretrained gpt: {variant}");
        let model = Self::new(variant.config(), device, attn_implementation)?;
        let checkpoint = Checkpoint::from_safetensors(checkpoint)?;
        model.import(&checkpoint)?;
        Ok(model)
    }

    pub fn import(&self, checkpoint: &Checkpoint) -> Result<ImportSummary, CheckpointError> {
        Ok(WeightImporter::gpt2().import(&self.state_dict(), checkpoint.tensors())?)
    }

    /// Name-sorted handles to every parameter, including the `lm_head.weight`
    /// alias of the tied embedding. Writing through a handle writes the model.
    pub fn state_dict(&self) -> BTreeMap<String, Tensor> {
        let mut state: BTreeMap<String, Tensor> =
            self.var_store.variables().into_iter().collect();
        state.insert(LM_HEAD_WEIGHT.to_string(), self.lm_head.shallow_clone());
        state
    }

    pub fn token_embedding_weight(&self) -> Tensor {
        self.wte.ws.shallow_clone()
    }

    pub fn lm_head_weight(&self) -> Tensor {
        self.lm_head.shallow_clone()
    }

    /// Final-norm hidden states `(batch, time, n_embd)`.
    fn hidden_states(&self, x: &Tensor, t: i64) -> Tensor {
        let pos = Tensor::arange(t, (Kind::Int64, x.device()));
        let pos_emb = self.wpe.forward(&pos); // (t, n_embd)
        let tok_emb = self.wte.forward(x); // (b, t, n_embd)
        let mut h = tok_emb + pos_emb;

        for block in &self.blocks {
            h = block.forward(&h);
        }

        self.ln_f.forward(&h)
    }

    pub fn num_parameters(&self) -> i64 {
        self.var_store
            .trainable_variables()
            .iter()
            .map(|t| t.numel() as i64)
            .sum()
    }
}

impl CausalLM for GptForCausalLM {
    fn forward(
        &self,
        x: &Tensor,
        targets: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>), ConfigurationError> {
        let (_, t) = check_input_ids(&self.config, x, targets)?;

        let h = self.hidden_states(x, t);
        let logits = h.linear::<Tensor>(&self.lm_head, None);

        let loss = targets.map(|targets| cross_entropy(&logits, targets));
        Ok((logits, loss))
    }

    fn config(&self) -> &GptConfig {
        &self.config
    }

    fn device(&self) -> Device {
        self.device
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.var_store
    }
}

// ============================================================================
// Tests
// ============================================================================
