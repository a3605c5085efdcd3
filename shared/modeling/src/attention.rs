use crate::{
    init::{self, ProjectionRole},
    GptConfig,
};
use tch::{nn::Module, Device, Kind, Tensor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionImplementation {
    /// Explicit scores, mask and softmax.
    #[default]
    Eager,
    /// libtorch's fused scaled-dot-product attention.
    Sdpa,
}

/// Lower-triangular boolean matrix of shape `(1, 1, block_size, block_size)`.
/// Entry `(i, j)` is true when query `i` may attend to key `j`.
pub fn causal_mask(block_size: i64, device: Device) -> Tensor {
    Tensor::ones([block_size, block_size], (Kind::Float, device))
        .tril(0)
        .to_kind(Kind::Bool)
        .reshape([1, 1, block_size, block_size])
}

#[derive(Debug)]
pub struct CausalSelfAttention {
    c_attn: tch::nn::Linear,
    c_proj: tch::nn::Linear,
    n_head: i64,
    n_embd: i64,
    head_dim: i64,
    mask: Tensor,
    attn_implementation: AttentionImplementation,
}

impl CausalSelfAttention {
    /// `mask` is the model-wide causal mask; it is shared, never copied.
    pub fn new(
        vs: tch::nn::Path,
        config: &GptConfig,
        mask: &Tensor,
        attn_implementation: AttentionImplementation,
    ) -> Self {
        let n_embd = config.n_embd as i64;
        let c_attn = init::linear(
            &vs / "c_attn",
            n_embd,
            3 * n_embd,
            ProjectionRole::Standard,
            config,
        );
        let c_proj = init::linear(
            &vs / "c_proj",
            n_embd,
            n_embd,
            ProjectionRole::ResidualOutput,
            config,
        );

        Self {
            c_attn,
            c_proj,
            n_head: config.n_head as i64,
            n_embd,
            head_dim: config.head_dim() as i64,
            mask: mask.shallow_clone(),
            attn_implementation,
        }
    }

    /// Splits the fused projection into per-head `(b, n_head, t, head_dim)` q, k, v.
    fn qkv(&self, x: &Tensor, b: i64, t: i64) -> (Tensor, Tensor, Tensor) {
        let qkv = self.c_attn.forward(x);
        let head = |index: i64| {
            qkv.narrow(2, index * self.n_embd, self.n_embd)
                .contiguous()
                .reshape([b, t, self.n_head, self.head_dim])
                .transpose(1, 2)
        };
        (head(0), head(1), head(2))
    }

    fn scale(&self) -> f64 {
        1.0 / (self.head_dim as f64).sqrt()
    }

    /// Row-stochastic attention weights `(b, n_head, t, t)`; future keys get zero weight.
    fn attention_weights(&self, q: &Tensor, k: &Tensor) -> Tensor {
        let t = q.size()[2];
        let att = q.matmul(&k.transpose(-2, -1)) * self.scale();
        let allowed = self.mask.narrow(2, 0, t).narrow(3, 0, t);
        let att = att.masked_fill(&allowed.logical_not(), f64::NEG_INFINITY);
        att.softmax(-1, att.kind())
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let size = x.size();
        let (b, t) = (size[0], size[1]);
        let (q, k, v) = self.qkv(x, b, t);

        let y = match self.attn_implementation {
            AttentionImplementation::Eager => self.attention_weights(&q, &k).matmul(&v),
            AttentionImplementation::Sdpa => Tensor::scaled_dot_product_attention::<Tensor>(
                &q,
                &k,
                &v,
                None,
                0.0,
                t > 1,
                Some(self.scale()),
                false,
            ),
        };
        let y = y.transpose(1, 2).contiguous().reshape([b, t, self.n_embd]);

        self.c_proj.forward(&y)
    }
}
