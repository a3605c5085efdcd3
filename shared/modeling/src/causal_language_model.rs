use crate::{ConfigurationError, GptConfig};
use tch::{nn, Device, Kind, Tensor};

/// A next-token predictor that can be trained and sampled from.
/// Implementors own their parameters; callers only see them through `var_store`.
pub trait CausalLM: Send {
    /// Returns `(logits, loss)`. `loss` is `Some` exactly when `targets` is.
    ///
    /// `x` and `targets` are `(batch, time)` id matrices; `targets[i][t]` is the
    /// token that should follow `x[i][t]`.
    fn forward(
        &self,
        x: &Tensor,
        targets: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>), ConfigurationError>;
    fn config(&self) -> &GptConfig;
    fn device(&self) -> Device;
    fn var_store(&self) -> &nn::VarStore;

    fn max_context_length(&self) -> usize {
        self.config().block_size
    }

    fn vocab_size(&self) -> usize {
        self.config().vocab_size
    }

    /// Rescales gradients so their global L2 norm is at most `max_norm`.
    /// Returns the norm measured before rescaling.
    fn clip_grad_norm(&self, max_norm: f64) -> f64 {
        let variables = self.var_store().trainable_variables();
        let mut norm_sq = Tensor::zeros([], (Kind::Float, self.device()));
        for var in &variables {
            let grad = var.grad();
            if grad.defined() {
                let local_norm = grad.to_kind(Kind::Float).norm();
                norm_sq += &local_norm * &local_norm;
            }
        }
        let total_norm = norm_sq.sqrt().double_value(&[]);

        if total_norm > max_norm {
            let scale = max_norm / (total_norm + 1e-6);
            tch::no_grad(|| {
                for var in &variables {
                    let mut grad = var.grad();
                    if grad.defined() {
                        let _ = grad.g_mul_scalar_(scale);
                    }
                }
            });
        }
        total_norm
    }
}

/// Mean cross-entropy over every `(batch, time)` position.
pub fn cross_entropy(logits: &Tensor, targets: &Tensor) -> Tensor {
    // upcast so reduced-precision logits don't lose the loss
    let logits = logits.to_kind(Kind::Float);
    let vocab_size = logits.size()[logits.dim() - 1];
    logits
        .view([-1i64, vocab_size])
        .cross_entropy_loss::<Tensor>(
            &targets.view(-1).to_kind(Kind::Int64),
            None,
            tch::Reduction::Mean,
            -100,
            0.0,
        )
}

/// Validates a `(batch, time)` id matrix against `config`, returning `(batch, time)`.
pub fn check_input_ids(
    config: &GptConfig,
    x: &Tensor,
    targets: Option<&Tensor>,
) -> Result<(i64, i64), ConfigurationError> {
    let (b, t) = x
        .size2()
        .map_err(|_| ConfigurationError::InputShape(x.size()))?;
    config.check_sequence_length(t as usize)?;
    if let Some(targets) = targets {
        if targets.size() != x.size() {
            return Err(ConfigurationError::TargetShape {
                inputs: x.size(),
                targets: targets.size(),
            });
        }
    }
    Ok((b, t))
}
