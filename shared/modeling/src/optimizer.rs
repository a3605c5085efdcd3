use crate::CausalLM;
use serde::{Deserialize, Serialize};
use tch::{COptimizer, TchError};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum OptimizerDefinition {
    AdamW {
        learning_rate: f64,
        betas: [f32; 2],
        weight_decay: f32,
        eps: f32,
        /// Global gradient-norm ceiling applied before every step.
        #[serde(default)]
        clip_grad_norm: Option<f32>,
    },
}

impl Default for OptimizerDefinition {
    fn default() -> Self {
        OptimizerDefinition::AdamW {
            learning_rate: 3e-4,
            betas: [0.9, 0.999],
            weight_decay: 0.01,
            eps: 1e-8,
            clip_grad_norm: None,
        }
    }
}

impl OptimizerDefinition {
    pub fn learning_rate(&self) -> f64 {
        match self {
            OptimizerDefinition::AdamW { learning_rate, .. } => *learning_rate,
        }
    }
}

pub enum Optimizer {
    Torch {
        optimizer: COptimizer,
        clip_grad_norm: Option<f32>,
    },
}

impl Optimizer {
    /// Registers every trainable parameter of `model`. Tied parameters are one
    /// tensor in the var store, so they are registered (and decayed) once.
    pub fn new(definition: OptimizerDefinition, model: &dyn CausalLM) -> Result<Self, TchError> {
        match definition {
            OptimizerDefinition::AdamW {
                learning_rate,
                betas,
                weight_decay,
                eps,
                clip_grad_norm,
            } => {
                let mut adamw = COptimizer::adamw(
                    learning_rate,
                    betas[0] as f64,
                    betas[1] as f64,
                    weight_decay as f64,
                    eps as f64,
                    false,
                )?;
                for tensor in model.var_store().trainable_variables() {
                    adamw.add_parameters(&tensor, 0)?;
                }
                Ok(Self::Torch {
                    optimizer: adamw,
                    clip_grad_norm,
                })
            }
        }
    }

    pub fn zero_grad(&mut self) -> Result<(), TchError> {
        match self {
            Optimizer::Torch { optimizer, .. } => optimizer.zero_grad(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) -> Result<(), TchError> {
        match self {
            Optimizer::Torch { optimizer, .. } => optimizer.set_learning_rate(lr),
        }
    }

    /// Clips (if configured) and applies the accumulated gradients.
    /// Returns the pre-clip gradient norm when clipping is enabled.
    pub fn step(&mut self, model: &dyn CausalLM) -> Result<Option<f64>, TchError> {
        match self {
            Optimizer::Torch {
                optimizer,
                clip_grad_norm,
            } => {
                let grad_norm = match clip_grad_norm {
                    Some(max_norm) if *max_norm > 0. => {
                        let norm = model.clip_grad_norm(*max_norm as f64);
                        trace!(grad_norm = norm, max_norm = *max_norm, "clipped gradients");
                        Some(norm)
                    }
                    _ => None,
                };
                optimizer.step()?;
                Ok(grad_norm)
            }
        }
    }
}
