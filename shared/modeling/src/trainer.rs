use crate::{Batch, CausalLM, ExecutionEnvironment, Optimizer, OptimizerDefinition};
use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct TrainOutput {
    pub step: u32,
    pub loss: f64,
    pub learning_rate: f64,
    /// Pre-clip gradient norm, only measured when clipping is enabled.
    pub grad_norm: Option<f64>,
    pub duration: Duration,
    pub tokens: i64,
}

impl TrainOutput {
    pub fn tokens_per_sec(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.tokens as f64 / secs
        } else {
            0.0
        }
    }
}

/// Single-device trainer. Every `train_step` fully finishes its update before returning.
pub struct Trainer {
    model: Box<dyn CausalLM>,
    optimizer: Optimizer,
    learning_rate: f64,
    env: ExecutionEnvironment,
    step: u32,
}

impl Trainer {
    pub fn new(
        model: Box<dyn CausalLM>,
        optimizer: OptimizerDefinition,
        env: ExecutionEnvironment,
    ) -> Result<Self> {
        let learning_rate = optimizer.learning_rate();
        let optimizer = Optimizer::new(optimizer, model.as_ref())
            .context("failed to build optimizer")?;
        Ok(Self {
            model,
            optimizer,
            learning_rate,
            env,
            step: 0,
        })
    }

    pub fn model(&self) -> &dyn CausalLM {
        self.model.as_ref()
    }

    pub fn into_model(self) -> Box<dyn CausalLM> {
        self.model
    }

    /// Number of completed steps.
    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) -> Result<()> {
        self.optimizer.set_learning_rate(learning_rate)?;
        self.learning_rate = learning_rate;
        Ok(())
    }

    pub fn train_step(&mut self, batch: &Batch) -> Result<TrainOutput> {
        let start = Instant::now();
        let batch = batch.to(self.model.device());

        self.optimizer.zero_grad()?;
        let model = self.model.as_ref();
        let (_, loss) = self
            .env
            .run_with_precision(|| model.forward(&batch.input, Some(&batch.target)))?;
        let loss = loss.ok_or_else(|| anyhow!("forward with targets returned no loss"))?;
        loss.backward();
        let grad_norm = self.optimizer.step(model)?;

        // reading the scalar waits for the device to finish the step
        let loss = loss.double_value(&[]);
        let duration = start.elapsed();
        let output = TrainOutput {
            step: self.step,
            loss,
            learning_rate: self.learning_rate,
            grad_norm,
            duration,
            tokens: batch.num_tokens(),
        };

        if !loss.is_finite() {
            warn!(step = self.step, loss, "non-finite training loss");
        }
        info!(
            step = self.step,
            loss = format!("{loss:.4}"),
            duration_ms = format!("{:.2}", duration.as_secs_f64() * 1000.0),
            tokens_per_sec = format!("{:.0}", output.tokens_per_sec()),
            "train step"
        );

        self.step += 1;
        Ok(output)
    }
}
