use crate::{
    metrics::{MetricsRecorder, StepMetrics},
    AttentionImplementation, BatchSource, CausalLM, ConfigurationError, ExecutionEnvironment,
    GptConfig, GptForCausalLM, OptimizerDefinition, TokenCodec, Trainer,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc};
use tracing::info;

/// Everything that determines one training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub model: GptConfig,
    pub corpus: PathBuf,
    pub steps: u32,
    pub batch_size: usize,
    pub sequence_length: usize,
    #[serde(default)]
    pub optimizer: OptimizerDefinition,
    #[serde(default)]
    pub attn_implementation: AttentionImplementation,
    #[serde(default)]
    pub metrics_output: Option<PathBuf>,
    #[serde(default)]
    pub seed: Option<i64>,
}

pub struct ExperimentReport {
    pub metrics: Vec<StepMetrics>,
    pub model: Box<dyn CausalLM>,
}

/// Trains a freshly initialized model on a corpus for a fixed number of steps.
pub struct Experiment {
    config: ExperimentConfig,
    env: ExecutionEnvironment,
    codec: Arc<dyn TokenCodec>,
}

impl Experiment {
    pub fn new(
        config: ExperimentConfig,
        env: ExecutionEnvironment,
        codec: Arc<dyn TokenCodec>,
    ) -> Result<Self> {
        config.model.validate()?;
        config.model.check_sequence_length(config.sequence_length)?;
        if codec.vocab_size() != config.model.vocab_size {
            return Err(ConfigurationError::VocabularyMismatch {
                tokenizer: codec.vocab_size(),
                model: config.model.vocab_size,
            }
            .into());
        }
        Ok(Self { config, env, codec })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn run(self) -> Result<ExperimentReport> {
        let config = &self.config;
        crate::set_torch_rng_seed(config.seed);

        let mut source = BatchSource::from_corpus(
            &config.corpus,
            self.codec.as_ref(),
            config.batch_size,
            config.sequence_length,
        )
        .with_context(|| format!("failed to load corpus {}", config.corpus.display()))?;

        let model = GptForCausalLM::new(config.model, self.env.device(), config.attn_implementation)?;
        info!(
            parameters = model.num_parameters(),
            device = %self.env.devices,
            precision = ?self.env.precision,
            "initialized model"
        );
        let mut trainer = Trainer::new(Box::new(model), config.optimizer, self.env)?;

        let mut recorder = match &config.metrics_output {
            Some(path) => MetricsRecorder::new(path)
                .with_context(|| format!("failed to open metrics file {}", path.display()))?,
            None => MetricsRecorder::disabled(),
        };

        let mut metrics = Vec::with_capacity(config.steps as usize);
        for _ in 0..config.steps {
            let batch = source.next_batch();
            let output = trainer.train_step(&batch)?;
            let step = StepMetrics::new(
                output.step,
                output.loss,
                output.learning_rate,
                output.duration,
                output.tokens,
            )
            .with_grad_norm(output.grad_norm);
            recorder.record(&step)?;
            metrics.push(step);
        }

        if let Some(last) = metrics.last() {
            info!(steps = metrics.len(), final_loss = last.loss, "training finished");
        }
        Ok(ExperimentReport {
            metrics,
            model: trainer.into_model(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ByteTokenizer, Devices, Precision};

    fn config(corpus: PathBuf) -> ExperimentConfig {
        ExperimentConfig {
            model: GptConfig::dummy(),
            corpus,
            steps: 3,
            batch_size: 2,
            sequence_length: 16,
            optimizer: OptimizerDefinition::default(),
            attn_implementation: AttentionImplementation::Eager,
            metrics_output: None,
            seed: Some(1337),
        }
    }

    #[test]
    fn test_experiment_rejects_vocab_mismatch() {
        let mut config = config(PathBuf::from("unused.txt"));
        config.model.vocab_size = 512;
        let err = Experiment::new(config, ExecutionEnvironment::cpu(), Arc::new(ByteTokenizer))
            .err()
            .unwrap();
        assert_eq!(
            err.downcast_ref::<ConfigurationError>(),
            Some(&ConfigurationError::VocabularyMismatch {
                tokenizer: 256,
                model: 512
            })
        );
    }

    #[test]
    fn test_experiment_missing_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let experiment = Experiment::new(
            config(dir.path().join("missing.txt")),
            ExecutionEnvironment::cpu(),
            Arc::new(ByteTokenizer),
        )
        .unwrap();
        let err = experiment.run().err().unwrap();
        assert!(err
            .downcast_ref::<crate::BatchSourceError>()
            .is_some_and(|err| matches!(err, crate::BatchSourceError::ResourceNotFound { .. })));
    }

    #[test]
    fn test_experiment_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = dir.path().join("input.txt");
        std::fs::write(&corpus, "the quick brown fox jumps over the lazy dog. ".repeat(20)).unwrap();

        let run = || {
            Experiment::new(
                config(corpus.clone()),
                ExecutionEnvironment::new(Devices::Cpu, Precision::Full),
                Arc::new(ByteTokenizer),
            )
            .unwrap()
            .run()
            .unwrap()
        };
        let first = run();
        let second = run();
        assert_eq!(first.metrics.len(), 3);
        for (a, b) in first.metrics.iter().zip(&second.metrics) {
            assert_eq!(a.step, b.step);
            assert!((a.loss - b.loss).abs() < 1e-6);
        }
    }
}
