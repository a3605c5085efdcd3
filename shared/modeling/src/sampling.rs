use crate::{CausalLM, ConfigurationError};
use tch::{Kind, Tensor};
use tracing::trace;

pub const DEFAULT_TOP_K: usize = 50;

#[derive(Debug)]
pub enum GenerationState {
    /// Sequences shorter than the requested length.
    Extending(Tensor),
    /// `(num_sequences, max_length)` ids, ready for decoding.
    Done(Tensor),
}

/// Top-k multinomial sampler.
#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    top_k: usize,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_K)
    }
}

impl Sampler {
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k: top_k.max(1),
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Draws one id per row from the `top_k` most likely entries of `logits`
    /// `(rows, vocab)`, returning `(rows, 1)` vocabulary ids.
    pub fn sample(&self, logits: &Tensor) -> Tensor {
        let vocab_size = logits.size()[logits.dim() - 1];
        let k = (self.top_k as i64).min(vocab_size);

        let probs = logits.to_kind(Kind::Float).softmax(-1, Kind::Float);
        let (topk_probs, topk_indices) = probs.topk(k, -1, true, true);
        // multinomial renormalizes over the k candidates
        let rank = topk_probs.multinomial(1, false);
        topk_indices.gather(-1, &rank, false)
    }

    /// One transition of the generation state machine.
    pub fn step(
        &self,
        model: &dyn CausalLM,
        state: GenerationState,
        max_length: usize,
    ) -> Result<GenerationState, ConfigurationError> {
        let sequences = match state {
            GenerationState::Done(sequences) => return Ok(GenerationState::Done(sequences)),
            GenerationState::Extending(sequences) => sequences,
        };
        let length = match sequences.size2() {
            Ok((_, t)) if t > 0 => t as usize,
            _ => return Err(ConfigurationError::InputShape(sequences.size())),
        };
        if length >= max_length {
            return Ok(GenerationState::Done(sequences));
        }

        let (logits, _) = tch::no_grad(|| model.forward(&sequences, None))?;
        let last = logits.select(1, -1);
        let next = self.sample(&last).to_kind(sequences.kind());
        trace!(length = length + 1, "sampled token column");

        let sequences = Tensor::cat(&[sequences, next], 1);
        Ok(if length + 1 >= max_length {
            GenerationState::Done(sequences)
        } else {
            GenerationState::Extending(sequences)
        })
    }

    /// Extends every row of `seed` `(num_sequences, seed_length)` until it holds
    /// `max_length` ids. A seed already at or past `max_length` is cut to it.
    /// The seed needs at least one id per row.
    pub fn generate(
        &self,
        model: &dyn CausalLM,
        seed: &Tensor,
        max_length: usize,
    ) -> Result<Tensor, ConfigurationError> {
        model.config().check_sequence_length(max_length)?;
        let seed_length = match seed.size2() {
            Ok((_, t)) if t > 0 => t as usize,
            _ => return Err(ConfigurationError::InputShape(seed.size())),
        };

        let mut state = if seed_length >= max_length {
            GenerationState::Done(seed.narrow(1, 0, max_length as i64).to(model.device()))
        } else {
            GenerationState::Extending(seed.to(model.device()))
        };
        loop {
            state = match self.step(model, state, max_length)? {
                GenerationState::Done(sequences) => return Ok(sequences),
                extending => extending,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AttentionImplementation, GptConfig, GptForCausalLM};
    use tch::Device;

    fn dummy_model() -> GptForCausalLM {
        tch::manual_seed(11);
        GptForCausalLM::new(
            GptConfig::dummy(),
            Device::Cpu,
            AttentionImplementation::Eager,
        )
        .unwrap()
    }

    #[test]
    fn test_sample_stays_in_top_k() {
        tch::manual_seed(5);
        let logits = Tensor::from_slice(&[0.0f32, 5.0, 1.0, 4.9, -3.0, 2.0]).reshape([1, 6]);
        let logits = logits.repeat([64, 1]);
        let sampled = Sampler::new(2).sample(&logits);
        assert_eq!(sampled.size(), vec![64, 1]);
        for id in Vec::<i64>::try_from(sampled.view(-1)).unwrap() {
            assert!(id == 1 || id == 3, "sampled {id} outside the top 2");
        }
    }

    #[test]
    fn test_sample_top_k_larger_than_vocab() {
        let logits = Tensor::zeros([3, 4], (Kind::Float, Device::Cpu));
        let sampled = Sampler::new(50).sample(&logits);
        let max = sampled.max().int64_value(&[]);
        assert!((0..4).contains(&max));
    }

    #[test]
    fn test_generate_reaches_max_length() {
        let model = dummy_model();
        let seed = Tensor::from_slice(&[1i64, 2, 3]).reshape([1, 3]).repeat([4, 1]);
        let out = Sampler::default().generate(&model, &seed, 20).unwrap();
        assert_eq!(out.size(), vec![4, 20]);
        assert!(out.narrow(1, 0, 3).equal(&seed));

        let min = out.min().int64_value(&[]);
        let max = out.max().int64_value(&[]);
        assert!(min >= 0 && max < model.config().vocab_size as i64);
    }

    #[test]
    fn test_generate_long_seed_is_truncated() {
        let model = dummy_model();
        let seed = Tensor::arange(10, (Kind::Int64, Device::Cpu)).reshape([1, 10]);
        let out = Sampler::default().generate(&model, &seed, 6).unwrap();
        assert_eq!(out.size(), vec![1, 6]);
        assert!(out.equal(&seed.narrow(1, 0, 6)));
    }

    #[test]
    fn test_generate_long_seed_lands_on_model_device() {
        let model = dummy_model();
        let seed = Tensor::arange(8, (Kind::Int64, Device::Cpu)).reshape([1, 8]);
        let out = Sampler::default().generate(&model, &seed, 4).unwrap();
        assert_eq!(out.device(), model.device());
    }

    #[test]
    fn test_generate_rejects_empty_seed() {
        let model = dummy_model();
        let seed = Tensor::zeros([2, 0], (Kind::Int64, Device::Cpu));
        assert_eq!(
            Sampler::default().generate(&model, &seed, 10).err(),
            Some(ConfigurationError::InputShape(vec![2, 0]))
        );
        assert!(matches!(
            Sampler::default().step(&model, GenerationState::Extending(seed), 10),
            Err(ConfigurationError::InputShape(_))
        ));
    }

    #[test]
    fn test_generate_rejects_length_beyond_block_size() {
        let model = dummy_model();
        let seed = Tensor::zeros([1, 2], (Kind::Int64, Device::Cpu));
        assert_eq!(
            Sampler::default().generate(&model, &seed, 65).err(),
            Some(ConfigurationError::SequenceTooLong {
                length: 65,
                block_size: 64
            })
        );
    }

    #[test]
    fn test_step_is_a_state_machine() {
        let model = dummy_model();
        let sampler = Sampler::default();
        let seed = Tensor::zeros([2, 4], (Kind::Int64, Device::Cpu));

        let state = sampler
            .step(&model, GenerationState::Extending(seed), 6)
            .unwrap();
        let GenerationState::Extending(sequences) = state else {
            panic!("one column short of max_length should still be extending");
        };
        assert_eq!(sequences.size(), vec![2, 5]);

        let state = sampler
            .step(&model, GenerationState::Extending(sequences), 6)
            .unwrap();
        assert!(matches!(state, GenerationState::Done(ref s) if s.size() == vec![2, 6]));
    }
}
