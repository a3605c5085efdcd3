//! Copying externally trained GPT-2 weights onto [`crate::GptForCausalLM`].
//!
//! The published checkpoints store the four attention / MLP projection matrices of
//! every block as `(in_features, out_features)` ("Conv1D" layout), while our layers
//! use `(out_features, in_features)`. Those four are transposed on the way in;
//! everything else is copied as-is.

use crate::{ConfigurationError, LM_HEAD_WEIGHT, TOKEN_EMBEDDING_WEIGHT};
use std::{collections::BTreeMap, path::Path};
use tch::Tensor;
use thiserror::Error;
use tracing::debug;

const TRANSFORMER_PREFIX: &str = "transformer.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StructuralMismatchError {
    #[error("mismatched keys: {source_count} != {destination_count}")]
    ParameterCount {
        source_count: usize,
        destination_count: usize,
    },

    #[error("checkpoint parameter {0} has no counterpart in the model")]
    MissingParameter(String),

    #[error("shape mismatch for {name}: model expects {expected:?}, checkpoint has {found:?} (stored transposed: {transposed})")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
        transposed: bool,
    },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read safetensors checkpoint: {0}")]
    Read(#[from] tch::TchError),

    #[error(transparent)]
    StructuralMismatch(#[from] StructuralMismatchError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// A named-tensor mapping in this crate's naming convention.
#[derive(Debug)]
pub struct Checkpoint {
    tensors: BTreeMap<String, Tensor>,
}

impl Checkpoint {
    /// Accepts both `transformer.`-prefixed names and the bare names used by the
    /// published safetensors files. A missing `lm_head.weight` is filled in from the
    /// token embedding, since the two are tied.
    pub fn new(tensors: impl IntoIterator<Item = (String, Tensor)>) -> Self {
        let mut tensors: BTreeMap<String, Tensor> = tensors
            .into_iter()
            .map(|(name, tensor)| {
                let name = if name.starts_with(TRANSFORMER_PREFIX) || name == LM_HEAD_WEIGHT {
                    name
                } else {
                    format!("{TRANSFORMER_PREFIX}{name}")
                };
                (name, tensor)
            })
            .collect();

        if !tensors.contains_key(LM_HEAD_WEIGHT) {
            if let Some(wte) = tensors.get(TOKEN_EMBEDDING_WEIGHT) {
                let head = wte.shallow_clone();
                tensors.insert(LM_HEAD_WEIGHT.to_string(), head);
            }
        }

        Self { tensors }
    }

    pub fn from_safetensors(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        let tensors = Tensor::read_safetensors(path)?;
        debug!(
            path = %path.display(),
            tensors = tensors.len(),
            "read safetensors checkpoint"
        );
        Ok(Self::new(tensors))
    }

    pub fn tensors(&self) -> &BTreeMap<String, Tensor> {
        &self.tensors
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub copied: usize,
    pub transposed: usize,
}

/// Maps a foreign checkpoint onto a model's parameter handles.
#[derive(Debug, Clone)]
pub struct WeightImporter {
    /// Suffixes of parameters stored transposed in the source.
    transposed: Vec<&'static str>,
    /// Suffixes of buffers that are not parameters on either side.
    ignored: Vec<&'static str>,
}

impl WeightImporter {
    pub fn gpt2() -> Self {
        Self {
            transposed: vec![
                "attn.c_attn.weight",
                "attn.c_proj.weight",
                "mlp.c_fc.weight",
                "mlp.c_proj.weight",
            ],
            ignored: vec![".attn.bias", ".attn.masked_bias"],
        }
    }

    pub fn is_transposed(&self, name: &str) -> bool {
        self.transposed.iter().any(|suffix| name.ends_with(suffix))
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignored.iter().any(|suffix| name.ends_with(suffix))
    }

    /// Validates every name and shape first, then copies. Either all of
    /// `destination` is overwritten or none of it is.
    pub fn import(
        &self,
        destination: &BTreeMap<String, Tensor>,
        source: &BTreeMap<String, Tensor>,
    ) -> Result<ImportSummary, StructuralMismatchError> {
        let source: Vec<(&String, &Tensor)> = source
            .iter()
            .filter(|(name, _)| !self.is_ignored(name))
            .collect();
        let destination_count = destination
            .keys()
            .filter(|name| !self.is_ignored(name))
            .count();

        if source.len() != destination_count {
            return Err(StructuralMismatchError::ParameterCount {
                source_count: source.len(),
                destination_count,
            });
        }

        let mut plan = Vec::with_capacity(source.len());
        for (name, src) in source {
            let dst = destination
                .get(name)
                .ok_or_else(|| StructuralMismatchError::MissingParameter(name.clone()))?;
            let transposed = self.is_transposed(name);
            let found = if transposed {
                src.size().into_iter().rev().collect::<Vec<_>>()
            } else {
                src.size()
            };
            if found != dst.size() {
                return Err(StructuralMismatchError::ShapeMismatch {
                    name: name.clone(),
                    expected: dst.size(),
                    found: src.size(),
                    transposed,
                });
            }
            plan.push((name, dst, src, transposed));
        }

        let mut summary = ImportSummary::default();
        tch::no_grad(|| {
            for (name, dst, src, transposed) in plan {
                let mut dst = dst.shallow_clone();
                if transposed {
                    dst.copy_(&src.tr());
                    summary.transposed += 1;
                } else {
                    dst.copy_(src);
                }
                summary.copied += 1;
                debug!(name = name.as_str(), transposed, "imported parameter");
            }
        });
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AttentionImplementation, CausalLM, GptConfig, GptForCausalLM};
    use tch::{Device, Kind};

    fn dummy_model() -> GptForCausalLM {
        GptForCausalLM::new(
            GptConfig::dummy(),
            Device::Cpu,
            AttentionImplementation::Eager,
        )
        .unwrap()
    }

    /// A checkpoint shaped like the published files, with distinctive values.
    fn synthetic_source(model: &GptForCausalLM) -> BTreeMap<String, Tensor> {
        let importer = WeightImporter::gpt2();
        model
            .state_dict()
            .into_iter()
            .enumerate()
            .map(|(i, (name, tensor))| {
                let mut shape = tensor.size();
                if importer.is_transposed(&name) {
                    shape.reverse();
                }
                let numel: i64 = shape.iter().product();
                let values = Tensor::arange(numel, (Kind::Float, Device::Cpu))
                    .reshape(shape.as_slice())
                    / 1000.0
                    + i as f64;
                (name, values)
            })
            .collect()
    }

    #[test]
    fn test_import_transposes_conv1d_weights() {
        let model = dummy_model();
        let mut source = synthetic_source(&model);
        // the model's own wte/lm_head are tied, keep the source consistent with that
        let wte = source[TOKEN_EMBEDDING_WEIGHT].shallow_clone();
        source.insert(LM_HEAD_WEIGHT.to_string(), wte);

        let summary = WeightImporter::gpt2()
            .import(&model.state_dict(), &source)
            .unwrap();
        assert_eq!(summary.copied, source.len());
        assert_eq!(summary.transposed, 4 * model.config().n_layer);

        let state = model.state_dict();
        let c_attn = "transformer.h.1.attn.c_attn.weight";
        assert_eq!(state[c_attn].size(), vec![192, 64]);
        assert!(state[c_attn].equal(&source[c_attn].tr()));

        let ln = "transformer.h.0.ln_2.bias";
        assert!(state[ln].equal(&source[ln]));
        assert!(state[TOKEN_EMBEDDING_WEIGHT].equal(&source[TOKEN_EMBEDDING_WEIGHT]));
        assert!(model.lm_head_weight().equal(&source[TOKEN_EMBEDDING_WEIGHT]));
    }

    #[test]
    fn test_import_ignores_buffers() {
        let model = dummy_model();
        let mut source = synthetic_source(&model);
        source.insert(
            "transformer.h.0.attn.bias".to_string(),
            Tensor::ones([1, 1, 64, 64], (Kind::Float, Device::Cpu)),
        );
        source.insert(
            "transformer.h.0.attn.masked_bias".to_string(),
            Tensor::from(-1e4f32),
        );
        assert!(WeightImporter::gpt2()
            .import(&model.state_dict(), &source)
            .is_ok());
    }

    #[test]
    fn test_import_count_mismatch() {
        let model = dummy_model();
        let before = model.state_dict()["transformer.wpe.weight"].copy();
        let mut source = synthetic_source(&model);
        source.remove("transformer.h.0.mlp.c_fc.bias");

        let err = WeightImporter::gpt2()
            .import(&model.state_dict(), &source)
            .unwrap_err();
        assert_eq!(
            err,
            StructuralMismatchError::ParameterCount {
                source_count: source.len(),
                destination_count: source.len() + 1,
            }
        );
        // nothing was written
        assert!(model.state_dict()["transformer.wpe.weight"].equal(&before));
    }

    #[test]
    fn test_import_missing_parameter() {
        let model = dummy_model();
        let mut source = synthetic_source(&model);
        let bias = source.remove("transformer.ln_f.bias").unwrap();
        source.insert("transformer.ln_f.beta".to_string(), bias);

        assert_eq!(
            WeightImporter::gpt2().import(&model.state_dict(), &source),
            Err(StructuralMismatchError::MissingParameter(
                "transformer.ln_f.beta".to_string()
            ))
        );
    }

    #[test]
    fn test_import_shape_mismatch() {
        let model = dummy_model();
        let mut source = synthetic_source(&model);
        // stored in our layout instead of the transposed one
        source.insert(
            "transformer.h.0.mlp.c_fc.weight".to_string(),
            Tensor::zeros([256, 64], (Kind::Float, Device::Cpu)),
        );

        let err = WeightImporter::gpt2()
            .import(&model.state_dict(), &source)
            .unwrap_err();
        assert!(matches!(
            err,
            StructuralMismatchError::ShapeMismatch {
                transposed: true,
                ..
            }
        ));
    }

    #[test]
    fn test_checkpoint_normalizes_hub_names() {
        let checkpoint = Checkpoint::new([
            ("wte.weight".to_string(), Tensor::ones([4, 2], tch::kind::FLOAT_CPU)),
            ("h.0.attn.c_attn.weight".to_string(), Tensor::ones([2, 6], tch::kind::FLOAT_CPU)),
            ("transformer.ln_f.bias".to_string(), Tensor::ones([2], tch::kind::FLOAT_CPU)),
        ]);
        let names = checkpoint.tensors().keys().cloned().collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "lm_head.weight",
                "transformer.h.0.attn.c_attn.weight",
                "transformer.ln_f.bias",
                "transformer.wte.weight",
            ]
        );
    }

    #[test]
    fn test_model_import_from_safetensors() {
        let source_model = dummy_model();
        let importer = WeightImporter::gpt2();
        // write the file the way the hub does: bare names, Conv1D layout, no lm_head
        let hub_tensors = source_model
            .state_dict()
            .into_iter()
            .filter(|(name, _)| name != LM_HEAD_WEIGHT)
            .map(|(name, tensor)| {
                let tensor = if importer.is_transposed(&name) {
                    tensor.detach().tr().contiguous()
                } else {
                    tensor.detach()
                };
                (name.trim_start_matches(TRANSFORMER_PREFIX).to_string(), tensor)
            })
            .collect::<Vec<_>>();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        Tensor::write_safetensors(&hub_tensors, &path).unwrap();

        tch::manual_seed(1234);
        let model = dummy_model();
        let checkpoint = Checkpoint::from_safetensors(&path).unwrap();
        model.import(&checkpoint).unwrap();

        let ids = Tensor::randint(256, [1, 12], (Kind::Int64, Device::Cpu));
        let (expected, _) = source_model.forward(&ids, None).unwrap();
        let (actual, _) = model.forward(&ids, None).unwrap();
        let diff = (expected - actual).abs().max().double_value(&[]);
        assert!(diff < 1e-5, "imported model diverges by {diff}");
    }
}
