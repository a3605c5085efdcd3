use clap::ValueEnum;
use std::{fmt, path::Path, str::FromStr};
use thiserror::Error;

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("n_embd ({n_embd}) must be divisible by n_head ({n_head})")]
    HeadsDoNotDivideEmbedding { n_embd: usize, n_head: usize },

    #[error("config field {0} must be non-zero")]
    ZeroDimension(&'static str),

    #[error("cannot forward sequence of length {length}, block size is only {block_size}")]
    SequenceTooLong { length: usize, block_size: usize },

    #[error("expected token ids of shape (batch, time), got {0:?}")]
    InputShape(Vec<i64>),

    #[error("targets of shape {targets:?} do not match inputs of shape {inputs:?}")]
    TargetShape { inputs: Vec<i64>, targets: Vec<i64> },

    #[error("tokenizer vocabulary ({tokenizer}) does not match model vocab_size ({model})")]
    VocabularyMismatch { tokenizer: usize, model: usize },
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] ConfigurationError),
}

/// Shape of a GPT-2 style decoder.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct GptConfig {
    /// Maximum context length.
    pub block_size: usize,
    pub vocab_size: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

impl Default for GptConfig {
    fn default() -> Self {
        Gpt2Variant::Small.config()
    }
}

impl GptConfig {
    pub fn new(
        block_size: usize,
        vocab_size: usize,
        n_embd: usize,
        n_head: usize,
        n_layer: usize,
    ) -> Result<Self, ConfigurationError> {
        let config = Self {
            block_size,
            vocab_size,
            n_embd,
            n_head,
            n_layer,
            layer_norm_epsilon: default_layer_norm_epsilon(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Tiny config for tests and smoke runs.
    pub fn dummy() -> Self {
        Self {
            block_size: 64,
            vocab_size: 256,
            n_embd: 64,
            n_head: 4,
            n_layer: 2,
            layer_norm_epsilon: default_layer_norm_epsilon(),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (name, value) in [
            ("block_size", self.block_size),
            ("vocab_size", self.vocab_size),
            ("n_embd", self.n_embd),
            ("n_head", self.n_head),
            ("n_layer", self.n_layer),
        ] {
            if value == 0 {
                return Err(ConfigurationError::ZeroDimension(name));
            }
        }
        if self.n_embd % self.n_head != 0 {
            return Err(ConfigurationError::HeadsDoNotDivideEmbedding {
                n_embd: self.n_embd,
                n_head: self.n_head,
            });
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Fails if a sequence of `length` tokens can't be fed through the model.
    pub fn check_sequence_length(&self, length: usize) -> Result<(), ConfigurationError> {
        if length > self.block_size {
            return Err(ConfigurationError::SequenceTooLong {
                length,
                block_size: self.block_size,
            });
        }
        Ok(())
    }

    /// Canonical parameter names, in the layout the model registers them.
    pub fn get_parameter_names(&self) -> Vec<String> {
        let mut variables = vec![
            "transformer.wte.weight".to_string(),
            "transformer.wpe.weight".to_string(),
        ];
        for layer_idx in 0..self.n_layer {
            let prefix = format!("transformer.h.{layer_idx}");
            for suffix in [
                "ln_1.weight",
                "ln_1.bias",
                "attn.c_attn.weight",
                "attn.c_attn.bias",
                "attn.c_proj.weight",
                "attn.c_proj.bias",
                "ln_2.weight",
                "ln_2.bias",
                "mlp.c_fc.weight",
                "mlp.c_fc.bias",
                "mlp.c_proj.weight",
                "mlp.c_proj.bias",
            ] {
                variables.push(format!("{prefix}.{suffix}"));
            }
        }
        variables.push("transformer.ln_f.weight".to_string());
        variables.push("transformer.ln_f.bias".to_string());
        variables.push("lm_head.weight".to_string());
        variables
    }
}

/// The published GPT-2 checkpoint sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Gpt2Variant {
    Small,
    Medium,
    Large,
    Xl,
}

impl Gpt2Variant {
    pub const VOCAB_SIZE: usize = 50257;
    pub const BLOCK_SIZE: usize = 1024;

    pub fn config(&self) -> GptConfig {
        let (n_layer, n_head, n_embd) = match self {
            Gpt2Variant::Small => (12, 12, 768),  // 124M params
            Gpt2Variant::Medium => (24, 16, 1024), // 350M params
            Gpt2Variant::Large => (36, 20, 1280), // 774M params
            Gpt2Variant::Xl => (48, 25, 1600),    // 1558M params
        };
        GptConfig {
            block_size: Self::BLOCK_SIZE,
            vocab_size: Self::VOCAB_SIZE,
            n_embd,
            n_head,
            n_layer,
            layer_norm_epsilon: default_layer_norm_epsilon(),
        }
    }

    pub fn repo_id(&self) -> &'static str {
        match self {
            Gpt2Variant::Small => "gpt2",
            Gpt2Variant::Medium => "gpt2-medium",
            Gpt2Variant::Large => "gpt2-large",
            Gpt2Variant::Xl => "gpt2-xl",
        }
    }
}

impl fmt::Display for Gpt2Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repo_id())
    }
}

#[derive(Debug, Error)]
#[error("unknown GPT-2 variant '{0}', expected one of gpt2, gpt2-medium, gpt2-large, gpt2-xl")]
pub struct UnknownVariant(String);

impl FromStr for Gpt2Variant {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gpt2" | "small" => Ok(Gpt2Variant::Small),
            "gpt2-medium" | "medium" => Ok(Gpt2Variant::Medium),
            "gpt2-large" | "large" => Ok(Gpt2Variant::Large),
            "gpt2-xl" | "xl" => Ok(Gpt2Variant::Xl),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_dummy_is_valid() {
        let config = GptConfig::dummy();
        assert!(config.validate().is_ok());
        assert_eq!(config.head_dim(), 16);
    }

    #[test]
    fn test_config_rejects_indivisible_heads() {
        assert_eq!(
            GptConfig::new(64, 256, 66, 4, 2),
            Err(ConfigurationError::HeadsDoNotDivideEmbedding {
                n_embd: 66,
                n_head: 4
            })
        );
    }

    #[test]
    fn test_config_rejects_zero_dimension() {
        assert_eq!(
            GptConfig::new(64, 256, 64, 0, 2),
            Err(ConfigurationError::ZeroDimension("n_head"))
        );
        assert_eq!(
            GptConfig::new(64, 256, 64, 4, 0),
            Err(ConfigurationError::ZeroDimension("n_layer"))
        );
    }

    #[test]
    fn test_all_variants_are_valid() {
        for variant in Gpt2Variant::value_variants() {
            let config = variant.config();
            assert!(config.validate().is_ok(), "{variant} should validate");
            assert_eq!(config.vocab_size, 50257);
            assert_eq!(config.block_size, 1024);
            assert_eq!(variant.repo_id().parse::<Gpt2Variant>().unwrap(), *variant);
        }
        assert!("gpt3".parse::<Gpt2Variant>().is_err());
    }

    #[test]
    fn test_sequence_length_check() {
        let config = GptConfig::dummy();
        assert!(config.check_sequence_length(64).is_ok());
        assert_eq!(
            config.check_sequence_length(65),
            Err(ConfigurationError::SequenceTooLong {
                length: 65,
                block_size: 64
            })
        );
    }

    #[test]
    fn test_parameter_names() {
        let config = GptConfig::dummy();
        let names = config.get_parameter_names();
        assert_eq!(names.len(), 2 + 12 * config.n_layer + 3);
        assert!(names.contains(&"transformer.h.1.mlp.c_proj.weight".to_string()));
        assert!(names.contains(&"lm_head.weight".to_string()));
    }

    #[test]
    fn test_config_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"block_size": 32, "vocab_size": 100, "n_embd": 48, "n_head": 6, "n_layer": 3}"#,
        )
        .unwrap();
        let config = GptConfig::from_json_file(&path).unwrap();
        assert_eq!(config.n_head, 6);
        assert_eq!(config.layer_norm_epsilon, 1e-5);

        std::fs::write(
            &path,
            r#"{"block_size": 32, "vocab_size": 100, "n_embd": 50, "n_head": 6, "n_layer": 3}"#,
        )
        .unwrap();
        assert!(matches!(
            GptConfig::from_json_file(&path),
            Err(ConfigLoadError::Invalid(_))
        ));
    }
}
