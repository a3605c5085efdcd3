use crate::GptConfig;
use tch::nn::{self, Init};

pub const INIT_STD: f64 = 0.02;

/// Which initialization a projection receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionRole {
    Standard,
    /// Projection whose output is added onto the residual stream.
    ResidualOutput,
}

impl ProjectionRole {
    pub fn std(&self, config: &GptConfig) -> f64 {
        match self {
            ProjectionRole::Standard => INIT_STD,
            ProjectionRole::ResidualOutput => INIT_STD * (2.0 * config.n_layer as f64).powf(-0.5),
        }
    }
}

/// Affine layer with gaussian weights and zero bias.
pub fn linear(
    vs: nn::Path,
    in_features: i64,
    out_features: i64,
    role: ProjectionRole,
    config: &GptConfig,
) -> nn::Linear {
    nn::linear(
        vs,
        in_features,
        out_features,
        nn::LinearConfig {
            ws_init: Init::Randn {
                mean: 0.0,
                stdev: role.std(config),
            },
            bs_init: Some(Init::Const(0.0)),
            bias: true,
        },
    )
}

pub fn embedding(vs: nn::Path, num_embeddings: i64, embedding_dim: i64) -> nn::Embedding {
    nn::embedding(
        vs,
        num_embeddings,
        embedding_dim,
        nn::EmbeddingConfig {
            ws_init: Init::Randn {
                mean: 0.0,
                stdev: INIT_STD,
            },
            ..Default::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn test_residual_std_shrinks_with_depth() {
        let mut config = GptConfig::dummy();
        config.n_layer = 8;
        assert_eq!(ProjectionRole::Standard.std(&config), 0.02);
        let scaled = ProjectionRole::ResidualOutput.std(&config);
        assert!((scaled - 0.02 / 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_linear_init_statistics() {
        tch::manual_seed(0);
        let config = GptConfig::dummy();
        let vs = nn::VarStore::new(Device::Cpu);
        let standard = linear(vs.root() / "a", 256, 256, ProjectionRole::Standard, &config);
        let residual = linear(
            vs.root() / "b",
            256,
            256,
            ProjectionRole::ResidualOutput,
            &config,
        );

        let std_a = standard.ws.std(true).double_value(&[]);
        let std_b = residual.ws.std(true).double_value(&[]);
        assert!((std_a - 0.02).abs() < 0.002, "standard std was {std_a}");
        assert!((std_b - 0.01).abs() < 0.001, "residual std was {std_b}");

        let bias = standard.bs.as_ref().unwrap();
        assert_eq!(bias.abs().sum(Kind::Float).double_value(&[]), 0.0);
    }
}
