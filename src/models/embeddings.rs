//! Timestep embeddings.
use tch::{nn, Kind, Tensor};

/// Sinusoidal embedding of `timesteps`, one per batch element, returned with
/// shape `(batch, dim)`.
pub fn timestep_embedding(
    timesteps: &Tensor,
    dim: i64,
    flip_sin_to_cos: bool,
    downscale_freq_shift: f64,
) -> Tensor {
    let half_dim = dim / 2;
    let device = timesteps.device();
    let exponent = Tensor::arange(half_dim, (Kind::Float, device)) * -f64::ln(10000.);
    let freqs = (exponent / (half_dim as f64 - downscale_freq_shift)).exp();
    let args = timesteps.to_kind(Kind::Float).unsqueeze(-1) * freqs.unsqueeze(0);
    let emb = if flip_sin_to_cos {
        Tensor::cat(&[args.cos(), args.sin()], -1)
    } else {
        Tensor::cat(&[args.sin(), args.cos()], -1)
    };
    if dim % 2 == 1 {
        emb.pad([0, 1, 0, 0], "constant", None)
    } else {
        emb
    }
}

/// Projects the timesteps to the embedding used by the ResNet blocks.
#[derive(Debug)]
pub struct TimestepEmbedding {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
    channels: i64,
    flip_sin_to_cos: bool,
    freq_shift: f64,
}

impl TimestepEmbedding {
    pub fn new(
        vs: nn::Path,
        channels: i64,
        time_embed_dim: i64,
        flip_sin_to_cos: bool,
        freq_shift: f64,
    ) -> Self {
        let linear_1 = nn::linear(&vs / "linear_1", channels, time_embed_dim, Default::default());
        let linear_2 =
            nn::linear(&vs / "linear_2", time_embed_dim, time_embed_dim, Default::default());
        Self { linear_1, linear_2, channels, flip_sin_to_cos, freq_shift }
    }

    pub fn forward(&self, timesteps: &Tensor) -> Tensor {
        timestep_embedding(timesteps, self.channels, self.flip_sin_to_cos, self.freq_shift)
            .apply(&self.linear_1)
            .silu()
            .apply(&self.linear_2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sinusoidal_embedding() {
        let timesteps = Tensor::from_slice(&[0i64, 500]);
        let emb = timestep_embedding(&timesteps, 8, true, 0.);
        assert_eq!(emb.size(), [2, 8]);
        // At t=0 the cosines are one and the sines zero.
        let first = Vec::<f32>::try_from(emb.get(0)).unwrap();
        assert_eq!(first, [1., 1., 1., 1., 0., 0., 0., 0.]);

        let emb = timestep_embedding(&timesteps, 7, false, 1.);
        assert_eq!(emb.size(), [2, 7]);
        assert_eq!(emb.double_value(&[1, 6]), 0.);
    }
}
