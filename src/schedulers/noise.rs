//! The full-length noise schedule of a diffusion model, as used to train
//! it, together with the closed-form forward process.
use super::{betas_for_alpha_bar, BetaSchedule};
use crate::utils::extract_into_tensor;
use tch::{kind, Device, Kind, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct NoiseScheduleConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// number of diffusion steps used to train the model
    pub train_timesteps: usize,
}

impl Default for NoiseScheduleConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085f64,
            beta_end: 0.012f64,
            beta_schedule: BetaSchedule::ScaledLinear,
            train_timesteps: 1000,
        }
    }
}

/// Per-timestep buffers, all of length `train_timesteps` and stored as
/// single precision on the model device.
#[derive(Debug)]
pub struct NoiseSchedule {
    pub betas: Tensor,
    pub alphas_cumprod: Tensor,
    pub alphas_cumprod_prev: Tensor,
    pub sqrt_alphas_cumprod: Tensor,
    pub sqrt_one_minus_alphas_cumprod: Tensor,
    pub config: NoiseScheduleConfig,
}

impl NoiseSchedule {
    pub fn new(config: NoiseScheduleConfig, device: Device) -> Self {
        let betas = match config.beta_schedule {
            BetaSchedule::ScaledLinear => Tensor::linspace(
                config.beta_start.sqrt(),
                config.beta_end.sqrt(),
                config.train_timesteps as i64,
                kind::DOUBLE_CPU,
            )
            .square(),
            BetaSchedule::Linear => Tensor::linspace(
                config.beta_start,
                config.beta_end,
                config.train_timesteps as i64,
                kind::DOUBLE_CPU,
            ),
            BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(config.train_timesteps, 0.999),
        };
        let alphas: Tensor = 1.0 - &betas;
        let alphas_cumprod = alphas.cumprod(0, Kind::Double);
        let alphas_cumprod_prev = Tensor::cat(
            &[Tensor::ones([1], kind::DOUBLE_CPU), alphas_cumprod.slice(0, 0, -1, 1)],
            0,
        );
        let sqrt_alphas_cumprod = alphas_cumprod.sqrt();
        let sqrt_one_minus_alphas_cumprod = (1.0f64 - &alphas_cumprod).sqrt();
        let to_device = |xs: Tensor| xs.to_kind(Kind::Float).to_device(device);
        Self {
            betas: to_device(betas),
            alphas_cumprod: to_device(alphas_cumprod),
            alphas_cumprod_prev: to_device(alphas_cumprod_prev),
            sqrt_alphas_cumprod: to_device(sqrt_alphas_cumprod),
            sqrt_one_minus_alphas_cumprod: to_device(sqrt_one_minus_alphas_cumprod),
            config,
        }
    }

    pub fn num_timesteps(&self) -> usize {
        self.config.train_timesteps
    }

    pub fn device(&self) -> Device {
        self.alphas_cumprod.device()
    }

    /// Diffuses `x_start` to the timesteps `t` (one per batch element). A
    /// fresh standard normal sample is used when no noise is provided.
    pub fn q_sample(&self, x_start: &Tensor, t: &Tensor, noise: Option<&Tensor>) -> Tensor {
        let noise = match noise {
            Some(noise) => noise.shallow_clone(),
            None => Tensor::randn_like(x_start),
        };
        let shape = x_start.size();
        extract_into_tensor(&self.sqrt_alphas_cumprod, t, &shape) * x_start
            + extract_into_tensor(&self.sqrt_one_minus_alphas_cumprod, t, &shape) * noise
    }

    pub fn predict_eps_from_z_and_v(&self, x_t: &Tensor, t: &Tensor, v: &Tensor) -> Tensor {
        let shape = x_t.size();
        extract_into_tensor(&self.sqrt_alphas_cumprod, t, &shape) * v
            + extract_into_tensor(&self.sqrt_one_minus_alphas_cumprod, t, &shape) * x_t
    }

    pub fn predict_start_from_z_and_v(&self, x_t: &Tensor, t: &Tensor, v: &Tensor) -> Tensor {
        let shape = x_t.size();
        extract_into_tensor(&self.sqrt_alphas_cumprod, t, &shape) * x_t
            - extract_into_tensor(&self.sqrt_one_minus_alphas_cumprod, t, &shape) * v
    }
}
