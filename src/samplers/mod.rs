//! # Samplers
//!
//! The denoising network is seen by the samplers through the
//! [`DiffusionModel`] trait: a function of the noisy latent, the timestep
//! and the conditioning, plus the noise schedule it was trained with.
use crate::control::AttentionHook;
use crate::error::Result;
use crate::schedulers::noise::NoiseSchedule;
use crate::schedulers::Parameterization;
use tch::{Device, Tensor};

pub mod conditioning;
pub mod ddim_v;

pub use conditioning::Conditioning;

pub trait DiffusionModel {
    /// Runs the denoising network on `x` at the timesteps `t`, one per batch
    /// element.
    fn apply_model(&self, x: &Tensor, t: &Tensor, cond: Option<&Conditioning>) -> Result<Tensor>;

    fn parameterization(&self) -> Parameterization;

    fn noise_schedule(&self) -> &NoiseSchedule;

    fn device(&self) -> Device {
        self.noise_schedule().device()
    }

    fn num_timesteps(&self) -> usize {
        self.noise_schedule().num_timesteps()
    }

    fn q_sample(&self, x_start: &Tensor, t: &Tensor, noise: Option<&Tensor>) -> Tensor {
        self.noise_schedule().q_sample(x_start, t, noise)
    }

    fn predict_eps_from_z_and_v(&self, x_t: &Tensor, t: &Tensor, v: &Tensor) -> Tensor {
        self.noise_schedule().predict_eps_from_z_and_v(x_t, t, v)
    }

    fn predict_start_from_z_and_v(&self, x_t: &Tensor, t: &Tensor, v: &Tensor) -> Tensor {
        self.noise_schedule().predict_start_from_z_and_v(x_t, t, v)
    }

    /// The hook shared by the attention layers of the network, if any.
    fn attention_hook(&self) -> Option<&AttentionHook> {
        None
    }
}

/// Adjusts the noise estimate of an epsilon-parameterized model.
pub trait ScoreCorrector {
    fn modify_score(
        &self,
        e_t: &Tensor,
        x: &Tensor,
        t: &Tensor,
        cond: Option<&Conditioning>,
    ) -> Tensor;
}

/// Snaps denoised estimates to a discrete latent space, e.g. the codebook
/// of a VQ first stage.
pub trait Quantizer {
    fn quantize(&self, xs: &Tensor) -> Tensor;
}

impl Parameterization {
    /// Converts the raw network output to a noise estimate.
    pub fn noise_estimate<M: DiffusionModel + ?Sized>(
        self,
        model: &M,
        x: &Tensor,
        t: &Tensor,
        model_output: &Tensor,
    ) -> Tensor {
        match self {
            Self::Epsilon => model_output.shallow_clone(),
            Self::V => model.predict_eps_from_z_and_v(x, t, model_output),
        }
    }

    /// The estimate of the fully denoised sample, `a_t` and
    /// `sqrt_one_minus_at` are the DDIM coefficients of the current step.
    #[allow(clippy::too_many_arguments)]
    pub fn denoised_estimate<M: DiffusionModel + ?Sized>(
        self,
        model: &M,
        x: &Tensor,
        t: &Tensor,
        model_output: &Tensor,
        e_t: &Tensor,
        a_t: &Tensor,
        sqrt_one_minus_at: &Tensor,
    ) -> Tensor {
        match self {
            Self::Epsilon => (x - sqrt_one_minus_at * e_t) / a_t.sqrt(),
            Self::V => model.predict_start_from_z_and_v(x, t, model_output),
        }
    }
}
