//! # Denoising Diffusion Implicit Models schedules
//!
//! DDIM generalizes the Markovian reverse process of DDPM to non-Markovian
//! processes which can skip most of the training timesteps. Sampling only
//! visits a subsequence of the training timesteps and uses the
//! coefficients computed here.
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use super::noise::NoiseSchedule;
use crate::error::{Error, Result};
use tch::{Device, Kind, Tensor};

/// How the sampling timesteps are picked among the training ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DdimDiscretization {
    /// Evenly spaced timesteps.
    #[default]
    Uniform,
    /// Timesteps spaced quadratically up to 80% of the training schedule.
    Quad,
}

/// Returns the increasing sequence of training timesteps visited when
/// sampling with `num_ddim_timesteps` steps.
pub fn make_ddim_timesteps(
    method: DdimDiscretization,
    num_ddim_timesteps: usize,
    num_ddpm_timesteps: usize,
) -> Vec<usize> {
    let timesteps: Vec<usize> = match method {
        DdimDiscretization::Uniform => {
            let c = usize::max(num_ddpm_timesteps / num_ddim_timesteps.max(1), 1);
            (0..num_ddpm_timesteps).step_by(c).collect()
        }
        DdimDiscretization::Quad => {
            let end = (num_ddpm_timesteps as f64 * 0.8).sqrt();
            let last = num_ddim_timesteps.saturating_sub(1);
            let step = if last > 0 { end / last as f64 } else { 0. };
            (0..num_ddim_timesteps)
                .map(|i| {
                    // Multiples of a fixed step, the last point is exactly `end`.
                    let v = if i == last && last > 0 { end } else { i as f64 * step };
                    (v * v) as usize
                })
                .collect()
        }
    };
    // Add one to get the final alpha values right (the ones from first
    // scale to data during sampling).
    let last = num_ddpm_timesteps.saturating_sub(1);
    timesteps.into_iter().map(|t| usize::min(t + 1, last)).collect()
}

/// The DDIM coefficients for the selected timesteps.
#[derive(Debug, Clone, PartialEq)]
pub struct DdimSamplingParameters {
    pub sigmas: Vec<f64>,
    pub alphas: Vec<f64>,
    pub alphas_prev: Vec<f64>,
}

/// Computes the variance schedule of the DDIM sampler, `eta = 0` gives the
/// deterministic sampler and `eta = 1` the variance of the ancestral DDPM
/// sampler. See formula (16) of https://arxiv.org/abs/2010.02502
pub fn make_ddim_sampling_parameters(
    alphacums: &[f64],
    ddim_timesteps: &[usize],
    eta: f64,
) -> DdimSamplingParameters {
    let alphas: Vec<f64> = ddim_timesteps.iter().map(|&t| alphacums[t]).collect();
    let mut alphas_prev = Vec::with_capacity(alphas.len());
    alphas_prev.push(alphacums[0]);
    let n_prev = alphas.len().saturating_sub(1);
    alphas_prev.extend(ddim_timesteps.iter().take(n_prev).map(|&t| alphacums[t]));
    let sigmas = alphas
        .iter()
        .zip(alphas_prev.iter())
        .map(|(&a, &a_prev)| eta * ((1. - a_prev) / (1. - a) * (1. - a / a_prev)).sqrt())
        .collect();
    DdimSamplingParameters { sigmas, alphas, alphas_prev }
}

/// The scalar coefficients used by a single DDIM step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepCoefficients {
    pub a_t: f64,
    pub a_prev: f64,
    pub sigma_t: f64,
    pub sqrt_one_minus_at: f64,
}

/// The buffers computed once per sampling run, the DDIM arrays are indexed
/// by position in the schedule and the full-length arrays by training
/// timestep. This is an immutable value: a new one is built for each call
/// to `make_schedule`.
#[derive(Debug)]
pub struct DdimSchedule {
    pub timesteps: Vec<usize>,
    pub eta: f64,
    pub ddpm_num_timesteps: usize,

    pub betas: Tensor,
    pub alphas_cumprod: Tensor,
    pub alphas_cumprod_prev: Tensor,
    pub sqrt_alphas_cumprod: Tensor,
    pub sqrt_one_minus_alphas_cumprod: Tensor,
    pub log_one_minus_alphas_cumprod: Tensor,
    pub sqrt_recip_alphas_cumprod: Tensor,
    pub sqrt_recipm1_alphas_cumprod: Tensor,

    pub ddim_sigmas: Tensor,
    pub ddim_alphas: Tensor,
    pub ddim_alphas_prev: Tensor,
    pub ddim_sqrt_one_minus_alphas: Tensor,
    pub ddim_sigmas_for_original_num_steps: Tensor,
}

impl DdimSchedule {
    pub fn new(
        noise: &NoiseSchedule,
        ddim_num_steps: usize,
        discretization: DdimDiscretization,
        eta: f64,
        device: Device,
    ) -> Result<Self> {
        let ddpm_num_timesteps = noise.num_timesteps();
        let timesteps = make_ddim_timesteps(discretization, ddim_num_steps, ddpm_num_timesteps);
        log::debug!("selected timesteps for ddim sampler: {timesteps:?}");

        let alphas_cumprod = noise.alphas_cumprod.to_kind(Kind::Double).to_device(Device::Cpu);
        let got = alphas_cumprod.size1()? as usize;
        if got != ddpm_num_timesteps {
            return Err(Error::ScheduleLength { expected: ddpm_num_timesteps, got });
        }
        let to_device = |xs: &Tensor| xs.to_kind(Kind::Float).to_device(device);
        let alphas_cumprod_prev =
            noise.alphas_cumprod_prev.to_kind(Kind::Double).to_device(Device::Cpu);

        let alphacums = Vec::<f64>::try_from(&alphas_cumprod)?;
        let params = make_ddim_sampling_parameters(&alphacums, &timesteps, eta);
        log::debug!(
            "selected alphas for ddim sampler: a_t: {:?}; a_(t-1): {:?}",
            params.alphas,
            params.alphas_prev
        );
        log::debug!(
            "for the chosen value of eta, which is {eta}, this results in the following sigma_t schedule for ddim sampler {:?}",
            params.sigmas
        );
        let ddim_sqrt_one_minus_alphas: Vec<f64> =
            params.alphas.iter().map(|a| (1. - a).sqrt()).collect();
        let sigmas_for_original_num_steps = eta
            * ((1f64 - &alphas_cumprod_prev) / (1f64 - &alphas_cumprod)
                * (1f64 - &alphas_cumprod / &alphas_cumprod_prev))
                .sqrt();

        Ok(Self {
            betas: to_device(&noise.betas),
            sqrt_alphas_cumprod: to_device(&alphas_cumprod.sqrt()),
            sqrt_one_minus_alphas_cumprod: to_device(&(1f64 - &alphas_cumprod).sqrt()),
            log_one_minus_alphas_cumprod: to_device(&(1f64 - &alphas_cumprod).log()),
            sqrt_recip_alphas_cumprod: to_device(&alphas_cumprod.reciprocal().sqrt()),
            sqrt_recipm1_alphas_cumprod: to_device(&(alphas_cumprod.reciprocal() - 1.).sqrt()),
            alphas_cumprod: to_device(&alphas_cumprod),
            alphas_cumprod_prev: to_device(&alphas_cumprod_prev),
            ddim_sigmas: to_device(&Tensor::from_slice(&params.sigmas)),
            ddim_alphas: to_device(&Tensor::from_slice(&params.alphas)),
            ddim_alphas_prev: to_device(&Tensor::from_slice(&params.alphas_prev)),
            ddim_sqrt_one_minus_alphas: to_device(&Tensor::from_slice(&ddim_sqrt_one_minus_alphas)),
            ddim_sigmas_for_original_num_steps: to_device(&sigmas_for_original_num_steps),
            timesteps,
            eta,
            ddpm_num_timesteps,
        })
    }

    /// The number of DDIM steps.
    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }

    /// The coefficients for position `index` of the schedule, or for the
    /// training timestep `index` when `use_original_steps` is set.
    pub fn coefficients(&self, index: usize, use_original_steps: bool) -> StepCoefficients {
        let index = [index as i64];
        if use_original_steps {
            StepCoefficients {
                a_t: self.alphas_cumprod.double_value(&index),
                a_prev: self.alphas_cumprod_prev.double_value(&index),
                sigma_t: self.ddim_sigmas_for_original_num_steps.double_value(&index),
                sqrt_one_minus_at: self.sqrt_one_minus_alphas_cumprod.double_value(&index),
            }
        } else {
            StepCoefficients {
                a_t: self.ddim_alphas.double_value(&index),
                a_prev: self.ddim_alphas_prev.double_value(&index),
                sigma_t: self.ddim_sigmas.double_value(&index),
                sqrt_one_minus_at: self.ddim_sqrt_one_minus_alphas.double_value(&index),
            }
        }
    }
}
