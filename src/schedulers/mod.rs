//! # Noise schedules
//!
//! The full diffusion schedule used during training and the DDIM
//! sub-schedules derived from it for sampling.
use tch::Tensor;

pub mod ddim;
pub mod noise;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta, this is what the
    /// latent diffusion models call the "linear" schedule.
    ScaledLinear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

/// What the denoising network predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameterization {
    /// The noise of the diffusion process.
    Epsilon,
    /// The velocity `sqrt(alpha_t) * noise - sqrt(1 - alpha_t) * x_0`, see
    /// section 2.4 of https://imagen.research.google/video/paper.pdf
    V,
}

impl std::str::FromStr for Parameterization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eps" => Ok(Self::Epsilon),
            "v" => Ok(Self::V),
            _ => Err(format!("unknown parameterization {s:?}, expected \"eps\" or \"v\"")),
        }
    }
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
///
/// Contains a function `alpha_bar` that takes an argument `t` and transforms it to the cumulative product of `(1-beta)`
/// up to that part of the diffusion process.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Tensor {
    let alpha_bar =
        |time_step: f64| f64::cos((time_step + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2);
    let mut betas = Vec::with_capacity(num_diffusion_timesteps);
    for i in 0..num_diffusion_timesteps {
        let t1 = i as f64 / num_diffusion_timesteps as f64;
        let t2 = (i + 1) as f64 / num_diffusion_timesteps as f64;
        betas.push((1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta));
    }

    Tensor::from_slice(&betas)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_parameterization() {
        assert_eq!("eps".parse::<Parameterization>(), Ok(Parameterization::Epsilon));
        assert_eq!("v".parse::<Parameterization>(), Ok(Parameterization::V));
        assert!("x0".parse::<Parameterization>().is_err());
    }

    #[test]
    fn cosine_betas_are_increasing() {
        let betas = Vec::<f64>::try_from(betas_for_alpha_bar(100, 0.999)).unwrap();
        assert_eq!(betas.len(), 100);
        assert!(betas.windows(2).all(|w| w[0] <= w[1]));
        assert!(betas.iter().all(|&b| b > 0. && b <= 0.999));
    }
}
