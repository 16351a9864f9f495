//! Error types for the sampler.
use crate::schedulers::Parameterization;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A feature that is accepted by the api but has no implementation.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("score correction requires epsilon parameterization, got {0:?}")]
    ScoreCorrectorParameterization(Parameterization),

    #[error("guidance schedule has {got} entries but sampling runs for {expected} steps")]
    GuidanceScheduleLength { expected: usize, got: usize },

    #[error("mask schedule has {got} entries but sampling runs for {expected} steps")]
    MaskScheduleLength { expected: usize, got: usize },

    #[error("cannot encode {t_enc} steps, the schedule only has {available}")]
    EncodeSteps { t_enc: usize, available: usize },

    #[error("alphas have to be defined for each timestep, got {got} for {expected} timesteps")]
    ScheduleLength { expected: usize, got: usize },

    #[error("conditioning: {0}")]
    Conditioning(String),

    /// Returned by a step callback to stop the sampling loop.
    #[error("sampling interrupted at step {step}")]
    Interrupted { step: usize },

    #[error(transparent)]
    Torch(#[from] tch::TchError),
}
