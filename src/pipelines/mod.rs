//! # Pipelines
//!
//! Ready made configurations for the Stable Diffusion models.

pub mod stable_diffusion;
