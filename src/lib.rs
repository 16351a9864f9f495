//! # DDIM sampling with attention control
//!
//! A DDIM sampler for latent diffusion models using Torch via
//! [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! This library includes:
//! - The DDIM schedules and a sampler supporting epsilon and v
//!   parameterized models, classifier-free guidance and masked guidance
//!   toward a target latent.
//! - Attention control: every attention layer of the UNet routes its
//!   key/value input through a user supplied controller.
//! - A conditional UNet and the Stable Diffusion 1.5 and 2.1
//!   configurations, the models can use pre-trained weights adapted from
//!   the Python implementation.

pub mod control;
pub mod error;
pub mod models;
pub mod pipelines;
pub mod samplers;
pub mod schedulers;
pub mod utils;

pub use error::{Error, Result};
