//! # Models
//!
//! The denoising network and its building blocks.

pub mod attention;
pub mod embeddings;
pub mod latent_diffusion;
pub mod resnet;
pub mod unet_2d;
pub mod unet_2d_blocks;
