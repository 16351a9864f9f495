use crate::models::latent_diffusion::LatentDiffusion;
use crate::models::unet_2d;
use crate::schedulers::noise::{NoiseSchedule, NoiseScheduleConfig};
use crate::schedulers::Parameterization;
use tch::{nn, Device};

/// The latent space has 4 channels and is 8 times smaller than the images.
pub const LATENT_CHANNELS: i64 = 4;
const LATENT_DOWNSCALE: i64 = 8;

#[derive(Clone, Debug)]
pub struct StableDiffusionConfig {
    pub width: i64,
    pub height: i64,
    pub parameterization: Parameterization,
    unet: unet_2d::UNet2DConditionModelConfig,
    noise: NoiseScheduleConfig,
}

impl StableDiffusionConfig {
    pub fn v1_5(sliced_attention_size: Option<i64>) -> Self {
        let bc = |out_channels, use_cross_attn, attention_head_dim| unet_2d::BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim,
        };
        // https://huggingface.co/runwayml/stable-diffusion-v1-5/blob/main/unet/config.json
        let unet = unet_2d::UNet2DConditionModelConfig {
            blocks: vec![bc(320, true, 8), bc(640, true, 8), bc(1280, true, 8), bc(1280, false, 8)],
            cross_attention_dim: 768,
            sliced_attention_size,
            use_linear_projection: false,
            ..Default::default()
        };
        Self {
            width: 512,
            height: 512,
            parameterization: Parameterization::Epsilon,
            unet,
            noise: Default::default(),
        }
    }

    pub fn v2_1(sliced_attention_size: Option<i64>) -> Self {
        let bc = |out_channels, use_cross_attn, attention_head_dim| unet_2d::BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim,
        };
        // https://huggingface.co/stabilityai/stable-diffusion-2-1/blob/main/unet/config.json
        let unet = unet_2d::UNet2DConditionModelConfig {
            blocks: vec![
                bc(320, true, 5),
                bc(640, true, 10),
                bc(1280, true, 20),
                bc(1280, false, 20),
            ],
            cross_attention_dim: 1024,
            sliced_attention_size,
            use_linear_projection: true,
            ..Default::default()
        };
        Self {
            width: 768,
            height: 768,
            parameterization: Parameterization::V,
            unet,
            noise: Default::default(),
        }
    }

    pub fn unet_config(&self) -> &unet_2d::UNet2DConditionModelConfig {
        &self.unet
    }

    /// Runs the attention layers with the kind of the activations rather
    /// than upcasting the scores to single precision.
    pub fn with_native_attention(mut self) -> Self {
        self.unet.attention_precision = crate::models::attention::AttentionPrecision::Native;
        self
    }

    /// The `(channels, height, width)` shape of the latents.
    pub fn latent_shape(&self) -> (i64, i64, i64) {
        (LATENT_CHANNELS, self.height / LATENT_DOWNSCALE, self.width / LATENT_DOWNSCALE)
    }

    pub fn build_unet(
        &self,
        unet_weights: &str,
        device: Device,
        in_channels: i64,
    ) -> anyhow::Result<unet_2d::UNet2DConditionModel> {
        let mut vs_unet = nn::VarStore::new(device);
        let unet = unet_2d::UNet2DConditionModel::new(
            vs_unet.root(),
            in_channels,
            LATENT_CHANNELS,
            self.unet.clone(),
        );
        vs_unet.load(unet_weights)?;
        log::info!("loaded unet weights from {unet_weights}");
        Ok(unet)
    }

    /// Builds the model driven by the samplers, `in_channels` is larger than
    /// the latent channels for models taking `c_concat` conditioning.
    pub fn build_model(
        &self,
        unet_weights: &str,
        device: Device,
        in_channels: i64,
    ) -> anyhow::Result<LatentDiffusion> {
        let unet = self.build_unet(unet_weights, device, in_channels)?;
        let noise = NoiseSchedule::new(self.noise, device);
        Ok(LatentDiffusion::new(unet, noise, self.parameterization))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions() {
        let v1_5 = StableDiffusionConfig::v1_5(None);
        assert_eq!(v1_5.latent_shape(), (4, 64, 64));
        assert_eq!(v1_5.parameterization, Parameterization::Epsilon);
        let v2_1 = StableDiffusionConfig::v2_1(Some(0)).with_native_attention();
        assert_eq!(v2_1.latent_shape(), (4, 96, 96));
        assert_eq!(v2_1.parameterization, Parameterization::V);
        assert!(v2_1.unet_config().use_linear_projection);
    }
}
