//! 2D UNet Building Blocks
//!
//! Each block is a stack of ResNet blocks, optionally interleaved with
//! spatial transformers, followed by a resampling layer. All the
//! transformers of a block share the block's [`AttentionPlace`].
use crate::control::{AttentionHook, AttentionPlace};
use crate::models::attention::{AttentionPrecision, SpatialTransformer, SpatialTransformerConfig};
use crate::models::resnet::{ResnetBlock2D, ResnetBlock2DConfig};
use tch::{nn, nn::Module, Tensor};

#[derive(Debug)]
struct Downsample2D {
    conv: nn::Conv2D,
    padding: i64,
}

impl Downsample2D {
    fn new(vs: nn::Path, channels: i64, padding: i64) -> Self {
        let config = nn::ConvConfig { stride: 2, padding, ..Default::default() };
        let conv = nn::conv2d(&vs / "conv", channels, channels, 3, config);
        Self { conv, padding }
    }
}

impl Module for Downsample2D {
    fn forward(&self, xs: &Tensor) -> Tensor {
        if self.padding == 0 {
            xs.pad([0, 1, 0, 1], "constant", Some(0.)).apply(&self.conv)
        } else {
            xs.apply(&self.conv)
        }
    }
}

#[derive(Debug)]
struct Upsample2D {
    conv: nn::Conv2D,
}

impl Upsample2D {
    fn new(vs: nn::Path, channels: i64) -> Self {
        let config = nn::ConvConfig { padding: 1, ..Default::default() };
        let conv = nn::conv2d(&vs / "conv", channels, channels, 3, config);
        Self { conv }
    }

    fn forward(&self, xs: &Tensor, size: Option<(i64, i64)>) -> Tensor {
        let (h, w) = match size {
            Some(size) => size,
            None => {
                let (_bsize, _channels, h, w) = xs.size4().unwrap();
                (2 * h, 2 * w)
            }
        };
        xs.upsample_nearest2d([h, w], None, None).apply(&self.conv)
    }
}

/// The settings of the spatial transformers of a block.
#[derive(Debug, Clone, Copy)]
pub struct TransformerSettings {
    pub num_heads: i64,
    pub cross_attention_dim: i64,
    pub sliced_attention_size: Option<i64>,
    pub use_linear_projection: bool,
    pub precision: AttentionPrecision,
}

impl Default for TransformerSettings {
    fn default() -> Self {
        Self {
            num_heads: 8,
            cross_attention_dim: 768,
            sliced_attention_size: None,
            use_linear_projection: false,
            precision: AttentionPrecision::Fp32,
        }
    }
}

impl TransformerSettings {
    fn build(
        &self,
        vs: nn::Path,
        channels: i64,
        num_groups: i64,
        place: AttentionPlace,
        hook: &AttentionHook,
    ) -> SpatialTransformer {
        let config = SpatialTransformerConfig {
            depth: 1,
            num_groups,
            context_dim: Some(self.cross_attention_dim),
            sliced_attention_size: self.sliced_attention_size,
            use_linear_projection: self.use_linear_projection,
            precision: self.precision,
            place: Some(place),
        };
        let d_head = channels / self.num_heads;
        SpatialTransformer::new(vs, channels, self.num_heads, d_head, config, hook)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlockResnetConfig {
    pub num_layers: i64,
    pub eps: f64,
    pub groups: i64,
    pub output_scale_factor: f64,
}

impl Default for BlockResnetConfig {
    fn default() -> Self {
        Self { num_layers: 1, eps: 1e-6, groups: 32, output_scale_factor: 1. }
    }
}

impl BlockResnetConfig {
    fn resnet(&self, out_channels: i64, temb_channels: i64) -> ResnetBlock2DConfig {
        ResnetBlock2DConfig {
            out_channels: Some(out_channels),
            temb_channels: Some(temb_channels),
            groups: self.groups,
            eps: self.eps,
            output_scale_factor: self.output_scale_factor,
        }
    }
}

/// A down block, `CrossAttnDownBlock2D` or `DownBlock2D` depending on
/// whether transformers are used.
#[derive(Debug)]
pub struct DownBlock {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<SpatialTransformer>,
    downsampler: Option<Downsample2D>,
}

impl DownBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        out_channels: i64,
        temb_channels: i64,
        resnets: BlockResnetConfig,
        transformers: Option<TransformerSettings>,
        downsample_padding: Option<i64>,
        hook: &AttentionHook,
    ) -> Self {
        let resnet_cfg = resnets.resnet(out_channels, temb_channels);
        let resnets_vs = &vs / "resnets";
        let attentions_vs = &vs / "attentions";
        let mut attentions = vec![];
        let resnets = (0..resnets.num_layers)
            .map(|i| {
                let in_channels = if i == 0 { in_channels } else { out_channels };
                let resnet = ResnetBlock2D::new(&resnets_vs / i, in_channels, resnet_cfg);
                if let Some(settings) = transformers {
                    attentions.push(settings.build(
                        &attentions_vs / i,
                        out_channels,
                        resnet_cfg.groups,
                        AttentionPlace::Down,
                        hook,
                    ))
                }
                resnet
            })
            .collect();
        let downsampler = downsample_padding
            .map(|padding| Downsample2D::new(&vs / "downsamplers" / 0, out_channels, padding));
        Self { resnets, attentions, downsampler }
    }

    /// Returns the output of the block and the skip connections, the output
    /// of each layer and of the downsampler.
    pub fn forward(
        &self,
        xs: &Tensor,
        temb: &Tensor,
        context: Option<&Tensor>,
    ) -> (Tensor, Vec<Tensor>) {
        let mut output_states = vec![];
        let mut xs = xs.shallow_clone();
        for (index, resnet) in self.resnets.iter().enumerate() {
            xs = resnet.forward(&xs, Some(temb));
            if let Some(attn) = self.attentions.get(index) {
                xs = attn.forward(&xs, context)
            }
            output_states.push(xs.shallow_clone());
        }
        if let Some(downsampler) = &self.downsampler {
            xs = xs.apply(downsampler);
            output_states.push(xs.shallow_clone());
        }
        (xs, output_states)
    }
}

/// `UNetMidBlock2DCrossAttn`: a ResNet block followed by transformer and
/// ResNet pairs.
#[derive(Debug)]
pub struct MidBlock {
    resnet: ResnetBlock2D,
    attn_resnets: Vec<(SpatialTransformer, ResnetBlock2D)>,
}

impl MidBlock {
    pub fn new(
        vs: nn::Path,
        channels: i64,
        temb_channels: i64,
        resnets: BlockResnetConfig,
        transformers: TransformerSettings,
        hook: &AttentionHook,
    ) -> Self {
        let resnets_vs = &vs / "resnets";
        let attentions_vs = &vs / "attentions";
        let resnet_cfg = resnets.resnet(channels, temb_channels);
        let resnet = ResnetBlock2D::new(&resnets_vs / 0, channels, resnet_cfg);
        let attn_resnets = (0..resnets.num_layers)
            .map(|i| {
                let attn = transformers.build(
                    &attentions_vs / i,
                    channels,
                    resnet_cfg.groups,
                    AttentionPlace::Mid,
                    hook,
                );
                let resnet = ResnetBlock2D::new(&resnets_vs / (i + 1), channels, resnet_cfg);
                (attn, resnet)
            })
            .collect();
        Self { resnet, attn_resnets }
    }

    pub fn forward(&self, xs: &Tensor, temb: &Tensor, context: Option<&Tensor>) -> Tensor {
        let mut xs = self.resnet.forward(xs, Some(temb));
        for (attn, resnet) in self.attn_resnets.iter() {
            xs = resnet.forward(&attn.forward(&xs, context), Some(temb))
        }
        xs
    }
}

/// An up block, `CrossAttnUpBlock2D` or `UpBlock2D` depending on whether
/// transformers are used.
#[derive(Debug)]
pub struct UpBlock {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<SpatialTransformer>,
    upsampler: Option<Upsample2D>,
}

impl UpBlock {
    /// `skip_channels` lists the channels of the skip connections consumed
    /// by each layer, in order.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vs: nn::Path,
        prev_output_channels: i64,
        skip_channels: &[i64],
        out_channels: i64,
        temb_channels: i64,
        resnets: BlockResnetConfig,
        transformers: Option<TransformerSettings>,
        add_upsample: bool,
        hook: &AttentionHook,
    ) -> Self {
        let resnet_cfg = resnets.resnet(out_channels, temb_channels);
        let resnets_vs = &vs / "resnets";
        let attentions_vs = &vs / "attentions";
        let mut attentions = vec![];
        let resnets = skip_channels
            .iter()
            .enumerate()
            .map(|(i, skip)| {
                let in_channels = if i == 0 { prev_output_channels } else { out_channels };
                let resnet =
                    ResnetBlock2D::new(&resnets_vs / i as i64, in_channels + skip, resnet_cfg);
                if let Some(settings) = transformers {
                    attentions.push(settings.build(
                        &attentions_vs / i as i64,
                        out_channels,
                        resnet_cfg.groups,
                        AttentionPlace::Up,
                        hook,
                    ))
                }
                resnet
            })
            .collect();
        let upsampler =
            add_upsample.then(|| Upsample2D::new(&vs / "upsamplers" / 0, out_channels));
        Self { resnets, attentions, upsampler }
    }

    pub fn num_layers(&self) -> usize {
        self.resnets.len()
    }

    /// `res_xs` holds the skip connections for this block, the last one is
    /// consumed first.
    pub fn forward(
        &self,
        xs: &Tensor,
        res_xs: &[Tensor],
        temb: &Tensor,
        upsample_size: Option<(i64, i64)>,
        context: Option<&Tensor>,
    ) -> Tensor {
        let mut xs = xs.shallow_clone();
        for (index, (resnet, res)) in self.resnets.iter().zip(res_xs.iter().rev()).enumerate() {
            xs = resnet.forward(&Tensor::cat(&[&xs, res], 1), Some(temb));
            if let Some(attn) = self.attentions.get(index) {
                xs = attn.forward(&xs, context)
            }
        }
        match &self.upsampler {
            Some(upsampler) => upsampler.forward(&xs, upsample_size),
            None => xs,
        }
    }
}
