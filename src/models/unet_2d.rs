//! 2D UNet Denoising Models
//!
//! The 2D Unet models take as input a noisy sample, the current diffusion
//! timesteps and the conditioning sequence, and return the prediction of the
//! model: the noise or the velocity depending on its parameterization.
//!
//! All the attention layers of a UNet share an [`AttentionHook`], the
//! layers of `down_blocks`, `mid_block` and `up_blocks` are respectively
//! tagged with the `Down`, `Mid` and `Up` places.
use crate::control::AttentionHook;
use crate::models::attention::AttentionPrecision;
use crate::models::embeddings::TimestepEmbedding;
use crate::models::unet_2d_blocks::*;
use tch::{nn, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct BlockConfig {
    pub out_channels: i64,
    pub use_cross_attn: bool,
    /// The number of attention heads.
    pub attention_head_dim: i64,
}

#[derive(Debug, Clone)]
pub struct UNet2DConditionModelConfig {
    pub center_input_sample: bool,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
    pub blocks: Vec<BlockConfig>,
    pub layers_per_block: i64,
    pub downsample_padding: i64,
    pub mid_block_scale_factor: f64,
    pub norm_num_groups: i64,
    pub norm_eps: f64,
    pub cross_attention_dim: i64,
    /// Use `Some(0)` to pick a slice size from the number of heads.
    pub sliced_attention_size: Option<i64>,
    pub use_linear_projection: bool,
    pub attention_precision: AttentionPrecision,
}

impl Default for UNet2DConditionModelConfig {
    fn default() -> Self {
        Self {
            center_input_sample: false,
            flip_sin_to_cos: true,
            freq_shift: 0.,
            blocks: vec![
                BlockConfig { out_channels: 320, use_cross_attn: true, attention_head_dim: 8 },
                BlockConfig { out_channels: 640, use_cross_attn: true, attention_head_dim: 8 },
                BlockConfig { out_channels: 1280, use_cross_attn: true, attention_head_dim: 8 },
                BlockConfig { out_channels: 1280, use_cross_attn: false, attention_head_dim: 8 },
            ],
            layers_per_block: 2,
            downsample_padding: 1,
            mid_block_scale_factor: 1.,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            cross_attention_dim: 1280,
            sliced_attention_size: None,
            use_linear_projection: false,
            attention_precision: AttentionPrecision::Fp32,
        }
    }
}

impl UNet2DConditionModelConfig {
    fn transformers(&self, num_heads: i64) -> TransformerSettings {
        // Enable automatic attention slicing if the config sliced_attention_size is set to 0.
        let sliced_attention_size = match self.sliced_attention_size {
            Some(0) => Some(i64::max(num_heads / 2, 1)),
            size => size,
        };
        TransformerSettings {
            num_heads,
            cross_attention_dim: self.cross_attention_dim,
            sliced_attention_size,
            use_linear_projection: self.use_linear_projection,
            precision: self.attention_precision,
        }
    }

    fn resnets(&self, num_layers: i64, output_scale_factor: f64) -> BlockResnetConfig {
        BlockResnetConfig {
            num_layers,
            eps: self.norm_eps,
            groups: self.norm_num_groups,
            output_scale_factor,
        }
    }
}

#[derive(Debug)]
pub struct UNet2DConditionModel {
    conv_in: nn::Conv2D,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<DownBlock>,
    mid_block: MidBlock,
    up_blocks: Vec<UpBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2D,
    hook: AttentionHook,
    config: UNet2DConditionModelConfig,
}

impl UNet2DConditionModel {
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        out_channels: i64,
        config: UNet2DConditionModelConfig,
    ) -> Self {
        let hook = AttentionHook::new();
        let n_blocks = config.blocks.len();
        let b_channels = config.blocks[0].out_channels;
        let last_block = config.blocks[n_blocks - 1];
        let time_embed_dim = b_channels * 4;
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let conv_in = nn::conv2d(&vs / "conv_in", in_channels, b_channels, 3, conv_cfg);

        let time_embedding = TimestepEmbedding::new(
            &vs / "time_embedding",
            b_channels,
            time_embed_dim,
            config.flip_sin_to_cos,
            config.freq_shift,
        );

        let vs_db = &vs / "down_blocks";
        let down_blocks = config
            .blocks
            .iter()
            .enumerate()
            .map(|(i, block)| {
                let in_channels =
                    if i > 0 { config.blocks[i - 1].out_channels } else { b_channels };
                let transformers =
                    block.use_cross_attn.then(|| config.transformers(block.attention_head_dim));
                let downsample_padding = (i < n_blocks - 1).then_some(config.downsample_padding);
                DownBlock::new(
                    &vs_db / i,
                    in_channels,
                    block.out_channels,
                    time_embed_dim,
                    config.resnets(config.layers_per_block, 1.),
                    transformers,
                    downsample_padding,
                    &hook,
                )
            })
            .collect();

        let mid_block = MidBlock::new(
            &vs / "mid_block",
            last_block.out_channels,
            time_embed_dim,
            config.resnets(1, config.mid_block_scale_factor),
            config.transformers(last_block.attention_head_dim),
            &hook,
        );

        let vs_ub = &vs / "up_blocks";
        let up_blocks = (0..n_blocks)
            .map(|i| {
                let block = config.blocks[n_blocks - 1 - i];
                let prev_out_channels = match i {
                    0 => block.out_channels,
                    i => config.blocks[n_blocks - i].out_channels,
                };
                let in_channels = config.blocks[(n_blocks - 1 - i).saturating_sub(1)].out_channels;
                let mut skip_channels = vec![block.out_channels; config.layers_per_block as usize];
                skip_channels.push(in_channels);
                let transformers =
                    block.use_cross_attn.then(|| config.transformers(block.attention_head_dim));
                UpBlock::new(
                    &vs_ub / i,
                    prev_out_channels,
                    &skip_channels,
                    block.out_channels,
                    time_embed_dim,
                    config.resnets(config.layers_per_block + 1, 1.),
                    transformers,
                    i < n_blocks - 1,
                    &hook,
                )
            })
            .collect();

        let group_cfg = nn::GroupNormConfig { eps: config.norm_eps, ..Default::default() };
        let conv_norm_out =
            nn::group_norm(&vs / "conv_norm_out", config.norm_num_groups, b_channels, group_cfg);
        let conv_out = nn::conv2d(&vs / "conv_out", b_channels, out_channels, 3, conv_cfg);
        log::debug!("built a unet with {} attention layers", hook.num_layers());
        Self {
            conv_in,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
            hook,
            config,
        }
    }

    /// The hook through which all the attention layers of the model run.
    pub fn attention_hook(&self) -> &AttentionHook {
        &self.hook
    }

    /// Runs the model on `xs` of shape `(batch, channels, height, width)`,
    /// `timesteps` holds either one timestep per batch element or a single
    /// one shared by all of them.
    pub fn forward(&self, xs: &Tensor, timesteps: &Tensor, context: Option<&Tensor>) -> Tensor {
        let (bsize, _channels, height, width) = xs.size4().unwrap();
        let n_blocks = self.config.blocks.len();
        let num_upsamplers = n_blocks - 1;
        let default_overall_up_factor = 2i64.pow(num_upsamplers as u32);
        let forward_upsample_size =
            height % default_overall_up_factor != 0 || width % default_overall_up_factor != 0;
        // 0. center input if necessary
        let xs = if self.config.center_input_sample { xs * 2.0 - 1.0 } else { xs.shallow_clone() };
        // 1. time
        let timesteps = timesteps.to_device(xs.device()).reshape([-1]).expand([bsize], false);
        let emb = self.time_embedding.forward(&timesteps);
        // 2. pre-process
        let xs = xs.apply(&self.conv_in);
        // 3. down
        let mut down_block_res_xs = vec![xs.shallow_clone()];
        let mut xs = xs;
        for down_block in self.down_blocks.iter() {
            let (out, res_xs) = down_block.forward(&xs, &emb, context);
            down_block_res_xs.extend(res_xs);
            xs = out;
        }
        // 4. mid
        let xs = self.mid_block.forward(&xs, &emb, context);
        // 5. up
        let mut xs = xs;
        let mut upsample_size = None;
        for (i, up_block) in self.up_blocks.iter().enumerate() {
            let res_xs =
                down_block_res_xs.split_off(down_block_res_xs.len() - up_block.num_layers());
            if i < n_blocks - 1 && forward_upsample_size {
                let (_, _, h, w) = down_block_res_xs.last().unwrap().size4().unwrap();
                upsample_size = Some((h, w))
            }
            xs = up_block.forward(&xs, &res_xs, &emb, upsample_size, context);
        }
        // 6. post-process
        xs.apply(&self.conv_norm_out).silu().apply(&self.conv_out)
    }
}
