//! Attention Based Building Blocks
//!
//! All the attention layers built here route the tensor used for their key
//! and value projections through an [`AttentionHook`].
use crate::control::{AttentionHook, AttentionPlace};
use tch::{nn, nn::Module, IndexOp, Kind, Tensor};

/// The precision used to compute the attention scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttentionPrecision {
    /// Queries and keys are upcast to single precision, this avoids
    /// overflows when the model runs in half precision.
    #[default]
    Fp32,
    /// Use the kind of the activations.
    Native,
}

// The most negative value representable with `kind`, used to mask scores.
fn max_neg_value(kind: Kind) -> f64 {
    match kind {
        Kind::Half => -65504.,
        Kind::BFloat16 => -3.3895313892515355e38,
        Kind::Double => f64::MIN,
        _ => f32::MIN as f64,
    }
}

#[derive(Debug)]
struct GeGlu {
    proj: nn::Linear,
}

impl GeGlu {
    fn new(vs: nn::Path, dim_in: i64, dim_out: i64) -> Self {
        let proj = nn::linear(&vs / "proj", dim_in, dim_out * 2, Default::default());
        Self { proj }
    }
}

impl Module for GeGlu {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let hidden_states_and_gate = xs.apply(&self.proj).chunk(2, -1);
        &hidden_states_and_gate[0] * hidden_states_and_gate[1].gelu("none")
    }
}

/// A feed-forward layer.
#[derive(Debug)]
struct FeedForward {
    project_in: GeGlu,
    linear: nn::Linear,
}

impl FeedForward {
    /// Creates a new feed-forward layer, the intermediary layer has
    /// `dim * mult` channels.
    fn new(vs: nn::Path, dim: i64, dim_out: Option<i64>, mult: i64) -> Self {
        let inner_dim = dim * mult;
        let dim_out = dim_out.unwrap_or(dim);
        let vs = &vs / "net";
        let project_in = GeGlu::new(&vs / 0, dim, inner_dim);
        let linear = nn::linear(&vs / 2, inner_dim, dim_out, Default::default());
        Self { project_in, linear }
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.project_in).apply(&self.linear)
    }
}

/// Multi-head attention, self-attention when no context is given.
#[derive(Debug)]
pub struct CrossAttention {
    to_q: nn::Linear,
    to_k: nn::Linear,
    to_v: nn::Linear,
    to_out: nn::Linear,
    heads: i64,
    scale: f64,
    slice_size: Option<i64>,
    precision: AttentionPrecision,
    place: Option<AttentionPlace>,
    hook: AttentionHook,
}

#[derive(Debug, Clone, Copy)]
pub struct CrossAttentionConfig {
    pub context_dim: Option<i64>,
    pub heads: i64,
    pub dim_head: i64,
    pub slice_size: Option<i64>,
    pub precision: AttentionPrecision,
    pub place: Option<AttentionPlace>,
}

impl Default for CrossAttentionConfig {
    fn default() -> Self {
        Self {
            context_dim: None,
            heads: 8,
            dim_head: 64,
            slice_size: None,
            precision: AttentionPrecision::Fp32,
            place: None,
        }
    }
}

impl CrossAttention {
    pub fn new(
        vs: nn::Path,
        query_dim: i64,
        config: CrossAttentionConfig,
        hook: &AttentionHook,
    ) -> Self {
        let no_bias = nn::LinearConfig { bias: false, ..Default::default() };
        let CrossAttentionConfig { context_dim, heads, dim_head, slice_size, precision, place } =
            config;
        let inner_dim = dim_head * heads;
        let context_dim = context_dim.unwrap_or(query_dim);
        let scale = 1.0 / f64::sqrt(dim_head as f64);
        let to_q = nn::linear(&vs / "to_q", query_dim, inner_dim, no_bias);
        let to_k = nn::linear(&vs / "to_k", context_dim, inner_dim, no_bias);
        let to_v = nn::linear(&vs / "to_v", context_dim, inner_dim, no_bias);
        let to_out = nn::linear(&vs / "to_out" / 0, inner_dim, query_dim, Default::default());
        hook.attach(place);
        Self {
            to_q,
            to_k,
            to_v,
            to_out,
            heads,
            scale,
            slice_size: slice_size.map(|size| size.max(1)),
            precision,
            place,
            hook: hook.clone(),
        }
    }

    fn reshape_heads_to_batch_dim(&self, xs: &Tensor) -> Tensor {
        let (batch_size, seq_len, dim) = xs.size3().unwrap();
        xs.reshape([batch_size, seq_len, self.heads, dim / self.heads])
            .permute([0, 2, 1, 3])
            .reshape([batch_size * self.heads, seq_len, dim / self.heads])
    }

    fn reshape_batch_dim_to_heads(&self, xs: &Tensor) -> Tensor {
        let (batch_size, seq_len, dim) = xs.size3().unwrap();
        xs.reshape([batch_size / self.heads, self.heads, seq_len, dim])
            .permute([0, 2, 1, 3])
            .reshape([batch_size / self.heads, seq_len, dim * self.heads])
    }

    // Softmax of the scaled dot products, returned in the kind of the queries.
    fn probabilities(&self, query: &Tensor, key: &Tensor, mask: Option<&Tensor>) -> Tensor {
        let query_kind = query.kind();
        let (query, key) = match self.precision {
            AttentionPrecision::Fp32 => (query.to_kind(Kind::Float), key.to_kind(Kind::Float)),
            AttentionPrecision::Native => (query.shallow_clone(), key.shallow_clone()),
        };
        let scores = query.matmul(&(key.transpose(-1, -2) * self.scale));
        let scores = match mask {
            Some(mask) => scores.masked_fill(&mask.logical_not(), max_neg_value(scores.kind())),
            None => scores,
        };
        let kind = scores.kind();
        scores.softmax(-1, kind).to_kind(query_kind)
    }

    #[allow(clippy::too_many_arguments)]
    fn sliced_attention(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        sequence_length: i64,
        dim: i64,
        slice_size: i64,
    ) -> Tensor {
        let batch_size_attention = query.size()[0];
        let mut hidden_states = Tensor::zeros(
            [batch_size_attention, sequence_length, dim / self.heads],
            (value.kind(), query.device()),
        );

        for i in 0..batch_size_attention / slice_size {
            let start_idx = i * slice_size;
            let end_idx = (i + 1) * slice_size;
            let mask = mask.map(|mask| mask.i(start_idx..end_idx));
            let xs = self
                .probabilities(
                    &query.i(start_idx..end_idx),
                    &key.i(start_idx..end_idx),
                    mask.as_ref(),
                )
                .matmul(&value.i(start_idx..end_idx));

            let idx = Tensor::arange_start(start_idx, end_idx, (Kind::Int64, query.device()));
            let _ = hidden_states.index_put_(&[Some(idx), None, None], &xs, false);
        }

        self.reshape_batch_dim_to_heads(&hidden_states)
    }

    fn attention(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
    ) -> Tensor {
        let xs = self.probabilities(query, key, mask).matmul(value);
        self.reshape_batch_dim_to_heads(&xs)
    }

    /// `mask` is a boolean tensor of shape `(batch, key_len)`, or any shape
    /// flattening to it, `false` marking the keys to ignore.
    pub fn forward(&self, xs: &Tensor, context: Option<&Tensor>, mask: Option<&Tensor>) -> Tensor {
        let sequence_length = xs.size()[1];
        let query = xs.apply(&self.to_q);
        let dim = *query.size().last().unwrap();
        let is_cross = context.is_some();
        let context = context.unwrap_or(xs).shallow_clone();
        let context = self.hook.route(context, is_cross, self.place);
        let key = context.apply(&self.to_k);
        let value = context.apply(&self.to_v);
        let query = self.reshape_heads_to_batch_dim(&query);
        let key = self.reshape_heads_to_batch_dim(&key);
        let value = self.reshape_heads_to_batch_dim(&value);
        let mask = mask.map(|mask| {
            let batch_size = mask.size()[0];
            mask.to_kind(Kind::Bool)
                .reshape([batch_size, 1, 1, -1])
                .repeat([1, self.heads, 1, 1])
                .reshape([batch_size * self.heads, 1, -1])
        });
        let mask = mask.as_ref();
        match self.slice_size {
            Some(slice_size) if query.size()[0] / slice_size > 1 => self
                .sliced_attention(&query, &key, &value, mask, sequence_length, dim, slice_size)
                .apply(&self.to_out),
            _ => self.attention(&query, &key, &value, mask).apply(&self.to_out),
        }
    }
}

/// A basic Transformer block.
#[derive(Debug)]
struct BasicTransformerBlock {
    attn1: CrossAttention,
    ff: FeedForward,
    attn2: CrossAttention,
    norm1: nn::LayerNorm,
    norm2: nn::LayerNorm,
    norm3: nn::LayerNorm,
}

impl BasicTransformerBlock {
    fn new(
        vs: nn::Path,
        dim: i64,
        n_heads: i64,
        d_head: i64,
        config: &SpatialTransformerConfig,
        hook: &AttentionHook,
    ) -> Self {
        let attn_config = CrossAttentionConfig {
            context_dim: None,
            heads: n_heads,
            dim_head: d_head,
            slice_size: config.sliced_attention_size,
            precision: config.precision,
            place: config.place,
        };
        let attn1 = CrossAttention::new(&vs / "attn1", dim, attn_config, hook);
        let ff = FeedForward::new(&vs / "ff", dim, None, 4);
        let attn_config = CrossAttentionConfig { context_dim: config.context_dim, ..attn_config };
        let attn2 = CrossAttention::new(&vs / "attn2", dim, attn_config, hook);
        let norm1 = nn::layer_norm(&vs / "norm1", vec![dim], Default::default());
        let norm2 = nn::layer_norm(&vs / "norm2", vec![dim], Default::default());
        let norm3 = nn::layer_norm(&vs / "norm3", vec![dim], Default::default());
        Self { attn1, ff, attn2, norm1, norm2, norm3 }
    }

    fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> Tensor {
        let xs = self.attn1.forward(&xs.apply(&self.norm1), None, None) + xs;
        let xs = self.attn2.forward(&xs.apply(&self.norm2), context, None) + xs;
        xs.apply(&self.norm3).apply(&self.ff) + xs
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpatialTransformerConfig {
    pub depth: i64,
    pub num_groups: i64,
    pub context_dim: Option<i64>,
    pub sliced_attention_size: Option<i64>,
    pub use_linear_projection: bool,
    pub precision: AttentionPrecision,
    /// The UNet branch the transformer belongs to.
    pub place: Option<AttentionPlace>,
}

impl Default for SpatialTransformerConfig {
    fn default() -> Self {
        Self {
            depth: 1,
            num_groups: 32,
            context_dim: None,
            sliced_attention_size: None,
            use_linear_projection: false,
            precision: AttentionPrecision::Fp32,
            place: None,
        }
    }
}

#[derive(Debug)]
enum Proj {
    Conv2D(nn::Conv2D),
    Linear(nn::Linear),
}

// Aka Transformer2DModel
#[derive(Debug)]
pub struct SpatialTransformer {
    norm: nn::GroupNorm,
    proj_in: Proj,
    transformer_blocks: Vec<BasicTransformerBlock>,
    proj_out: Proj,
    pub config: SpatialTransformerConfig,
}

impl SpatialTransformer {
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        n_heads: i64,
        d_head: i64,
        config: SpatialTransformerConfig,
        hook: &AttentionHook,
    ) -> Self {
        let inner_dim = n_heads * d_head;
        let group_cfg = nn::GroupNormConfig { eps: 1e-6, affine: true, ..Default::default() };
        let norm = nn::group_norm(&vs / "norm", config.num_groups, in_channels, group_cfg);
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 0, ..Default::default() };
        let proj_in = if config.use_linear_projection {
            Proj::Linear(nn::linear(&vs / "proj_in", in_channels, inner_dim, Default::default()))
        } else {
            Proj::Conv2D(nn::conv2d(&vs / "proj_in", in_channels, inner_dim, 1, conv_cfg))
        };
        let vs_tb = &vs / "transformer_blocks";
        let transformer_blocks = (0..config.depth)
            .map(|index| {
                BasicTransformerBlock::new(&vs_tb / index, inner_dim, n_heads, d_head, &config, hook)
            })
            .collect();
        let proj_out = if config.use_linear_projection {
            Proj::Linear(nn::linear(&vs / "proj_out", inner_dim, in_channels, Default::default()))
        } else {
            Proj::Conv2D(nn::conv2d(&vs / "proj_out", inner_dim, in_channels, 1, conv_cfg))
        };
        Self { norm, proj_in, transformer_blocks, proj_out, config }
    }

    pub fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> Tensor {
        let (batch, _channel, height, weight) = xs.size4().unwrap();
        let residual = xs;
        let xs = xs.apply(&self.norm);
        let (inner_dim, xs) = match &self.proj_in {
            Proj::Conv2D(p) => {
                let xs = xs.apply(p);
                let inner_dim = xs.size()[1];
                let xs = xs.permute([0, 2, 3, 1]).view((batch, height * weight, inner_dim));
                (inner_dim, xs)
            }
            Proj::Linear(p) => {
                let channels = xs.size()[1];
                let xs = xs.permute([0, 2, 3, 1]).view((batch, height * weight, channels)).apply(p);
                let inner_dim = xs.size()[2];
                (inner_dim, xs)
            }
        };
        let mut xs = xs;
        for block in self.transformer_blocks.iter() {
            xs = block.forward(&xs, context)
        }
        let xs = match &self.proj_out {
            Proj::Conv2D(p) => {
                xs.view((batch, height, weight, inner_dim)).permute([0, 3, 1, 2]).apply(p)
            }
            Proj::Linear(p) => {
                let xs = xs.apply(p);
                let channels = xs.size()[2];
                xs.view((batch, height, weight, channels)).permute([0, 3, 1, 2])
            }
        };
        xs + residual
    }
}
