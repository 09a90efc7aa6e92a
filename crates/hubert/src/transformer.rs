//! Transformer encoder: attention, feed-forward, and the two layer/stack
//! variants (post-norm and stable pre-norm) selected by configuration.

use crate::config::{Activation, HubertConfig};
use crate::pos_embed::PositionalConvEmbedding;
use crate::HubertError;
use ndarray::{s, Array1, Array2, Array3};

/// Which transformer layer to stop at.
///
/// `Layer` is a raw index (negatives count from the end); `Fraction`
/// picks a depth as a share of the stack, rounded to nearest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputLayer {
    Layer(isize),
    Fraction(f64),
}

impl From<isize> for OutputLayer {
    fn from(v: isize) -> Self {
        OutputLayer::Layer(v)
    }
}

impl From<f64> for OutputLayer {
    fn from(v: f64) -> Self {
        OutputLayer::Fraction(v)
    }
}

/// Resolve an output-layer spec against a stack of `num_layers` layers.
/// Returns the concrete index, or `None` when no early exit was asked for.
pub fn resolve_output_layer(
    output_layer: Option<OutputLayer>,
    num_layers: usize,
) -> Result<Option<usize>, HubertError> {
    let Some(spec) = output_layer else {
        return Ok(None);
    };
    let mut idx = match spec {
        OutputLayer::Layer(i) => i,
        OutputLayer::Fraction(f) => (f * num_layers as f64).round() as isize,
    };
    if idx < 0 {
        idx += num_layers as isize;
    }
    if idx < 0 || idx >= num_layers as isize {
        return Err(HubertError::Input(format!(
            "output_layer={idx} is outside the range of available layers (0..{num_layers})"
        )));
    }
    Ok(Some(idx as usize))
}

/// Dense layer: `y = x @ W^T + b` over `(batch, time, in)` inputs.
#[derive(Clone, Debug)]
pub struct Linear {
    /// Weight matrix: `(out, in)`.
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Self { weight, bias }
    }

    pub fn zeros(out_dim: usize, in_dim: usize, bias: bool) -> Self {
        Self {
            weight: Array2::zeros((out_dim, in_dim)),
            bias: bias.then(|| Array1::zeros(out_dim)),
        }
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let (batch, time, _in_dim) = x.dim();
        let out_dim = self.weight.shape()[0];
        let weight_t = self.weight.t();
        let mut out = Array3::<f32>::zeros((batch, time, out_dim));
        for b in 0..batch {
            let mut y = x.index_axis(ndarray::Axis(0), b).dot(&weight_t);
            if let Some(ref bias) = self.bias {
                y += bias;
            }
            out.index_axis_mut(ndarray::Axis(0), b).assign(&y);
        }
        out
    }
}

/// Layer normalization over the last axis of `(batch, time, hidden)`.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(weight: Array1<f32>, bias: Array1<f32>, eps: f32) -> Self {
        Self { weight, bias, eps }
    }

    pub fn identity(dim: usize, eps: f32) -> Self {
        Self {
            weight: Array1::ones(dim),
            bias: Array1::zeros(dim),
            eps,
        }
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let (batch, time, dim) = x.dim();
        let mut out = x.clone();
        let slice = out.as_slice_mut().expect("contiguous input");
        let w = self.weight.as_slice().expect("contiguous weight");
        let bias = self.bias.as_slice().expect("contiguous bias");

        for row in 0..batch * time {
            let v = &mut slice[row * dim..(row + 1) * dim];
            let mut mean = 0.0f32;
            for &x in v.iter() {
                mean += x;
            }
            mean /= dim as f32;

            let mut var = 0.0f32;
            for &x in v.iter() {
                let diff = x - mean;
                var += diff * diff;
            }
            var /= dim as f32;

            let inv_std = 1.0 / (var + self.eps).sqrt();
            for (i, x) in v.iter_mut().enumerate() {
                *x = w[i] * (*x - mean) * inv_std + bias[i];
            }
        }

        out
    }
}

/// Multi-head self-attention over a single sequence.
///
/// Full pass every call, with no KV cache and no padding mask; the
/// caller supplies only valid timesteps.
#[derive(Clone, Debug)]
pub struct Attention {
    pub embed_dim: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub q_proj: Linear,
    pub k_proj: Linear,
    pub v_proj: Linear,
    pub out_proj: Linear,
}

impl Attention {
    pub fn new(embed_dim: usize, num_heads: usize) -> Result<Self, HubertError> {
        if num_heads == 0 || embed_dim % num_heads != 0 {
            return Err(HubertError::Config(format!(
                "embed_dim ({embed_dim}) must be divisible by num_heads ({num_heads})"
            )));
        }
        let head_dim = embed_dim / num_heads;
        Ok(Self {
            embed_dim,
            num_heads,
            head_dim,
            q_proj: Linear::zeros(embed_dim, embed_dim, true),
            k_proj: Linear::zeros(embed_dim, embed_dim, true),
            v_proj: Linear::zeros(embed_dim, embed_dim, true),
            out_proj: Linear::zeros(embed_dim, embed_dim, true),
        })
    }

    /// Forward pass: `(batch, time, hidden)` → `(batch, time, hidden)`.
    pub fn forward(&self, hidden: &Array3<f32>, causal: bool) -> Array3<f32> {
        let (batch, time, _) = hidden.dim();
        let scale = 1.0 / (self.head_dim as f32).sqrt();

        let q = self.q_proj.forward(hidden);
        let k = self.k_proj.forward(hidden);
        let v = self.v_proj.forward(hidden);

        let mut context = Array3::<f32>::zeros((batch, time, self.embed_dim));
        for b in 0..batch {
            for h in 0..self.num_heads {
                let h0 = h * self.head_dim;
                let h1 = h0 + self.head_dim;
                let q_h = q.slice(s![b, .., h0..h1]);
                let k_h = k.slice(s![b, .., h0..h1]);
                let v_h = v.slice(s![b, .., h0..h1]);

                // (time, head_dim) @ (head_dim, time) → (time, time)
                let mut scores = q_h.dot(&k_h.t());
                crate::tensor::scaled_masked_softmax_inplace(&mut scores, scale, causal);

                let ctx = scores.dot(&v_h);
                context.slice_mut(s![b, .., h0..h1]).assign(&ctx);
            }
        }

        self.out_proj.forward(&context)
    }
}

/// Two linear maps around the configured activation.
#[derive(Clone, Debug)]
pub struct FeedForward {
    pub intermediate_dense: Linear,
    pub output_dense: Linear,
    pub activation: Activation,
}

impl FeedForward {
    pub fn new(config: &HubertConfig) -> Self {
        Self {
            intermediate_dense: Linear::zeros(config.intermediate_size, config.hidden_size, true),
            output_dense: Linear::zeros(config.hidden_size, config.intermediate_size, true),
            activation: config.hidden_act,
        }
    }

    pub fn forward(&self, hidden: &Array3<f32>) -> Array3<f32> {
        let mut h = self.intermediate_dense.forward(hidden);
        self.activation
            .apply_inplace(h.as_slice_mut().expect("contiguous hidden"));
        self.output_dense.forward(&h)
    }
}

/// Post-norm transformer layer:
/// `h' = LN(h + Attn(h)); out = LN(h' + FFN(h'))`.
#[derive(Clone, Debug)]
pub struct EncoderLayer {
    pub attention: Attention,
    pub layer_norm: LayerNorm,
    pub feed_forward: FeedForward,
    pub final_layer_norm: LayerNorm,
}

impl EncoderLayer {
    pub fn new(config: &HubertConfig) -> Result<Self, HubertError> {
        Ok(Self {
            attention: Attention::new(config.hidden_size, config.num_attention_heads)?,
            layer_norm: LayerNorm::identity(config.hidden_size, config.layer_norm_eps),
            feed_forward: FeedForward::new(config),
            final_layer_norm: LayerNorm::identity(config.hidden_size, config.layer_norm_eps),
        })
    }

    pub fn forward(&self, hidden: &Array3<f32>, causal: bool) -> Array3<f32> {
        let attn_out = self.attention.forward(hidden, causal);
        let h = self.layer_norm.forward(&(hidden + &attn_out));
        let ff_out = self.feed_forward.forward(&h);
        self.final_layer_norm.forward(&(&h + &ff_out))
    }
}

/// Stable (pre-norm) transformer layer:
/// `h' = h + Attn(LN(h)); out = h' + FFN(LN(h'))`.
///
/// No trailing normalization inside the layer; the stable stack applies
/// it once after the layer loop instead.
#[derive(Clone, Debug)]
pub struct EncoderLayerStableLayerNorm {
    pub attention: Attention,
    pub layer_norm: LayerNorm,
    pub feed_forward: FeedForward,
    pub final_layer_norm: LayerNorm,
}

impl EncoderLayerStableLayerNorm {
    pub fn new(config: &HubertConfig) -> Result<Self, HubertError> {
        Ok(Self {
            attention: Attention::new(config.hidden_size, config.num_attention_heads)?,
            layer_norm: LayerNorm::identity(config.hidden_size, config.layer_norm_eps),
            feed_forward: FeedForward::new(config),
            final_layer_norm: LayerNorm::identity(config.hidden_size, config.layer_norm_eps),
        })
    }

    pub fn forward(&self, hidden: &Array3<f32>, causal: bool) -> Array3<f32> {
        let normed = self.layer_norm.forward(hidden);
        let h = hidden + &self.attention.forward(&normed, causal);
        let normed = self.final_layer_norm.forward(&h);
        &h + &self.feed_forward.forward(&normed)
    }
}

/// Post-norm encoder stack. Normalization runs before the layer loop,
/// right after the positional embedding is added. This asymmetry with
/// the stable stack is a property of the published architecture.
#[derive(Clone, Debug)]
pub struct Encoder {
    pub pos_conv_embed: PositionalConvEmbedding,
    pub layer_norm: LayerNorm,
    pub layers: Vec<EncoderLayer>,
}

impl Encoder {
    pub fn new(config: &HubertConfig) -> Result<Self, HubertError> {
        let layers = (0..config.num_hidden_layers)
            .map(|_| EncoderLayer::new(config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            pos_conv_embed: PositionalConvEmbedding::new(config),
            layer_norm: LayerNorm::identity(config.hidden_size, config.layer_norm_eps),
            layers,
        })
    }

    pub fn forward(
        &self,
        hidden: &Array3<f32>,
        causal: bool,
        output_layer: Option<OutputLayer>,
    ) -> Result<Array3<f32>, HubertError> {
        let stop = resolve_output_layer(output_layer, self.layers.len())?;
        let position_embeddings = self.pos_conv_embed.forward(hidden);
        let mut h = hidden + &position_embeddings;
        h = self.layer_norm.forward(&h);
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h, causal);
            if stop == Some(i) {
                break;
            }
        }
        Ok(h)
    }
}

/// Stable (pre-norm) encoder stack. Normalization runs once after the
/// layer loop.
#[derive(Clone, Debug)]
pub struct EncoderStableLayerNorm {
    pub pos_conv_embed: PositionalConvEmbedding,
    pub layer_norm: LayerNorm,
    pub layers: Vec<EncoderLayerStableLayerNorm>,
}

impl EncoderStableLayerNorm {
    pub fn new(config: &HubertConfig) -> Result<Self, HubertError> {
        let layers = (0..config.num_hidden_layers)
            .map(|_| EncoderLayerStableLayerNorm::new(config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            pos_conv_embed: PositionalConvEmbedding::new(config),
            layer_norm: LayerNorm::identity(config.hidden_size, config.layer_norm_eps),
            layers,
        })
    }

    pub fn forward(
        &self,
        hidden: &Array3<f32>,
        causal: bool,
        output_layer: Option<OutputLayer>,
    ) -> Result<Array3<f32>, HubertError> {
        let stop = resolve_output_layer(output_layer, self.layers.len())?;
        let position_embeddings = self.pos_conv_embed.forward(hidden);
        let mut h = hidden + &position_embeddings;
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h, causal);
            if stop == Some(i) {
                break;
            }
        }
        Ok(self.layer_norm.forward(&h))
    }
}
