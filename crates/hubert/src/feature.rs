//! Convolutional feature extractor and feature projection.
//!
//! The extractor reduces a raw waveform `(batch, samples)` to a
//! downsampled feature sequence `(batch, channels, frames)` through a
//! cascade of strided 1-D convolutions; the projection maps the final
//! conv width up to the transformer's hidden width.

use crate::config::{Activation, HubertConfig};
use crate::conv::Conv1d;
use crate::tensor;
use crate::transformer::{LayerNorm, Linear};
use crate::HubertError;
use ndarray::{Array1, Array3};

/// Per-channel normalization over the time axis (torch `GroupNorm` with
/// `num_groups == num_channels`).
#[derive(Clone, Debug)]
pub struct GroupNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
}

impl GroupNorm {
    pub fn identity(channels: usize) -> Self {
        Self {
            weight: Array1::ones(channels),
            bias: Array1::zeros(channels),
            eps: 1e-5,
        }
    }

    /// Forward over `(batch, channels, time)`.
    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let (batch, channels, time) = x.dim();
        let mut out = x.clone();
        let slice = out.as_slice_mut().expect("contiguous input");
        for b in 0..batch {
            for c in 0..channels {
                let row = &mut slice[(b * channels + c) * time..(b * channels + c + 1) * time];
                let mut mean = 0.0f32;
                for &v in row.iter() {
                    mean += v;
                }
                mean /= time as f32;
                let mut var = 0.0f32;
                for &v in row.iter() {
                    let diff = v - mean;
                    var += diff * diff;
                }
                var /= time as f32;
                let inv_std = 1.0 / (var + self.eps).sqrt();
                let w = self.weight[c];
                let bias = self.bias[c];
                for v in row.iter_mut() {
                    *v = w * (*v - mean) * inv_std + bias;
                }
            }
        }
        out
    }
}

/// Normalization applied after a feature-extractor conv.
#[derive(Clone, Debug)]
pub enum ConvNorm {
    /// Per-channel group normalization (first layer of the "group" style).
    Group(GroupNorm),
    /// Layer normalization over channels at each timestep ("layer" style).
    Layer(LayerNorm),
    None,
}

/// One conv stage: convolution, optional normalization, nonlinearity.
#[derive(Clone, Debug)]
pub struct ConvLayer {
    pub conv: Conv1d,
    pub norm: ConvNorm,
    pub activation: Activation,
}

impl ConvLayer {
    fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let mut h = self.conv.forward(x);
        h = match &self.norm {
            ConvNorm::Group(norm) => norm.forward(&h),
            ConvNorm::Layer(norm) => {
                // LayerNorm runs over the channel axis, so flip to
                // (batch, time, channels) and back.
                let time_first = tensor::transpose_12(&h);
                tensor::transpose_12(&norm.forward(&time_first))
            }
            ConvNorm::None => h,
        };
        self.activation
            .apply_inplace(h.as_slice_mut().expect("contiguous features"));
        h
    }
}

/// The full conv cascade.
#[derive(Clone, Debug)]
pub struct FeatureExtractor {
    pub conv_layers: Vec<ConvLayer>,
}

impl FeatureExtractor {
    /// Zero-initialized extractor per the configured schedule. Fails on
    /// an unrecognized normalization style.
    pub fn new(config: &HubertConfig) -> Result<Self, HubertError> {
        let num_layers = config.num_feat_extract_layers();
        let mut conv_layers = Vec::with_capacity(num_layers);
        for layer_id in 0..num_layers {
            let in_dim = if layer_id == 0 {
                1
            } else {
                config.conv_dim[layer_id - 1]
            };
            let out_dim = config.conv_dim[layer_id];
            let conv = Conv1d::new(
                Array3::zeros((out_dim, in_dim, config.conv_kernel[layer_id])),
                config.conv_bias.then(|| Array1::zeros(out_dim)),
                config.conv_stride[layer_id],
                0,
                1,
            );
            let norm = match config.feat_extract_norm.as_str() {
                "group" => {
                    if layer_id == 0 {
                        ConvNorm::Group(GroupNorm::identity(out_dim))
                    } else {
                        ConvNorm::None
                    }
                }
                "layer" => ConvNorm::Layer(LayerNorm::identity(out_dim, config.layer_norm_eps)),
                other => {
                    return Err(HubertError::Config(format!(
                        "feat_extract_norm must be one of [\"group\", \"layer\"], got {other:?}"
                    )))
                }
            };
            conv_layers.push(ConvLayer {
                conv,
                norm,
                activation: config.feat_extract_activation,
            });
        }
        Ok(Self { conv_layers })
    }

    /// Forward pass: `(batch, samples)` → `(batch, channels, frames)`.
    pub fn forward(&self, input_values: &ndarray::Array2<f32>) -> Array3<f32> {
        let (batch, samples) = input_values.dim();
        let mut h = input_values
            .to_owned()
            .into_shape_with_order((batch, 1, samples))
            .expect("waveform reshape");
        for layer in &self.conv_layers {
            h = layer.forward(&h);
        }
        h
    }
}

/// Linear map from conv feature width to hidden width, with optional
/// pre-normalization. Input is `(batch, frames, conv_dim)`.
#[derive(Clone, Debug)]
pub struct FeatureProjection {
    pub layer_norm: Option<LayerNorm>,
    pub projection: Linear,
}

impl FeatureProjection {
    pub fn new(config: &HubertConfig) -> Self {
        let conv_out = *config.conv_dim.last().expect("validated schedule");
        Self {
            layer_norm: config
                .feat_proj_layer_norm
                .then(|| LayerNorm::identity(conv_out, config.layer_norm_eps)),
            projection: Linear::zeros(config.hidden_size, conv_out, true),
        }
    }

    pub fn forward(&self, hidden: &Array3<f32>) -> Array3<f32> {
        match &self.layer_norm {
            Some(norm) => self.projection.forward(&norm.forward(hidden)),
            None => self.projection.forward(hidden),
        }
    }
}
