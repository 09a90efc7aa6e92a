//! HuBERT architecture configuration.

use crate::HubertError;
use serde::{Deserialize, Serialize};

/// Activation functions used inside the encoder. The pretrained
/// checkpoints all use GELU; ReLU is kept for custom configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Gelu,
    Relu,
}

impl Activation {
    /// Apply the activation in place over a flat f32 buffer.
    pub fn apply_inplace(self, xs: &mut [f32]) {
        match self {
            Activation::Gelu => {
                // tanh approximation of GELU
                const GELU_COEFF: f32 = 0.7978845608;
                for v in xs.iter_mut() {
                    let x = *v;
                    *v = x * 0.5 * (1.0 + (GELU_COEFF * (x + 0.044715 * x * x * x)).tanh());
                }
            }
            Activation::Relu => {
                for v in xs.iter_mut() {
                    if *v < 0.0 {
                        *v = 0.0;
                    }
                }
            }
        }
    }
}

/// Immutable description of a HuBERT architecture.
///
/// Dropout rates are part of the published architecture contract but
/// are inert here, since this crate is inference-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: Activation,
    pub hidden_dropout: f32,
    pub activation_dropout: f32,
    pub feat_proj_layer_norm: bool,
    pub feat_proj_dropout: f32,
    pub layer_norm_eps: f32,
    /// Conv-layer normalization style: "group" or "layer".
    pub feat_extract_norm: String,
    pub feat_extract_dropout: f32,
    pub feat_extract_activation: Activation,
    /// Output channels of each feature-extractor conv layer.
    pub conv_dim: Vec<usize>,
    /// Strides of each feature-extractor conv layer.
    pub conv_stride: Vec<usize>,
    /// Kernel widths of each feature-extractor conv layer.
    pub conv_kernel: Vec<usize>,
    pub conv_bias: bool,
    /// Kernel width of the positional conv embedding.
    pub num_conv_pos_embeddings: usize,
    /// Group count of the positional conv embedding.
    pub num_conv_pos_embedding_groups: usize,
    /// Selects the stable (pre-norm) transformer variant.
    pub do_stable_layer_norm: bool,
    /// Normalize the whole waveform before encoding.
    pub pre_normalize: bool,
}

impl HubertConfig {
    /// Number of feature-extractor conv layers, defined by the schedule length.
    pub fn num_feat_extract_layers(&self) -> usize {
        self.conv_dim.len()
    }

    /// Check the schedule-length invariant: dims, strides and kernels
    /// must describe the same number of layers.
    pub fn validate(&self) -> Result<(), HubertError> {
        if self.conv_dim.len() != self.conv_stride.len()
            || self.conv_dim.len() != self.conv_kernel.len()
        {
            return Err(HubertError::Config(format!(
                "conv schedules must have equal length, got dims={} strides={} kernels={}",
                self.conv_dim.len(),
                self.conv_stride.len(),
                self.conv_kernel.len()
            )));
        }
        if self.conv_dim.is_empty() {
            return Err(HubertError::Config(
                "conv schedule must have at least one layer".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of output frames the conv cascade produces for a waveform of
    /// `samples` samples, or an error if the waveform is too short to
    /// produce a single frame.
    pub fn feature_frames(&self, samples: usize) -> Result<usize, HubertError> {
        let mut t = samples;
        for (kernel, stride) in self.conv_kernel.iter().zip(&self.conv_stride) {
            if t < *kernel {
                return Err(HubertError::Input(format!(
                    "waveform of {samples} samples is too short for the conv receptive field"
                )));
            }
            t = (t - kernel) / stride + 1;
        }
        Ok(t)
    }
}
