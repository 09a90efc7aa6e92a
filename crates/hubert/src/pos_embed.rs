//! Convolutional relative-position embedding.
//!
//! One grouped conv over the time axis with `kernel / 2` padding; even
//! kernels produce one extra trailing timestep, trimmed to restore
//! same-padding. The conv weight arrives from checkpoints in a
//! weight-normalized decomposition (`weight_g` / `weight_v`); the two
//! forms are kept as distinct representations, and collapsing to a
//! dense kernel is a one-way transition done before inference.

use crate::config::{Activation, HubertConfig};
use crate::conv::Conv1d;
use crate::tensor;
use ndarray::{Array1, Array3};

/// The positional conv weight, in either parameterization.
#[derive(Clone, Debug)]
pub enum PosConvWeight {
    /// Decomposed magnitude/direction pair (torch `weight_norm`, dim=2):
    /// `weight_g` is `(1, 1, kernel)`, `weight_v` is the full kernel shape.
    Normalized {
        weight_g: Array3<f32>,
        weight_v: Array3<f32>,
        bias: Option<Array1<f32>>,
    },
    /// Collapsed single dense kernel, ready for inference.
    Collapsed(Conv1d),
}

#[derive(Clone, Debug)]
pub struct PositionalConvEmbedding {
    pub weight: PosConvWeight,
    kernel_size: usize,
    groups: usize,
    num_pad_remove: usize,
    activation: Activation,
}

/// Collapse a weight-norm pair into a single dense kernel:
/// `w[:, :, k] = v[:, :, k] * g[k] / ||v[:, :, k]||`.
pub fn collapse_weight_norm(weight_g: &Array3<f32>, weight_v: &Array3<f32>) -> Array3<f32> {
    let (out_c, in_c, kernel) = weight_v.dim();
    let mut weight = Array3::<f32>::zeros((out_c, in_c, kernel));
    for k in 0..kernel {
        let mut norm_sq = 0.0f32;
        for o in 0..out_c {
            for i in 0..in_c {
                let v = weight_v[[o, i, k]];
                norm_sq += v * v;
            }
        }
        let scale = weight_g[[0, 0, k]] / norm_sq.sqrt().max(1e-12);
        for o in 0..out_c {
            for i in 0..in_c {
                weight[[o, i, k]] = weight_v[[o, i, k]] * scale;
            }
        }
    }
    weight
}

impl PositionalConvEmbedding {
    /// Zero-initialized embedding in the collapsed form.
    pub fn new(config: &HubertConfig) -> Self {
        let kernel = config.num_conv_pos_embeddings;
        let groups = config.num_conv_pos_embedding_groups;
        let weight = Array3::zeros((config.hidden_size, config.hidden_size / groups, kernel));
        let bias = Some(Array1::zeros(config.hidden_size));
        Self {
            weight: PosConvWeight::Collapsed(Self::build_conv(weight, bias, kernel, groups)),
            kernel_size: kernel,
            groups,
            num_pad_remove: if kernel % 2 == 0 { 1 } else { 0 },
            activation: config.feat_extract_activation,
        }
    }

    /// Build from a checkpoint's weight-normalized parameterization.
    pub fn with_weight_norm(
        config: &HubertConfig,
        weight_g: Array3<f32>,
        weight_v: Array3<f32>,
        bias: Option<Array1<f32>>,
    ) -> Self {
        let kernel = config.num_conv_pos_embeddings;
        Self {
            weight: PosConvWeight::Normalized {
                weight_g,
                weight_v,
                bias,
            },
            kernel_size: kernel,
            groups: config.num_conv_pos_embedding_groups,
            num_pad_remove: if kernel % 2 == 0 { 1 } else { 0 },
            activation: config.feat_extract_activation,
        }
    }

    /// Build from an already-dense kernel.
    pub fn with_dense(
        config: &HubertConfig,
        weight: Array3<f32>,
        bias: Option<Array1<f32>>,
    ) -> Self {
        let kernel = config.num_conv_pos_embeddings;
        let groups = config.num_conv_pos_embedding_groups;
        Self {
            weight: PosConvWeight::Collapsed(Self::build_conv(weight, bias, kernel, groups)),
            kernel_size: kernel,
            groups,
            num_pad_remove: if kernel % 2 == 0 { 1 } else { 0 },
            activation: config.feat_extract_activation,
        }
    }

    fn build_conv(
        weight: Array3<f32>,
        bias: Option<Array1<f32>>,
        kernel: usize,
        groups: usize,
    ) -> Conv1d {
        Conv1d::new(weight, bias, 1, kernel / 2, groups)
    }

    pub fn is_weight_normalized(&self) -> bool {
        matches!(self.weight, PosConvWeight::Normalized { .. })
    }

    /// One-way collapse of the weight-norm decomposition. A second call
    /// is a no-op.
    pub fn remove_weight_norm_(&mut self) {
        if let PosConvWeight::Normalized {
            weight_g,
            weight_v,
            bias,
        } = &self.weight
        {
            let dense = collapse_weight_norm(weight_g, weight_v);
            self.weight = PosConvWeight::Collapsed(Self::build_conv(
                dense,
                bias.clone(),
                self.kernel_size,
                self.groups,
            ));
        }
    }

    /// Forward pass: `(batch, time, hidden)` → `(batch, time, hidden)`.
    pub fn forward(&self, hidden: &Array3<f32>) -> Array3<f32> {
        let channel_first = tensor::transpose_12(hidden);

        let mut out = match &self.weight {
            PosConvWeight::Collapsed(conv) => conv.forward(&channel_first),
            // Collapse on the fly; numerically identical to the
            // decomposed forward, just not cached.
            PosConvWeight::Normalized {
                weight_g,
                weight_v,
                bias,
            } => {
                let dense = collapse_weight_norm(weight_g, weight_v);
                Self::build_conv(dense, bias.clone(), self.kernel_size, self.groups)
                    .forward(&channel_first)
            }
        };

        if self.num_pad_remove > 0 {
            let (_b, _c, t) = out.dim();
            out = out
                .slice(ndarray::s![.., .., ..t - self.num_pad_remove])
                .to_owned();
        }
        self.activation
            .apply_inplace(out.as_slice_mut().expect("contiguous output"));

        tensor::transpose_12(&out)
    }
}
