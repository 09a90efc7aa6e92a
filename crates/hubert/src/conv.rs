//! 1D convolution over `(batch, channels, time)` tensors.
//!
//! im2col + GEMM, with symmetric zero padding and grouped-channel
//! support (the positional embedding is a grouped conv).

use ndarray::{Array1, Array2, Array3};

/// 1D convolution layer.
#[derive(Clone, Debug)]
pub struct Conv1d {
    /// Weight tensor: `(out_channels, in_channels / groups, kernel_size)`.
    pub weight: Array3<f32>,
    /// Bias vector: `(out_channels,)`.
    pub bias: Option<Array1<f32>>,
    pub stride: usize,
    /// Symmetric zero padding on both ends of the time axis.
    pub padding: usize,
    pub groups: usize,
    /// Per-group weight matrices `(out_c / groups, in_c / groups * kernel)`.
    group_mats: Vec<Array2<f32>>,
    out_channels: usize,
    in_channels: usize,
    kernel_size: usize,
}

impl Conv1d {
    pub fn new(
        weight: Array3<f32>,
        bias: Option<Array1<f32>>,
        stride: usize,
        padding: usize,
        groups: usize,
    ) -> Self {
        let out_channels = weight.shape()[0];
        let in_per_group = weight.shape()[1];
        let kernel_size = weight.shape()[2];
        assert!(groups > 0 && stride > 0, "stride and groups must be positive");
        assert_eq!(out_channels % groups, 0, "out_channels must be divisible by groups");
        let out_per_group = out_channels / groups;
        let in_channels = in_per_group * groups;
        let col_rows = in_per_group * kernel_size;

        // Pre-reshape each group's weights into a GEMM-ready matrix.
        let group_mats = (0..groups)
            .map(|g| {
                let mut mat = Array2::<f32>::zeros((out_per_group, col_rows));
                for oc in 0..out_per_group {
                    for ic in 0..in_per_group {
                        for k in 0..kernel_size {
                            mat[[oc, ic * kernel_size + k]] =
                                weight[[g * out_per_group + oc, ic, k]];
                        }
                    }
                }
                mat
            })
            .collect();

        Self {
            weight,
            bias,
            stride,
            padding,
            groups,
            group_mats,
            out_channels,
            in_channels,
            kernel_size,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Output length for an input of `time` samples. Saturates at zero
    /// when the input is shorter than the kernel.
    pub fn out_len(&self, time: usize) -> usize {
        let padded = time + 2 * self.padding;
        if padded < self.kernel_size {
            0
        } else {
            (padded - self.kernel_size) / self.stride + 1
        }
    }

    /// Forward pass: `(batch, in_c, time)` → `(batch, out_c, out_time)`.
    pub fn forward(&self, input: &Array3<f32>) -> Array3<f32> {
        let (batch, in_c, time) = input.dim();
        assert_eq!(in_c, self.in_channels, "input channels mismatch");

        let ks = self.kernel_size;
        let stride = self.stride;
        let padding = self.padding;
        let out_time = self.out_len(time);
        let in_per_group = self.in_channels / self.groups;
        let out_per_group = self.out_channels / self.groups;
        let col_rows = in_per_group * ks;

        let mut output = Array3::<f32>::zeros((batch, self.out_channels, out_time));
        if out_time == 0 {
            return output;
        }
        let input_slice = input.as_slice().expect("contiguous input");

        for b in 0..batch {
            let b_input_offset = b * in_c * time;

            for g in 0..self.groups {
                let mut col = Array2::<f32>::zeros((col_rows, out_time));
                let col_slice = col.as_slice_mut().expect("contiguous col");

                for ic in 0..in_per_group {
                    let ic_input_base = b_input_offset + (g * in_per_group + ic) * time;
                    let col_ic_base = ic * ks;
                    for k in 0..ks {
                        let col_row_base = (col_ic_base + k) * out_time;
                        // Valid t_out range: 0 <= t_out*stride + k - padding < time
                        let t_start = if k >= padding {
                            0
                        } else {
                            (padding - k).div_ceil(stride)
                        };
                        let t_end = if time + padding > k {
                            ((time + padding - k - 1) / stride + 1).min(out_time)
                        } else {
                            0
                        };
                        if t_start >= t_end {
                            continue;
                        }
                        if stride == 1 {
                            let len = t_end - t_start;
                            let src_start = ic_input_base + t_start + k - padding;
                            col_slice[col_row_base + t_start..col_row_base + t_start + len]
                                .copy_from_slice(&input_slice[src_start..src_start + len]);
                        } else {
                            for t_out in t_start..t_end {
                                let t_in = t_out * stride + k - padding;
                                col_slice[col_row_base + t_out] =
                                    input_slice[ic_input_base + t_in];
                            }
                        }
                    }
                }

                // GEMM: (out_per_group, col_rows) @ (col_rows, out_time)
                let result = self.group_mats[g].dot(&col);

                let result_slice = result.as_slice().expect("contiguous result");
                let output_slice = output.as_slice_mut().expect("contiguous output");
                let b_output_offset = b * self.out_channels * out_time;

                for oc in 0..out_per_group {
                    let oc_global = g * out_per_group + oc;
                    let r_base = oc * out_time;
                    let o_base = b_output_offset + oc_global * out_time;
                    match &self.bias {
                        Some(bias) => {
                            let bias_val = bias[oc_global];
                            for t in 0..out_time {
                                output_slice[o_base + t] = result_slice[r_base + t] + bias_val;
                            }
                        }
                        None => {
                            output_slice[o_base..o_base + out_time]
                                .copy_from_slice(&result_slice[r_base..r_base + out_time]);
                        }
                    }
                }
            }
        }

        output
    }
}
