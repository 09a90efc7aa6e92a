//! Layout helpers over ndarray.
//!
//! The conv front-end works channel-first, `(batch, channels, time)`;
//! the transformer works time-first, `(batch, time, hidden)`. These
//! helpers move between the two and hold the handful of elementwise ops
//! shared across modules.

use ndarray::{Array2, Array3};

/// Transpose axes 1 and 2: `(batch, d1, d2)` → `(batch, d2, d1)`.
pub fn transpose_12(x: &Array3<f32>) -> Array3<f32> {
    let (batch, d1, d2) = x.dim();
    let mut out = Array3::<f32>::zeros((batch, d2, d1));
    let src = x.as_slice().expect("contiguous input");
    let dst = out.as_slice_mut().expect("contiguous output");
    for b in 0..batch {
        let src_base = b * d1 * d2;
        let dst_base = b * d2 * d1;
        for i in 0..d1 {
            for j in 0..d2 {
                dst[dst_base + j * d1 + i] = src[src_base + i * d2 + j];
            }
        }
    }
    out
}

/// Normalize a whole waveform to zero mean and unit variance, computed
/// over every element of the array at once.
pub fn normalize_global(x: &mut Array2<f32>) {
    const EPS: f32 = 1e-5;
    let n = x.len();
    if n == 0 {
        return;
    }
    let slice = x.as_slice_mut().expect("contiguous waveform");
    let mut mean = 0.0f64;
    for &v in slice.iter() {
        mean += v as f64;
    }
    mean /= n as f64;
    let mut var = 0.0f64;
    for &v in slice.iter() {
        let diff = v as f64 - mean;
        var += diff * diff;
    }
    var /= n as f64;
    let inv_std = 1.0 / (var + EPS as f64).sqrt();
    for v in slice.iter_mut() {
        *v = ((*v as f64 - mean) * inv_std) as f32;
    }
}

/// Softmax over each row of a square attention-score matrix, fused with
/// scaling and an optional causal mask. With `causal` set, row `i` only
/// sees columns `j <= i`; masked entries come out exactly zero.
pub fn scaled_masked_softmax_inplace(scores: &mut Array2<f32>, scale: f32, causal: bool) {
    let (rows, cols) = scores.dim();
    let s = scores.as_slice_mut().expect("contiguous scores");
    for i in 0..rows {
        let row = &mut s[i * cols..(i + 1) * cols];
        let visible = if causal { (i + 1).min(cols) } else { cols };

        let mut max_val = f32::NEG_INFINITY;
        for v in row[..visible].iter_mut() {
            *v *= scale;
            if *v > max_val {
                max_val = *v;
            }
        }

        let mut sum = 0.0f32;
        for v in row[..visible].iter_mut() {
            *v = (*v - max_val).exp();
            sum += *v;
        }
        for v in row[visible..].iter_mut() {
            *v = 0.0;
        }

        if sum > 0.0 {
            let inv_sum = 1.0 / sum;
            for v in row[..visible].iter_mut() {
                *v *= inv_sum;
            }
        }
    }
}
