//! K-means cluster model: nearest-centroid assignment over a fixed set
//! of centers, turning frame embeddings into discrete HuBERT tokens.

use crate::HubertError;
use ndarray::{Array1, Array2, Array3, Axis};

/// Cluster model with centers of shape `(clusters, dim)`.
#[derive(Clone, Debug)]
pub struct KMeans {
    pub centers: Array2<f32>,
    /// Cached per-center squared norms for the distance argmin.
    center_sq_norms: Array1<f32>,
}

impl KMeans {
    pub fn new(centers: Array2<f32>) -> Self {
        let center_sq_norms = centers
            .rows()
            .into_iter()
            .map(|row| row.dot(&row))
            .collect::<Array1<f32>>();
        Self {
            centers,
            center_sq_norms,
        }
    }

    /// Load centers from a `.npy` file (f32 or f64, C-order, 2-D).
    pub fn from_npy(bytes: &[u8]) -> Result<Self, HubertError> {
        Ok(Self::new(crate::weights::load_npy_2d(bytes)?))
    }

    pub fn num_clusters(&self) -> usize {
        self.centers.shape()[0]
    }

    pub fn dim(&self) -> usize {
        self.centers.shape()[1]
    }

    /// Assign each frame of `(batch, frames, dim)` features to its
    /// nearest center, returning `(batch, frames)` indices in
    /// `[0, num_clusters)`.
    ///
    /// `||x - c||^2 = ||x||^2 - 2 x.c + ||c||^2`; the `||x||^2` term is
    /// constant per frame, so the argmin only needs `||c||^2 - 2 x.c`.
    pub fn forward(&self, features: &Array3<f32>) -> Array2<u32> {
        let (batch, frames, dim) = features.dim();
        assert_eq!(dim, self.dim(), "feature width must match center width");

        let centers_t = self.centers.t();
        let mut indices = Array2::<u32>::zeros((batch, frames));
        for b in 0..batch {
            // (frames, dim) @ (dim, clusters) → (frames, clusters)
            let scores = features.index_axis(Axis(0), b).dot(&centers_t);
            for t in 0..frames {
                let mut best = 0usize;
                let mut best_dist = f32::INFINITY;
                for c in 0..self.num_clusters() {
                    let dist = self.center_sq_norms[c] - 2.0 * scores[[t, c]];
                    if dist < best_dist {
                        best_dist = dist;
                        best = c;
                    }
                }
                indices[[b, t]] = best as u32;
            }
        }
        indices
    }
}
