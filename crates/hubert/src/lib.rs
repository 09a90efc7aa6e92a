//! HuBERT speech encoder inference.
//!
//! Computes frame-level embeddings (and optionally k-means cluster tokens)
//! from 16kHz mono waveforms using the pretrained HuBERT transformer
//! family (`base`, `large`, `extra_large`). Runs entirely on CPU over
//! `ndarray`; no GPU required.
//!
//! ```no_run
//! use hubert::{build_model, DirFetcher, HubertSize};
//!
//! let fetcher = DirFetcher::new("/path/to/checkpoints");
//! let model = build_model(HubertSize::Base, &fetcher)?;
//! let predictor = model.predictor(None)?;
//!
//! // (1, 16000) waveform of zeros → (1, T, 768) embeddings.
//! let waveform = ndarray::Array2::<f32>::zeros((1, 16_000));
//! let out = predictor.predict(&waveform, 16_000, None, false)?;
//! # Ok::<(), hubert::HubertError>(())
//! ```
//!
//! For discrete HuBERT tokens, pair the encoder with a k-means model:
//!
//! ```no_run
//! use hubert::{build_model_with_kmeans, DirFetcher, HubertKmeansSize};
//!
//! let fetcher = DirFetcher::new("/path/to/checkpoints");
//! let (model, kmeans) = build_model_with_kmeans(HubertKmeansSize::BaseL7C100, &fetcher)?;
//! let predictor = model.predictor(Some(kmeans))?;
//! # Ok::<(), hubert::HubertError>(())
//! ```

pub mod audio;
pub mod config;
pub mod conv;
pub mod feature;
pub mod kmeans;
pub mod model;
pub mod pos_embed;
pub mod predict;
pub mod pretrained;
pub mod tensor;
pub mod transformer;
pub mod weights;

pub use audio::{AudioProps, AudioReader, WavReader, SAMPLE_RATE};
pub use config::{Activation, HubertConfig};
pub use kmeans::KMeans;
pub use model::Hubert;
pub use predict::{
    ChunkedPrediction, HubertPredictor, Prediction, DEFAULT_CHUNK_LENGTH_SEC, DEFAULT_CHUNK_SIZE,
};
pub use pretrained::{
    build_model, build_model_with_kmeans, CheckpointFetcher, CheckpointSpec, DirFetcher,
    HubertKmeansSize, HubertSize,
};
pub use transformer::OutputLayer;

/// Error type for HuBERT inference operations.
#[derive(Debug, thiserror::Error)]
pub enum HubertError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Failed to load weights: {0}")]
    WeightLoad(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
