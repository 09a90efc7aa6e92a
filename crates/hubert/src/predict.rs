//! Inference pipeline: whole-waveform, chunked, and file-streamed
//! prediction, each optionally quantizing encoder output into cluster
//! indices.

use crate::audio::{self, AudioReader, SAMPLE_RATE};
use crate::kmeans::KMeans;
use crate::model::Hubert;
use crate::tensor;
use crate::transformer::OutputLayer;
use crate::HubertError;
use ndarray::{s, Array1, Array2, Array3, Axis};
use std::path::Path;

/// Default chunk size for in-memory chunked prediction: 10 seconds.
pub const DEFAULT_CHUNK_SIZE: usize = 16_000 * 10;

/// Default chunk duration for file-streamed prediction.
pub const DEFAULT_CHUNK_LENGTH_SEC: f64 = 10.0;

/// Output of a whole-waveform prediction, batch dimension kept.
#[derive(Clone, Debug)]
pub enum Prediction {
    /// Hidden states `(batch, frames, hidden)`.
    Hidden(Array3<f32>),
    /// Cluster indices `(batch, frames)`.
    Clusters(Array2<u32>),
}

impl Prediction {
    /// Frames along the time axis.
    pub fn frames(&self) -> usize {
        match self {
            Prediction::Hidden(h) => h.shape()[1],
            Prediction::Clusters(c) => c.shape()[1],
        }
    }
}

/// Output of a chunked prediction, with the leading batch dimension of
/// size 1 removed.
#[derive(Clone, Debug)]
pub enum ChunkedPrediction {
    /// Hidden states `(frames, hidden)`.
    Hidden(Array2<f32>),
    /// Cluster indices `(frames,)`.
    Clusters(Array1<u32>),
}

impl ChunkedPrediction {
    pub fn frames(&self) -> usize {
        match self {
            ChunkedPrediction::Hidden(h) => h.shape()[0],
            ChunkedPrediction::Clusters(c) => c.len(),
        }
    }
}

/// Ready-to-use inference wrapper around a [`Hubert`] model and an
/// optional k-means quantizer.
///
/// Construction performs the one-way weight-norm collapse, after which
/// the predictor is immutable: every entry point is side-effect-free on
/// the model's weights.
#[derive(Debug)]
pub struct HubertPredictor {
    model: Hubert,
    kmeans: Option<KMeans>,
    sample_rate: u32,
}

impl HubertPredictor {
    /// Fails when the quantizer's center width does not match the
    /// model's hidden size.
    pub fn new(mut model: Hubert, kmeans: Option<KMeans>) -> Result<Self, HubertError> {
        if let Some(kmeans) = &kmeans {
            if kmeans.dim() != model.config.hidden_size {
                return Err(HubertError::Config(format!(
                    "cluster-center width {} does not match hidden size {}",
                    kmeans.dim(),
                    model.config.hidden_size
                )));
            }
        }
        model.remove_weight_norm_();
        Ok(Self {
            model,
            kmeans,
            // True for all HuBERT models.
            sample_rate: SAMPLE_RATE,
        })
    }

    pub fn model(&self) -> &Hubert {
        &self.model
    }

    pub fn kmeans(&self) -> Option<&KMeans> {
        self.kmeans.as_ref()
    }

    fn encode(
        &self,
        waveform: &Array2<f32>,
        sample_rate: u32,
        causal: bool,
        output_layer: Option<OutputLayer>,
    ) -> Result<Prediction, HubertError> {
        let features = self.model.forward(waveform, sample_rate, causal, output_layer)?;
        Ok(match &self.kmeans {
            Some(kmeans) => Prediction::Clusters(kmeans.forward(&features)),
            None => Prediction::Hidden(features),
        })
    }

    /// Single forward pass over the whole waveform `(batch, samples)`.
    ///
    /// No chunking and no global pre-normalization; `sample_rate` is
    /// passed through purely so the model can reject non-16kHz input.
    pub fn predict(
        &self,
        waveform: &Array2<f32>,
        sample_rate: u32,
        output_layer: Option<OutputLayer>,
        causal: bool,
    ) -> Result<Prediction, HubertError> {
        self.encode(waveform, sample_rate, causal, output_layer)
    }

    /// Chunked prediction over an in-memory waveform `(1, samples)`.
    ///
    /// When the model's `pre_normalize` flag is set, the entire waveform
    /// is normalized before slicing, so the statistics are global even
    /// though compute happens per chunk. Chunks are contiguous and
    /// non-overlapping; each gets an independent attention window, and
    /// outputs are concatenated in chunk order.
    pub fn predict_in_chunks(
        &self,
        waveform: &Array2<f32>,
        sample_rate: u32,
        chunk_size: usize,
        output_layer: Option<OutputLayer>,
        causal: bool,
    ) -> Result<ChunkedPrediction, HubertError> {
        if waveform.nrows() != 1 {
            return Err(HubertError::Input(format!(
                "chunked prediction expects a single-waveform batch, got batch={}",
                waveform.nrows()
            )));
        }
        if chunk_size == 0 {
            return Err(HubertError::Input("chunk_size must be positive".to_string()));
        }

        let mut x = waveform.to_owned();
        if self.model.pre_normalize() {
            tensor::normalize_global(&mut x);
        }

        let total = x.ncols();
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < total {
            let end = (start + chunk_size).min(total);
            let chunk = x.slice(s![.., start..end]).to_owned();
            chunks.push(self.encode(&chunk, sample_rate, causal, output_layer)?);
            start = end;
        }
        tracing::debug!(chunks = chunks.len(), samples = total, "chunked prediction done");
        concat_chunks(chunks)
    }

    /// File-streamed prediction: chunks are read lazily from storage by
    /// the `reader` collaborator, so the whole file is never resident.
    ///
    /// Each chunk gets gain-normalization and mono-downmix effects and
    /// is resampled to 16 kHz if the source rate differs. Unlike
    /// [`predict_in_chunks`](Self::predict_in_chunks), normalization
    /// happens per chunk, since global statistics are not available on
    /// this path.
    pub fn predict_file(
        &self,
        path: &Path,
        chunk_length_sec: f64,
        output_layer: Option<OutputLayer>,
        causal: bool,
        reader: &dyn AudioReader,
    ) -> Result<ChunkedPrediction, HubertError> {
        let props = reader.get_audio_props(path)?;
        let chunk_length = (chunk_length_sec * self.sample_rate as f64).round() as usize;
        if chunk_length == 0 {
            return Err(HubertError::Input(
                "chunk_length_sec must be positive".to_string(),
            ));
        }

        let mut chunks = Vec::new();
        for chunk in reader.read_audio(path, chunk_length, self.sample_rate)? {
            let mut chunk = chunk?;
            audio::peak_normalize(&mut chunk);
            let chunk = audio::downmix_mono(&chunk)?;
            let chunk = if props.sample_rate != self.sample_rate {
                audio::resample(&chunk, props.sample_rate, self.sample_rate)
            } else {
                chunk
            };
            if chunk.nrows() != 1 {
                return Err(HubertError::Audio(format!(
                    "expected mono audio after channel reduction, got {} channels",
                    chunk.nrows()
                )));
            }

            let mut x = chunk;
            if self.model.pre_normalize() {
                tensor::normalize_global(&mut x);
            }
            chunks.push(self.encode(&x, self.sample_rate, causal, output_layer)?);
        }
        tracing::debug!(path = %path.display(), chunks = chunks.len(), "file prediction done");
        concat_chunks(chunks)
    }
}

/// Concatenate chunk outputs along the time axis, in chunk order, then
/// drop the leading batch dimension of size 1.
fn concat_chunks(chunks: Vec<Prediction>) -> Result<ChunkedPrediction, HubertError> {
    if chunks.is_empty() {
        return Err(HubertError::Input(
            "no chunks produced any output".to_string(),
        ));
    }
    match &chunks[0] {
        Prediction::Hidden(_) => {
            let parts: Vec<&Array3<f32>> = chunks
                .iter()
                .map(|c| match c {
                    Prediction::Hidden(h) => h,
                    Prediction::Clusters(_) => unreachable!("mixed chunk outputs"),
                })
                .collect();
            let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
            let merged = ndarray::concatenate(Axis(1), &views)
                .map_err(|e| HubertError::Input(e.to_string()))?;
            Ok(ChunkedPrediction::Hidden(
                merged.index_axis(Axis(0), 0).to_owned(),
            ))
        }
        Prediction::Clusters(_) => {
            let parts: Vec<&Array2<u32>> = chunks
                .iter()
                .map(|c| match c {
                    Prediction::Clusters(i) => i,
                    Prediction::Hidden(_) => unreachable!("mixed chunk outputs"),
                })
                .collect();
            let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
            let merged = ndarray::concatenate(Axis(1), &views)
                .map_err(|e| HubertError::Input(e.to_string()))?;
            Ok(ChunkedPrediction::Clusters(
                merged.index_axis(Axis(0), 0).to_owned(),
            ))
        }
    }
}
