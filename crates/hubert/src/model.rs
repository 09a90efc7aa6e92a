//! Model assembly: feature extractor → projection → encoder stack.

use crate::config::HubertConfig;
use crate::feature::{FeatureExtractor, FeatureProjection};
use crate::kmeans::KMeans;
use crate::predict::HubertPredictor;
use crate::tensor;
use crate::transformer::{
    resolve_output_layer, Encoder, EncoderStableLayerNorm, OutputLayer,
};
use crate::HubertError;
use ndarray::{Array2, Array3};

/// The two encoder stack variants, selected once at construction from
/// the configuration's normalization-order flag.
#[derive(Clone, Debug)]
pub enum EncoderStack {
    PostNorm(Encoder),
    StableLayerNorm(EncoderStableLayerNorm),
}

impl EncoderStack {
    pub fn num_layers(&self) -> usize {
        match self {
            EncoderStack::PostNorm(e) => e.layers.len(),
            EncoderStack::StableLayerNorm(e) => e.layers.len(),
        }
    }

    fn forward(
        &self,
        hidden: &Array3<f32>,
        causal: bool,
        output_layer: Option<OutputLayer>,
    ) -> Result<Array3<f32>, HubertError> {
        match self {
            EncoderStack::PostNorm(e) => e.forward(hidden, causal, output_layer),
            EncoderStack::StableLayerNorm(e) => e.forward(hidden, causal, output_layer),
        }
    }

    /// Permanently discard layers beyond `keep` layers, releasing their
    /// memory.
    fn truncate(&mut self, keep: usize) {
        match self {
            EncoderStack::PostNorm(e) => {
                e.layers.truncate(keep);
                e.layers.shrink_to_fit();
            }
            EncoderStack::StableLayerNorm(e) => {
                e.layers.truncate(keep);
                e.layers.shrink_to_fit();
            }
        }
    }

    fn remove_weight_norm_(&mut self) {
        match self {
            EncoderStack::PostNorm(e) => e.pos_conv_embed.remove_weight_norm_(),
            EncoderStack::StableLayerNorm(e) => e.pos_conv_embed.remove_weight_norm_(),
        }
    }
}

/// A HuBERT encoder: conv feature extractor, feature projection and one
/// transformer stack variant.
#[derive(Clone, Debug)]
pub struct Hubert {
    pub config: HubertConfig,
    pub feature_extractor: FeatureExtractor,
    pub feature_projection: FeatureProjection,
    pub encoder: EncoderStack,
}

impl Hubert {
    /// Build the architecture with zero-initialized weights (layer norms
    /// start as identity). Fails on an invalid configuration.
    pub fn new(config: HubertConfig) -> Result<Self, HubertError> {
        config.validate()?;
        let feature_extractor = FeatureExtractor::new(&config)?;
        let feature_projection = FeatureProjection::new(&config);
        let encoder = if config.do_stable_layer_norm {
            EncoderStack::StableLayerNorm(EncoderStableLayerNorm::new(&config)?)
        } else {
            EncoderStack::PostNorm(Encoder::new(&config)?)
        };
        Ok(Self {
            config,
            feature_extractor,
            feature_projection,
            encoder,
        })
    }

    /// Whether the predictor should normalize whole waveforms before
    /// encoding.
    pub fn pre_normalize(&self) -> bool {
        self.config.pre_normalize
    }

    /// Encode a waveform batch `(batch, samples)` into hidden states
    /// `(batch, frames, hidden)`.
    ///
    /// `sample_rate` must be 16000: the conv strides and receptive
    /// field are calibrated to that rate only, and the check runs before
    /// any convolution work.
    pub fn forward(
        &self,
        input_values: &Array2<f32>,
        sample_rate: u32,
        causal: bool,
        output_layer: Option<OutputLayer>,
    ) -> Result<Array3<f32>, HubertError> {
        if sample_rate != crate::audio::SAMPLE_RATE {
            return Err(HubertError::Input(format!(
                "HuBERT only supports 16 kHz input, got {sample_rate} Hz"
            )));
        }
        self.config.feature_frames(input_values.ncols())?;

        let extract_features = self.feature_extractor.forward(input_values);
        let extract_features = tensor::transpose_12(&extract_features);
        let hidden = self.feature_projection.forward(&extract_features);
        self.encoder.forward(&hidden, causal, output_layer)
    }

    /// Permanently truncate the layer stack so that an argument-free
    /// forward pass reproduces `forward(.., output_layer = K)` exactly:
    /// layers `0..=K` are kept, everything beyond is discarded and its
    /// memory released. Irreversible.
    pub fn set_output_layer(&mut self, output_layer: OutputLayer) -> Result<(), HubertError> {
        let resolved = resolve_output_layer(Some(output_layer), self.encoder.num_layers())?
            .expect("an explicit output layer always resolves");
        self.encoder.truncate(resolved + 1);
        Ok(())
    }

    /// Collapse the positional embedding's weight-norm decomposition.
    /// One-way; calling again is a no-op.
    pub fn remove_weight_norm_(&mut self) {
        self.encoder.remove_weight_norm_();
    }

    /// Wrap this model (and optionally a k-means quantizer) in a ready
    /// predictor. Performs the weight-norm collapse; fails when the
    /// quantizer's width does not match the hidden size.
    pub fn predictor(self, kmeans: Option<KMeans>) -> Result<HubertPredictor, HubertError> {
        HubertPredictor::new(self, kmeans)
    }
}
