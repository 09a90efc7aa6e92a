//! Shared fixtures: a deterministic tiny model built through the real
//! checkpoint-loading path.

#![allow(dead_code)]

use hubert::weights::StateDict;
use hubert::{Activation, Hubert, HubertConfig};
use ndarray::Array2;
use safetensors::tensor::TensorView;
use safetensors::Dtype;

/// Small deterministic PRNG so fixtures are reproducible without a rand
/// dependency.
pub struct Rng(u64);

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1))
    }

    /// Uniform in [-1, 1).
    pub fn next_f32(&mut self) -> f32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
    }

    pub fn fill(&mut self, count: usize, scale: f32) -> Vec<f32> {
        (0..count).map(|_| self.next_f32() * scale).collect()
    }
}

/// A two-conv, two-layer architecture small enough for fast CPU tests.
pub fn tiny_config() -> HubertConfig {
    HubertConfig {
        vocab_size: 32,
        hidden_size: 16,
        num_hidden_layers: 2,
        num_attention_heads: 2,
        intermediate_size: 32,
        hidden_act: Activation::Gelu,
        hidden_dropout: 0.1,
        activation_dropout: 0.1,
        feat_proj_layer_norm: true,
        feat_proj_dropout: 0.0,
        layer_norm_eps: 1e-5,
        feat_extract_norm: "group".to_string(),
        feat_extract_dropout: 0.0,
        feat_extract_activation: Activation::Gelu,
        conv_dim: vec![4, 8],
        conv_stride: vec![5, 2],
        conv_kernel: vec![10, 3],
        conv_bias: false,
        num_conv_pos_embeddings: 16,
        num_conv_pos_embedding_groups: 4,
        do_stable_layer_norm: false,
        pre_normalize: false,
    }
}

/// Same architecture with the stable (pre-norm) encoder and waveform
/// pre-normalization, like the published `large` variant.
pub fn tiny_stable_config() -> HubertConfig {
    HubertConfig {
        feat_extract_norm: "layer".to_string(),
        conv_bias: true,
        do_stable_layer_norm: true,
        pre_normalize: true,
        ..tiny_config()
    }
}

/// Accumulates named f32 tensors and renders them as a safetensors
/// blob.
pub struct TensorBuilder {
    tensors: Vec<(String, Vec<usize>, Vec<u8>)>,
}

impl TensorBuilder {
    pub fn new() -> Self {
        Self {
            tensors: Vec::new(),
        }
    }

    pub fn add(&mut self, name: impl Into<String>, shape: &[usize], data: Vec<f32>) {
        assert_eq!(shape.iter().product::<usize>(), data.len());
        let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.tensors.push((name.into(), shape.to_vec(), bytes));
    }

    /// Copy of this builder with every tensor name prefixed, mimicking
    /// wrapped checkpoint exports.
    pub fn with_prefix(&self, prefix: &str) -> TensorBuilder {
        TensorBuilder {
            tensors: self
                .tensors
                .iter()
                .map(|(name, shape, bytes)| {
                    (format!("{prefix}{name}"), shape.clone(), bytes.clone())
                })
                .collect(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let views: Vec<(&str, TensorView<'_>)> = self
            .tensors
            .iter()
            .map(|(name, shape, bytes)| {
                (
                    name.as_str(),
                    TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap(),
                )
            })
            .collect();
        safetensors::serialize(views, &None).unwrap()
    }
}

fn add_linear(b: &mut TensorBuilder, rng: &mut Rng, name: &str, out_dim: usize, in_dim: usize) {
    b.add(format!("{name}.weight"), &[out_dim, in_dim], rng.fill(out_dim * in_dim, 0.1));
    b.add(format!("{name}.bias"), &[out_dim], rng.fill(out_dim, 0.05));
}

fn add_norm(b: &mut TensorBuilder, rng: &mut Rng, name: &str, dim: usize) {
    let weight: Vec<f32> = (0..dim).map(|_| 1.0 + rng.next_f32() * 0.05).collect();
    b.add(format!("{name}.weight"), &[dim], weight);
    b.add(format!("{name}.bias"), &[dim], rng.fill(dim, 0.02));
}

/// Generate a complete random state dict for `config`, keyed exactly
/// like a published checkpoint.
pub fn state_dict_tensors(config: &HubertConfig, seed: u64) -> TensorBuilder {
    let mut rng = Rng::new(seed);
    let mut b = TensorBuilder::new();

    for i in 0..config.num_feat_extract_layers() {
        let base = format!("feature_extractor.conv_layers.{i}");
        let in_dim = if i == 0 { 1 } else { config.conv_dim[i - 1] };
        let out_dim = config.conv_dim[i];
        let kernel = config.conv_kernel[i];
        b.add(
            format!("{base}.conv.weight"),
            &[out_dim, in_dim, kernel],
            rng.fill(out_dim * in_dim * kernel, 0.1),
        );
        if config.conv_bias {
            b.add(format!("{base}.conv.bias"), &[out_dim], rng.fill(out_dim, 0.05));
        }
        match config.feat_extract_norm.as_str() {
            "group" if i == 0 => add_norm(&mut b, &mut rng, &format!("{base}.layer_norm"), out_dim),
            "layer" => add_norm(&mut b, &mut rng, &format!("{base}.layer_norm"), out_dim),
            _ => {}
        }
    }

    let conv_out = *config.conv_dim.last().unwrap();
    let hidden = config.hidden_size;
    if config.feat_proj_layer_norm {
        add_norm(&mut b, &mut rng, "feature_projection.layer_norm", conv_out);
    }
    add_linear(&mut b, &mut rng, "feature_projection.projection", hidden, conv_out);

    let pos_kernel = config.num_conv_pos_embeddings;
    let pos_in = hidden / config.num_conv_pos_embedding_groups;
    let weight_g: Vec<f32> = (0..pos_kernel).map(|_| 0.5 + rng.next_f32().abs()).collect();
    b.add("encoder.pos_conv_embed.conv.weight_g", &[1, 1, pos_kernel], weight_g);
    b.add(
        "encoder.pos_conv_embed.conv.weight_v",
        &[hidden, pos_in, pos_kernel],
        rng.fill(hidden * pos_in * pos_kernel, 0.1),
    );
    b.add("encoder.pos_conv_embed.conv.bias", &[hidden], rng.fill(hidden, 0.05));
    add_norm(&mut b, &mut rng, "encoder.layer_norm", hidden);

    for i in 0..config.num_hidden_layers {
        let base = format!("encoder.layers.{i}");
        for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
            add_linear(&mut b, &mut rng, &format!("{base}.attention.{proj}"), hidden, hidden);
        }
        add_norm(&mut b, &mut rng, &format!("{base}.layer_norm"), hidden);
        add_linear(
            &mut b,
            &mut rng,
            &format!("{base}.feed_forward.intermediate_dense"),
            config.intermediate_size,
            hidden,
        );
        add_linear(
            &mut b,
            &mut rng,
            &format!("{base}.feed_forward.output_dense"),
            hidden,
            config.intermediate_size,
        );
        add_norm(&mut b, &mut rng, &format!("{base}.final_layer_norm"), hidden);
    }

    b
}

pub fn state_dict_bytes(config: &HubertConfig, seed: u64) -> Vec<u8> {
    state_dict_tensors(config, seed).serialize()
}

/// Tiny model with deterministic random weights, loaded through the
/// real checkpoint path.
pub fn tiny_model(seed: u64) -> Hubert {
    let config = tiny_config();
    let bytes = state_dict_bytes(&config, seed);
    let dict = StateDict::new(&bytes, None).unwrap();
    Hubert::from_state_dict(config, &dict).unwrap()
}

pub fn tiny_stable_model(seed: u64) -> Hubert {
    let config = tiny_stable_config();
    let bytes = state_dict_bytes(&config, seed);
    let dict = StateDict::new(&bytes, None).unwrap();
    Hubert::from_state_dict(config, &dict).unwrap()
}

/// Deterministic random waveform batch.
pub fn waveform(batch: usize, samples: usize, seed: u64) -> Array2<f32> {
    let mut rng = Rng::new(seed);
    Array2::from_shape_vec((batch, samples), rng.fill(batch * samples, 0.5)).unwrap()
}
