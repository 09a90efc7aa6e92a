//! Pretrained checkpoint registry and model builders.
//!
//! Each published model is described by a [`CheckpointSpec`]: the
//! upstream URL and sha256 of the original PyTorch export, plus the
//! local filename of its safetensors rendering. How bytes are obtained
//! is the [`CheckpointFetcher`] collaborator's business; [`DirFetcher`]
//! simply reads pre-downloaded files from a directory.

use crate::config::{Activation, HubertConfig};
use crate::kmeans::KMeans;
use crate::model::Hubert;
use crate::weights::{load_npy_2d, StateDict};
use crate::HubertError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

/// Published HuBERT encoder sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubertSize {
    Base,
    Large,
    ExtraLarge,
}

impl HubertSize {
    pub fn as_str(self) -> &'static str {
        match self {
            HubertSize::Base => "base",
            HubertSize::Large => "large",
            HubertSize::ExtraLarge => "extra_large",
        }
    }
}

impl fmt::Display for HubertSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HubertSize {
    type Err = HubertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base" => Ok(HubertSize::Base),
            "large" => Ok(HubertSize::Large),
            "extra_large" => Ok(HubertSize::ExtraLarge),
            other => Err(HubertError::Config(format!(
                "unknown HuBERT size {other:?}"
            ))),
        }
    }
}

/// Published k-means quantizers, each tied to a `base` encoder layer
/// (7 or 8) and a cluster count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubertKmeansSize {
    BaseL7C100,
    BaseL7C200,
    BaseL7C500,
    BaseL7C1000,
    BaseL8C100,
    BaseL8C200,
    BaseL8C500,
    BaseL8C1000,
}

impl HubertKmeansSize {
    pub fn as_str(self) -> &'static str {
        match self {
            HubertKmeansSize::BaseL7C100 => "base-l7-c100",
            HubertKmeansSize::BaseL7C200 => "base-l7-c200",
            HubertKmeansSize::BaseL7C500 => "base-l7-c500",
            HubertKmeansSize::BaseL7C1000 => "base-l7-c1000",
            HubertKmeansSize::BaseL8C100 => "base-l8-c100",
            HubertKmeansSize::BaseL8C200 => "base-l8-c200",
            HubertKmeansSize::BaseL8C500 => "base-l8-c500",
            HubertKmeansSize::BaseL8C1000 => "base-l8-c1000",
        }
    }

    /// The encoder layer the clusters were trained on.
    pub fn output_layer(self) -> isize {
        match self {
            HubertKmeansSize::BaseL7C100
            | HubertKmeansSize::BaseL7C200
            | HubertKmeansSize::BaseL7C500
            | HubertKmeansSize::BaseL7C1000 => 7,
            HubertKmeansSize::BaseL8C100
            | HubertKmeansSize::BaseL8C200
            | HubertKmeansSize::BaseL8C500
            | HubertKmeansSize::BaseL8C1000 => 8,
        }
    }

    pub fn num_clusters(self) -> usize {
        match self {
            HubertKmeansSize::BaseL7C100 | HubertKmeansSize::BaseL8C100 => 100,
            HubertKmeansSize::BaseL7C200 | HubertKmeansSize::BaseL8C200 => 200,
            HubertKmeansSize::BaseL7C500 | HubertKmeansSize::BaseL8C500 => 500,
            HubertKmeansSize::BaseL7C1000 | HubertKmeansSize::BaseL8C1000 => 1000,
        }
    }
}

impl fmt::Display for HubertKmeansSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HubertKmeansSize {
    type Err = HubertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base-l7-c100" => Ok(HubertKmeansSize::BaseL7C100),
            "base-l7-c200" => Ok(HubertKmeansSize::BaseL7C200),
            "base-l7-c500" => Ok(HubertKmeansSize::BaseL7C500),
            "base-l7-c1000" => Ok(HubertKmeansSize::BaseL7C1000),
            "base-l8-c100" => Ok(HubertKmeansSize::BaseL8C100),
            "base-l8-c200" => Ok(HubertKmeansSize::BaseL8C200),
            "base-l8-c500" => Ok(HubertKmeansSize::BaseL8C500),
            "base-l8-c1000" => Ok(HubertKmeansSize::BaseL8C1000),
            other => Err(HubertError::Config(format!(
                "unknown HuBERT k-means size {other:?}"
            ))),
        }
    }
}

/// One downloadable artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointSpec {
    /// Registry key (the size string).
    pub key: &'static str,
    /// Upstream URL of the original PyTorch export.
    pub url: &'static str,
    /// sha256 of the upstream file.
    pub sha256: &'static str,
    /// Key prefix to strip when loading the state dict.
    pub remove_prefix: Option<&'static str>,
    /// Local filename the fetcher resolves.
    pub filename: &'static str,
}

/// Encoder checkpoint for a given size.
pub fn checkpoint(size: HubertSize) -> CheckpointSpec {
    match size {
        HubertSize::Base => CheckpointSpec {
            key: "base",
            url: "https://huggingface.co/facebook/hubert-base-ls960/resolve/main/pytorch_model.bin",
            sha256: "062249fffb353eab67547a2fbc129f7c31a2f459faf641b19e8fb007cc5c48ad",
            remove_prefix: None,
            filename: "base.safetensors",
        },
        HubertSize::Large => CheckpointSpec {
            key: "large",
            url: "https://huggingface.co/facebook/hubert-large-ls960-ft/resolve/main/pytorch_model.bin",
            sha256: "9cf43abec3f0410ad6854afa4d376c69ccb364b48ddddfd25c4c5aa16398eab0",
            remove_prefix: Some("hubert."),
            filename: "large.safetensors",
        },
        HubertSize::ExtraLarge => CheckpointSpec {
            key: "extra_large",
            url: "https://huggingface.co/facebook/hubert-xlarge-ll60k/resolve/main/pytorch_model.bin",
            sha256: "6131dc27f4508595daa1a13fec4aa1f6b4a579b5d93550bae26c13a83221f8a7",
            remove_prefix: None,
            filename: "extra_large.safetensors",
        },
    }
}

/// Cluster-center checkpoint for a given k-means size.
pub fn kmeans_checkpoint(size: HubertKmeansSize) -> CheckpointSpec {
    macro_rules! spec {
        ($key:literal, $file:literal, $sha:literal) => {
            CheckpointSpec {
                key: $key,
                url: concat!(
                    "https://huggingface.co/codekansas/hubert-quantization/resolve/main/",
                    $file
                ),
                sha256: $sha,
                remove_prefix: None,
                filename: concat!($key, ".npy"),
            }
        };
    }
    match size {
        HubertKmeansSize::BaseL7C100 => spec!(
            "base-l7-c100",
            "kmeans_base_7_sklearn_100.npy",
            "e46d1e2a5d6f83805dd336cf22a4228a902e78c3377141b4aa8e8c946af160cb"
        ),
        HubertKmeansSize::BaseL7C200 => spec!(
            "base-l7-c200",
            "kmeans_base_7_sklearn_200.npy",
            "5bce95ff25b8e3e07170f73bfcf7a5c72a432a9acd3382e833409a30a41ce062"
        ),
        HubertKmeansSize::BaseL7C500 => spec!(
            "base-l7-c500",
            "kmeans_base_7_sklearn_500.npy",
            "ce9855b89955affbf8e939ff274a4938efee730d4fb4fab990070747744b9df0"
        ),
        HubertKmeansSize::BaseL7C1000 => spec!(
            "base-l7-c1000",
            "kmeans_base_7_sklearn_1000.npy",
            "6a10e5978bac1b84a3b0e03bb72e3015d0cdf6956e301a48971eb3a2493e37c5"
        ),
        HubertKmeansSize::BaseL8C100 => spec!(
            "base-l8-c100",
            "kmeans_base_8_sklearn_100.npy",
            "3219a01b5ec21ca173605fe5b2d7b296db1a10ef24e5c593c8076b1b39f96865"
        ),
        HubertKmeansSize::BaseL8C200 => spec!(
            "base-l8-c200",
            "kmeans_base_8_sklearn_200.npy",
            "0beab85b59604841da10b3327bedc710e0dbf8e4a2b24bc0d964bf345640e9d7"
        ),
        HubertKmeansSize::BaseL8C500 => spec!(
            "base-l8-c500",
            "kmeans_base_8_sklearn_500.npy",
            "4a06731ef6d8aa116ae05ec309ad1ae47b7c030f05bc62137899b17d32fd294a"
        ),
        HubertKmeansSize::BaseL8C1000 => spec!(
            "base-l8-c1000",
            "kmeans_base_8_sklearn_1000.npy",
            "15be942383cf9e5afc3d6f0d615ab6dc8459364129dc1a02ee00f8c927783aae"
        ),
    }
}

/// Architecture configuration for a published size.
pub fn config_for(size: HubertSize) -> HubertConfig {
    let common = |hidden_size, num_hidden_layers, num_attention_heads, intermediate_size| {
        HubertConfig {
            vocab_size: 32,
            hidden_size,
            num_hidden_layers,
            num_attention_heads,
            intermediate_size,
            hidden_act: Activation::Gelu,
            hidden_dropout: 0.1,
            activation_dropout: 0.1,
            feat_proj_layer_norm: true,
            feat_proj_dropout: 0.0,
            layer_norm_eps: 1e-5,
            feat_extract_norm: "group".to_string(),
            feat_extract_dropout: 0.0,
            feat_extract_activation: Activation::Gelu,
            conv_dim: vec![512; 7],
            conv_stride: vec![5, 2, 2, 2, 2, 2, 2],
            conv_kernel: vec![10, 3, 3, 3, 3, 2, 2],
            conv_bias: false,
            num_conv_pos_embeddings: 128,
            num_conv_pos_embedding_groups: 16,
            do_stable_layer_norm: false,
            pre_normalize: false,
        }
    };
    match size {
        HubertSize::Base => common(768, 12, 12, 3072),
        HubertSize::Large => HubertConfig {
            feat_extract_norm: "layer".to_string(),
            conv_bias: true,
            do_stable_layer_norm: true,
            pre_normalize: true,
            ..common(1024, 24, 16, 4096)
        },
        HubertSize::ExtraLarge => HubertConfig {
            feat_extract_norm: "layer".to_string(),
            conv_bias: true,
            do_stable_layer_norm: true,
            pre_normalize: true,
            ..common(1280, 48, 16, 5120)
        },
    }
}

/// Resolves a [`CheckpointSpec`] to its raw bytes.
pub trait CheckpointFetcher {
    fn fetch(&self, spec: &CheckpointSpec) -> Result<Vec<u8>, HubertError>;
}

/// Fetcher that reads `<root>/<filename>` from a local directory of
/// pre-downloaded checkpoints.
#[derive(Debug, Clone)]
pub struct DirFetcher {
    root: PathBuf,
}

impl DirFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl CheckpointFetcher for DirFetcher {
    fn fetch(&self, spec: &CheckpointSpec) -> Result<Vec<u8>, HubertError> {
        let path = self.root.join(spec.filename);
        tracing::debug!(path = %path.display(), key = spec.key, "reading checkpoint");
        Ok(std::fs::read(&path)?)
    }
}

/// Build a pretrained encoder of the given size, loading weights
/// through `fetcher`.
pub fn build_model(
    size: HubertSize,
    fetcher: &dyn CheckpointFetcher,
) -> Result<Hubert, HubertError> {
    let spec = checkpoint(size);
    let start = Instant::now();
    let data = fetcher.fetch(&spec)?;
    let dict = StateDict::new(&data, spec.remove_prefix)?;
    let model = Hubert::from_state_dict(config_for(size), &dict)?;
    tracing::info!(
        size = %size,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "loaded pretrained HuBERT"
    );
    Ok(model)
}

/// Build the `base` encoder truncated to the quantizer's layer, paired
/// with its k-means cluster model.
pub fn build_model_with_kmeans(
    size: HubertKmeansSize,
    fetcher: &dyn CheckpointFetcher,
) -> Result<(Hubert, KMeans), HubertError> {
    let start = Instant::now();
    let centers = fetcher.fetch(&kmeans_checkpoint(size))?;
    let kmeans = KMeans::new(load_npy_2d(&centers)?);

    let mut model = build_model(HubertSize::Base, fetcher)?;
    model.set_output_layer(size.output_layer().into())?;

    if kmeans.num_clusters() != size.num_clusters() {
        return Err(HubertError::WeightLoad(format!(
            "expected {} cluster centers for {}, got {}",
            size.num_clusters(),
            size,
            kmeans.num_clusters()
        )));
    }
    if kmeans.dim() != model.config.hidden_size {
        return Err(HubertError::WeightLoad(format!(
            "cluster-center width {} does not match hidden size {}",
            kmeans.dim(),
            model.config.hidden_size
        )));
    }
    tracing::info!(
        size = %size,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "loaded pretrained HuBERT with k-means quantizer"
    );
    Ok((model, kmeans))
}
