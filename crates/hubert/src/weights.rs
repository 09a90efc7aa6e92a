//! Weight loading: safetensors checkpoints for the encoder, `.npy`
//! arrays for k-means centers.

use crate::config::HubertConfig;
use crate::conv::Conv1d;
use crate::feature::{ConvLayer, ConvNorm, FeatureExtractor, FeatureProjection, GroupNorm};
use crate::model::{EncoderStack, Hubert};
use crate::pos_embed::PositionalConvEmbedding;
use crate::transformer::{
    Attention, Encoder, EncoderLayer, EncoderLayerStableLayerNorm, EncoderStableLayerNorm,
    FeedForward, LayerNorm, Linear,
};
use crate::HubertError;
use byteorder::{LittleEndian, ReadBytesExt};
use half::f16;
use ndarray::{Array1, Array2, Array3};
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;

/// Checkpoint keys that are never loaded. `masked_spec_embed` only
/// matters during pretraining; the bare `.weight` / `.bias` entries are
/// stray artifacts some exports carry.
const EXCLUDE_KEYS: [&str; 3] = ["masked_spec_embed", ".weight", ".bias"];

/// Parse a safetensors file and extract tensors.
pub fn load_safetensors(data: &[u8]) -> Result<SafeTensors<'_>, HubertError> {
    SafeTensors::deserialize(data).map_err(|e| HubertError::WeightLoad(e.to_string()))
}

/// Decode raw bytes from a tensor view into f32 values, supporting f32 and f16 dtypes.
fn decode_floats(view: &safetensors::tensor::TensorView) -> Result<Vec<f32>, HubertError> {
    match view.dtype() {
        Dtype::F32 => Ok(view
            .data()
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()),
        Dtype::F16 => Ok(view
            .data()
            .chunks_exact(2)
            .map(|chunk| f16::from_le_bytes([chunk[0], chunk[1]]).to_f32())
            .collect()),
        other => Err(HubertError::WeightLoad(format!(
            "Unsupported tensor dtype: {:?}",
            other
        ))),
    }
}

/// Convert a tensor view to Array1 (1D vector).
pub fn to_array1(view: safetensors::tensor::TensorView) -> Result<Array1<f32>, HubertError> {
    let shape = view.shape();
    if shape.len() != 1 {
        return Err(HubertError::WeightLoad(format!(
            "Expected 1D tensor, got shape {:?}",
            shape
        )));
    }

    let data = decode_floats(&view)?;
    Ok(Array1::from_vec(data))
}

/// Convert a tensor view to Array2 (2D matrix).
pub fn to_array2(view: safetensors::tensor::TensorView) -> Result<Array2<f32>, HubertError> {
    let shape = view.shape();
    if shape.len() != 2 {
        return Err(HubertError::WeightLoad(format!(
            "Expected 2D tensor, got shape {:?}",
            shape
        )));
    }

    let data = decode_floats(&view)?;
    Array2::from_shape_vec((shape[0], shape[1]), data)
        .map_err(|e| HubertError::WeightLoad(e.to_string()))
}

/// Convert a tensor view to Array3 (3D tensor).
pub fn to_array3(view: safetensors::tensor::TensorView) -> Result<Array3<f32>, HubertError> {
    let shape = view.shape();
    if shape.len() != 3 {
        return Err(HubertError::WeightLoad(format!(
            "Expected 3D tensor, got shape {:?}",
            shape
        )));
    }

    let data = decode_floats(&view)?;
    Array3::from_shape_vec((shape[0], shape[1], shape[2]), data)
        .map_err(|e| HubertError::WeightLoad(e.to_string()))
}

/// A parsed checkpoint with optional key-prefix removal and the fixed
/// denylist applied. Lookups use the logical (stripped) names.
pub struct StateDict<'a> {
    tensors: SafeTensors<'a>,
    /// Logical name → stored checkpoint key.
    keys: HashMap<String, String>,
}

impl<'a> StateDict<'a> {
    pub fn new(data: &'a [u8], remove_prefix: Option<&str>) -> Result<Self, HubertError> {
        let tensors = load_safetensors(data)?;
        let mut keys = HashMap::new();
        for name in tensors.names() {
            let logical = match remove_prefix {
                Some(prefix) => name.strip_prefix(prefix).unwrap_or(name),
                None => name,
            };
            if EXCLUDE_KEYS.contains(&logical) {
                tracing::debug!(key = name, "ignoring excluded checkpoint tensor");
                continue;
            }
            keys.insert(logical.to_string(), name.to_string());
        }
        Ok(Self { tensors, keys })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.keys.contains_key(name)
    }

    fn view(&self, name: &str) -> Result<safetensors::tensor::TensorView<'_>, HubertError> {
        let key = self
            .keys
            .get(name)
            .ok_or_else(|| HubertError::WeightLoad(format!("Tensor '{}' not found", name)))?;
        self.tensors
            .tensor(key)
            .map_err(|e| HubertError::WeightLoad(format!("Tensor '{}' not found: {}", name, e)))
    }

    pub fn array1(&self, name: &str) -> Result<Array1<f32>, HubertError> {
        to_array1(self.view(name)?)
    }

    pub fn array2(&self, name: &str) -> Result<Array2<f32>, HubertError> {
        to_array2(self.view(name)?)
    }

    pub fn array3(&self, name: &str) -> Result<Array3<f32>, HubertError> {
        to_array3(self.view(name)?)
    }

    /// Optional tensor (returns None if not present).
    pub fn optional_array1(&self, name: &str) -> Result<Option<Array1<f32>>, HubertError> {
        if self.contains(name) {
            Ok(Some(self.array1(name)?))
        } else {
            Ok(None)
        }
    }
}

fn load_linear(dict: &StateDict, name: &str) -> Result<Linear, HubertError> {
    Ok(Linear::new(
        dict.array2(&format!("{name}.weight"))?,
        dict.optional_array1(&format!("{name}.bias"))?,
    ))
}

fn load_layer_norm(dict: &StateDict, name: &str, eps: f32) -> Result<LayerNorm, HubertError> {
    Ok(LayerNorm::new(
        dict.array1(&format!("{name}.weight"))?,
        dict.array1(&format!("{name}.bias"))?,
        eps,
    ))
}

fn load_feature_extractor(
    dict: &StateDict,
    config: &HubertConfig,
) -> Result<FeatureExtractor, HubertError> {
    let mut conv_layers = Vec::with_capacity(config.num_feat_extract_layers());
    for i in 0..config.num_feat_extract_layers() {
        let base = format!("feature_extractor.conv_layers.{i}");
        let weight = dict.array3(&format!("{base}.conv.weight"))?;
        let bias = if config.conv_bias {
            Some(dict.array1(&format!("{base}.conv.bias"))?)
        } else {
            None
        };
        let conv = Conv1d::new(weight, bias, config.conv_stride[i], 0, 1);

        let norm = match config.feat_extract_norm.as_str() {
            "group" => {
                // Group style only normalizes the first conv output.
                if i == 0 {
                    ConvNorm::Group(GroupNorm {
                        weight: dict.array1(&format!("{base}.layer_norm.weight"))?,
                        bias: dict.array1(&format!("{base}.layer_norm.bias"))?,
                        eps: config.layer_norm_eps,
                    })
                } else {
                    ConvNorm::None
                }
            }
            "layer" => ConvNorm::Layer(load_layer_norm(
                dict,
                &format!("{base}.layer_norm"),
                config.layer_norm_eps,
            )?),
            other => {
                return Err(HubertError::Config(format!(
                    "feat_extract_norm must be one of [\"group\", \"layer\"], got {other:?}"
                )))
            }
        };
        conv_layers.push(ConvLayer {
            conv,
            norm,
            activation: config.feat_extract_activation,
        });
    }
    Ok(FeatureExtractor { conv_layers })
}

fn load_pos_conv_embed(
    dict: &StateDict,
    config: &HubertConfig,
) -> Result<PositionalConvEmbedding, HubertError> {
    let bias = dict.optional_array1("encoder.pos_conv_embed.conv.bias")?;
    // Checkpoints normally carry the weight-norm decomposition; accept
    // a pre-merged dense kernel as well.
    if dict.contains("encoder.pos_conv_embed.conv.weight_g") {
        Ok(PositionalConvEmbedding::with_weight_norm(
            config,
            dict.array3("encoder.pos_conv_embed.conv.weight_g")?,
            dict.array3("encoder.pos_conv_embed.conv.weight_v")?,
            bias,
        ))
    } else {
        Ok(PositionalConvEmbedding::with_dense(
            config,
            dict.array3("encoder.pos_conv_embed.conv.weight")?,
            bias,
        ))
    }
}

fn load_attention(
    dict: &StateDict,
    config: &HubertConfig,
    base: &str,
) -> Result<Attention, HubertError> {
    let mut attention = Attention::new(config.hidden_size, config.num_attention_heads)?;
    attention.q_proj = load_linear(dict, &format!("{base}.q_proj"))?;
    attention.k_proj = load_linear(dict, &format!("{base}.k_proj"))?;
    attention.v_proj = load_linear(dict, &format!("{base}.v_proj"))?;
    attention.out_proj = load_linear(dict, &format!("{base}.out_proj"))?;
    Ok(attention)
}

fn load_feed_forward(
    dict: &StateDict,
    config: &HubertConfig,
    base: &str,
) -> Result<FeedForward, HubertError> {
    Ok(FeedForward {
        intermediate_dense: load_linear(dict, &format!("{base}.intermediate_dense"))?,
        output_dense: load_linear(dict, &format!("{base}.output_dense"))?,
        activation: config.hidden_act,
    })
}

fn load_encoder_stack(
    dict: &StateDict,
    config: &HubertConfig,
) -> Result<EncoderStack, HubertError> {
    let pos_conv_embed = load_pos_conv_embed(dict, config)?;
    let layer_norm = load_layer_norm(dict, "encoder.layer_norm", config.layer_norm_eps)?;
    let eps = config.layer_norm_eps;

    if config.do_stable_layer_norm {
        let layers = (0..config.num_hidden_layers)
            .map(|i| {
                let base = format!("encoder.layers.{i}");
                Ok(EncoderLayerStableLayerNorm {
                    attention: load_attention(dict, config, &format!("{base}.attention"))?,
                    layer_norm: load_layer_norm(dict, &format!("{base}.layer_norm"), eps)?,
                    feed_forward: load_feed_forward(dict, config, &format!("{base}.feed_forward"))?,
                    final_layer_norm: load_layer_norm(
                        dict,
                        &format!("{base}.final_layer_norm"),
                        eps,
                    )?,
                })
            })
            .collect::<Result<Vec<_>, HubertError>>()?;
        Ok(EncoderStack::StableLayerNorm(EncoderStableLayerNorm {
            pos_conv_embed,
            layer_norm,
            layers,
        }))
    } else {
        let layers = (0..config.num_hidden_layers)
            .map(|i| {
                let base = format!("encoder.layers.{i}");
                Ok(EncoderLayer {
                    attention: load_attention(dict, config, &format!("{base}.attention"))?,
                    layer_norm: load_layer_norm(dict, &format!("{base}.layer_norm"), eps)?,
                    feed_forward: load_feed_forward(dict, config, &format!("{base}.feed_forward"))?,
                    final_layer_norm: load_layer_norm(
                        dict,
                        &format!("{base}.final_layer_norm"),
                        eps,
                    )?,
                })
            })
            .collect::<Result<Vec<_>, HubertError>>()?;
        Ok(EncoderStack::PostNorm(Encoder {
            pos_conv_embed,
            layer_norm,
            layers,
        }))
    }
}

impl Hubert {
    /// Build a model from a parsed checkpoint. The configuration picks
    /// which keys are expected; any missing tensor is an error.
    pub fn from_state_dict(
        config: HubertConfig,
        dict: &StateDict,
    ) -> Result<Self, HubertError> {
        config.validate()?;

        let feature_extractor = load_feature_extractor(dict, &config)?;
        let feature_projection = FeatureProjection {
            layer_norm: if config.feat_proj_layer_norm {
                Some(load_layer_norm(
                    dict,
                    "feature_projection.layer_norm",
                    config.layer_norm_eps,
                )?)
            } else {
                None
            },
            projection: load_linear(dict, "feature_projection.projection")?,
        };
        let encoder = load_encoder_stack(dict, &config)?;

        Ok(Self {
            config,
            feature_extractor,
            feature_projection,
            encoder,
        })
    }
}

/// Parse a 2-D `.npy` file (versions 1.x and 2.x, little-endian f32 or
/// f64, C order) into an `Array2<f32>`.
pub fn load_npy_2d(bytes: &[u8]) -> Result<Array2<f32>, HubertError> {
    const MAGIC: &[u8] = b"\x93NUMPY";
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(HubertError::WeightLoad(
            "not a .npy file (bad magic)".to_string(),
        ));
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => {
            let mut cursor = &bytes[8..10];
            (cursor.read_u16::<LittleEndian>()? as usize, 10)
        }
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(HubertError::WeightLoad("truncated .npy header".to_string()));
            }
            let mut cursor = &bytes[8..12];
            (cursor.read_u32::<LittleEndian>()? as usize, 12)
        }
        other => {
            return Err(HubertError::WeightLoad(format!(
                "unsupported .npy version {other}"
            )))
        }
    };
    let data_start = header_start + header_len;
    if bytes.len() < data_start {
        return Err(HubertError::WeightLoad("truncated .npy header".to_string()));
    }
    let header = std::str::from_utf8(&bytes[header_start..data_start])
        .map_err(|e| HubertError::WeightLoad(format!("invalid .npy header: {e}")))?;

    let descr = header_field(header, "descr")?;
    let item_size = match descr {
        "<f4" => 4,
        "<f8" => 8,
        other => {
            return Err(HubertError::WeightLoad(format!(
                "unsupported .npy dtype {other:?}"
            )))
        }
    };
    if header.contains("'fortran_order': True") {
        return Err(HubertError::WeightLoad(
            "Fortran-ordered .npy files are not supported".to_string(),
        ));
    }
    let shape = parse_shape(header)?;
    if shape.len() != 2 {
        return Err(HubertError::WeightLoad(format!(
            "expected a 2-D array, got shape {:?}",
            shape
        )));
    }
    let (rows, cols) = (shape[0], shape[1]);
    let count = rows * cols;
    let data = &bytes[data_start..];
    if data.len() < count * item_size {
        return Err(HubertError::WeightLoad(format!(
            "expected {} bytes of array data, got {}",
            count * item_size,
            data.len()
        )));
    }

    let mut values = vec![0.0f32; count];
    let mut cursor = data;
    match item_size {
        4 => cursor.read_f32_into::<LittleEndian>(&mut values)?,
        _ => {
            for v in values.iter_mut() {
                *v = cursor.read_f64::<LittleEndian>()? as f32;
            }
        }
    }
    Array2::from_shape_vec((rows, cols), values)
        .map_err(|e| HubertError::WeightLoad(e.to_string()))
}

/// Extract a quoted field value from the .npy header dict literal.
fn header_field<'h>(header: &'h str, key: &str) -> Result<&'h str, HubertError> {
    let needle = format!("'{key}':");
    let at = header
        .find(&needle)
        .ok_or_else(|| HubertError::WeightLoad(format!(".npy header missing '{key}'")))?;
    let rest = &header[at + needle.len()..];
    let open = rest
        .find('\'')
        .ok_or_else(|| HubertError::WeightLoad(format!("malformed '{key}' field")))?;
    let rest = &rest[open + 1..];
    let close = rest
        .find('\'')
        .ok_or_else(|| HubertError::WeightLoad(format!("malformed '{key}' field")))?;
    Ok(&rest[..close])
}

/// Parse the header's `'shape': (r, c)` tuple.
fn parse_shape(header: &str) -> Result<Vec<usize>, HubertError> {
    let at = header
        .find("'shape':")
        .ok_or_else(|| HubertError::WeightLoad(".npy header missing 'shape'".to_string()))?;
    let rest = &header[at..];
    let open = rest
        .find('(')
        .ok_or_else(|| HubertError::WeightLoad("malformed 'shape' field".to_string()))?;
    let close = rest
        .find(')')
        .ok_or_else(|| HubertError::WeightLoad("malformed 'shape' field".to_string()))?;
    rest[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|e| HubertError::WeightLoad(format!("bad shape entry {s:?}: {e}")))
        })
        .collect()
}
