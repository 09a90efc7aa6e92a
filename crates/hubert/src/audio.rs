//! Audio reader collaborator boundary and the signal effects the file
//! pipeline applies per chunk: peak ("gain -n") normalization, mono
//! downmix and linear resampling to 16 kHz.

use crate::HubertError;
use ndarray::Array2;
use std::path::Path;

/// The only sample rate the encoder accepts.
pub const SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioProps {
    pub sample_rate: u32,
    pub channels: usize,
}

/// Streams fixed-duration sample chunks from storage, so a long file
/// never has to be memory-resident at once. Chunks come out at the
/// file's native rate with shape `(channels, samples)`; `chunk_length`
/// is expressed in samples at `sample_rate` and converted to the
/// equivalent native duration by the reader.
pub trait AudioReader {
    fn get_audio_props(&self, path: &Path) -> Result<AudioProps, HubertError>;

    #[allow(clippy::type_complexity)]
    fn read_audio(
        &self,
        path: &Path,
        chunk_length: usize,
        sample_rate: u32,
    ) -> Result<Box<dyn Iterator<Item = Result<Array2<f32>, HubertError>>>, HubertError>;
}

/// WAV-file reader over `hound`. Integer samples are scaled to
/// `[-1, 1]` by their bit depth.
#[derive(Debug, Clone, Copy, Default)]
pub struct WavReader;

impl AudioReader for WavReader {
    fn get_audio_props(&self, path: &Path) -> Result<AudioProps, HubertError> {
        let reader = hound::WavReader::open(path).map_err(wav_err)?;
        let spec = reader.spec();
        Ok(AudioProps {
            sample_rate: spec.sample_rate,
            channels: spec.channels as usize,
        })
    }

    fn read_audio(
        &self,
        path: &Path,
        chunk_length: usize,
        sample_rate: u32,
    ) -> Result<Box<dyn Iterator<Item = Result<Array2<f32>, HubertError>>>, HubertError> {
        let reader = hound::WavReader::open(path).map_err(wav_err)?;
        let spec = reader.spec();
        let channels = spec.channels as usize;
        if channels == 0 {
            return Err(HubertError::Audio("WAV file has zero channels".to_string()));
        }

        // Chunk length at the file's native rate, covering the same
        // duration as `chunk_length` samples at `sample_rate`.
        let native_chunk = ((chunk_length as u64 * spec.sample_rate as u64)
            / sample_rate as u64)
            .max(1) as usize;

        let samples: Box<dyn Iterator<Item = Result<f32, hound::Error>>> =
            match (spec.sample_format, spec.bits_per_sample) {
                (hound::SampleFormat::Float, _) => Box::new(reader.into_samples::<f32>()),
                (hound::SampleFormat::Int, bits) => {
                    let scale = 1.0 / (1i64 << (bits - 1)) as f32;
                    Box::new(
                        reader
                            .into_samples::<i32>()
                            .map(move |s| s.map(|v| v as f32 * scale)),
                    )
                }
            };

        Ok(Box::new(WavChunks {
            samples,
            channels,
            chunk_frames: native_chunk,
        }))
    }
}

struct WavChunks {
    samples: Box<dyn Iterator<Item = Result<f32, hound::Error>>>,
    channels: usize,
    chunk_frames: usize,
}

impl Iterator for WavChunks {
    type Item = Result<Array2<f32>, HubertError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut interleaved = Vec::with_capacity(self.chunk_frames * self.channels);
        for sample in self.samples.by_ref() {
            match sample {
                Ok(v) => interleaved.push(v),
                Err(e) => return Some(Err(wav_err(e))),
            }
            if interleaved.len() >= self.chunk_frames * self.channels {
                break;
            }
        }
        if interleaved.is_empty() {
            return None;
        }

        let frames = interleaved.len() / self.channels;
        let mut chunk = Array2::<f32>::zeros((self.channels, frames));
        for t in 0..frames {
            for c in 0..self.channels {
                chunk[[c, t]] = interleaved[t * self.channels + c];
            }
        }
        Some(Ok(chunk))
    }
}

fn wav_err(e: hound::Error) -> HubertError {
    HubertError::Audio(e.to_string())
}

/// Scale so the peak amplitude hits 1.0 (sox `gain -n`). Silence is
/// left untouched.
pub fn peak_normalize(chunk: &mut Array2<f32>) {
    let mut peak = 0.0f32;
    for &v in chunk.iter() {
        peak = peak.max(v.abs());
    }
    if peak > 0.0 {
        let scale = 1.0 / peak;
        chunk.mapv_inplace(|v| v * scale);
    }
}

/// Mix `(channels, samples)` down to `(1, samples)` by averaging.
pub fn downmix_mono(chunk: &Array2<f32>) -> Result<Array2<f32>, HubertError> {
    let (channels, samples) = chunk.dim();
    if channels == 0 {
        return Err(HubertError::Audio(
            "cannot downmix a chunk with zero channels".to_string(),
        ));
    }
    if channels == 1 {
        return Ok(chunk.to_owned());
    }
    let mut mono = Array2::<f32>::zeros((1, samples));
    for t in 0..samples {
        let mut acc = 0.0f32;
        for c in 0..channels {
            acc += chunk[[c, t]];
        }
        mono[[0, t]] = acc / channels as f32;
    }
    Ok(mono)
}

/// Resample `(channels, samples)` audio with linear interpolation.
pub fn resample(chunk: &Array2<f32>, from_rate: u32, to_rate: u32) -> Array2<f32> {
    if from_rate == to_rate || chunk.ncols() == 0 {
        return chunk.to_owned();
    }
    let (channels, samples) = chunk.dim();
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples as f64 / ratio) as usize;
    let mut out = Array2::<f32>::zeros((channels, out_len));
    for c in 0..channels {
        for i in 0..out_len {
            let src_idx = i as f64 * ratio;
            let idx0 = src_idx as usize;
            let frac = (src_idx - idx0 as f64) as f32;
            let s0 = chunk[[c, idx0]];
            let s1 = if idx0 + 1 < samples {
                chunk[[c, idx0 + 1]]
            } else {
                s0
            };
            out[[c, i]] = s0 + frac * (s1 - s0);
        }
    }
    out
}
