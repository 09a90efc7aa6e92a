//! Chunked prediction: equivalence with the whole-waveform path,
//! concatenation order, input validation and quantized outputs.

mod common;

use hubert::{ChunkedPrediction, HubertError, KMeans, Prediction};
use ndarray::Array2;

#[test]
fn single_chunk_matches_whole_waveform() {
    let predictor = common::tiny_model(21).predictor(None).unwrap();
    let waveform = common::waveform(1, 8_000, 23);

    let whole = match predictor.predict(&waveform, 16_000, None, false).unwrap() {
        Prediction::Hidden(h) => h,
        other => panic!("unexpected output {other:?}"),
    };
    // One chunk covers the whole input, so the outputs must agree.
    let chunked = match predictor
        .predict_in_chunks(&waveform, 16_000, 16_000, None, false)
        .unwrap()
    {
        ChunkedPrediction::Hidden(h) => h,
        other => panic!("unexpected output {other:?}"),
    };

    assert_eq!(chunked.dim(), (whole.shape()[1], whole.shape()[2]));
    let max_diff = whole
        .iter()
        .zip(chunked.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    assert!(max_diff <= 1e-6, "max diff {max_diff}");
}

#[test]
fn chunk_outputs_concatenate_in_order() {
    let predictor = common::tiny_model(21).predictor(None).unwrap();
    let waveform = common::waveform(1, 8_000, 29);

    // Chunks of 3200, 3200 and 1600 samples produce 319, 319 and 159
    // frames respectively under the (10, 3) / (5, 2) conv schedule.
    let out = predictor
        .predict_in_chunks(&waveform, 16_000, 3_200, None, false)
        .unwrap();
    assert_eq!(out.frames(), 319 + 319 + 159);

    // The first chunk's frames must match running that chunk alone.
    let first = waveform.slice(ndarray::s![.., ..3_200]).to_owned();
    let first_alone = match predictor.predict(&first, 16_000, None, false).unwrap() {
        Prediction::Hidden(h) => h,
        other => panic!("unexpected output {other:?}"),
    };
    let merged = match out {
        ChunkedPrediction::Hidden(h) => h,
        other => panic!("unexpected output {other:?}"),
    };
    let head = merged.slice(ndarray::s![..319, ..]);
    let max_diff = first_alone
        .iter()
        .zip(head.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    assert!(max_diff <= 1e-6, "max diff {max_diff}");
}

#[test]
fn rejects_multi_waveform_batches() {
    let predictor = common::tiny_model(21).predictor(None).unwrap();
    let waveform = common::waveform(2, 4_000, 31);
    let err = predictor
        .predict_in_chunks(&waveform, 16_000, 2_000, None, false)
        .unwrap_err();
    assert!(matches!(err, HubertError::Input(_)), "got {err:?}");
}

#[test]
fn rejects_zero_chunk_size() {
    let predictor = common::tiny_model(21).predictor(None).unwrap();
    let waveform = common::waveform(1, 4_000, 31);
    let err = predictor
        .predict_in_chunks(&waveform, 16_000, 0, None, false)
        .unwrap_err();
    assert!(matches!(err, HubertError::Input(_)), "got {err:?}");
}

#[test]
fn global_normalization_covers_all_chunks() {
    // With pre-normalization the statistics come from the whole
    // waveform, so a single-chunk run and a whole-waveform run over a
    // pre-normalized copy must agree.
    let predictor = common::tiny_stable_model(37).predictor(None).unwrap();
    let waveform = common::waveform(1, 6_000, 41);

    let chunked = match predictor
        .predict_in_chunks(&waveform, 16_000, 16_000, None, false)
        .unwrap()
    {
        ChunkedPrediction::Hidden(h) => h,
        other => panic!("unexpected output {other:?}"),
    };

    let mut normalized = waveform.clone();
    hubert::tensor::normalize_global(&mut normalized);
    let whole = match predictor.predict(&normalized, 16_000, None, false).unwrap() {
        Prediction::Hidden(h) => h,
        other => panic!("unexpected output {other:?}"),
    };

    let max_diff = whole
        .iter()
        .zip(chunked.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    assert!(max_diff <= 1e-6, "max diff {max_diff}");
}

#[test]
fn rejects_mismatched_cluster_width() {
    // Centers are 8 wide but the model's hidden size is 16; binding
    // them must fail at construction, not mid-inference.
    let centers = Array2::<f32>::zeros((5, 8));
    let err = common::tiny_model(21)
        .predictor(Some(KMeans::new(centers)))
        .unwrap_err();
    assert!(matches!(err, HubertError::Config(_)), "got {err:?}");
}

#[test]
fn quantized_chunks_stay_in_cluster_range() {
    let mut rng = common::Rng::new(43);
    let centers = Array2::from_shape_vec((10, 16), rng.fill(160, 1.0)).unwrap();
    let predictor = common::tiny_model(21).predictor(Some(KMeans::new(centers))).unwrap();

    let waveform = common::waveform(1, 8_000, 47);
    let out = predictor
        .predict_in_chunks(&waveform, 16_000, 3_200, None, false)
        .unwrap();
    let indices = match out {
        ChunkedPrediction::Clusters(i) => i,
        other => panic!("unexpected output {other:?}"),
    };
    assert_eq!(indices.len(), 319 + 319 + 159);
    assert!(indices.iter().all(|&i| i < 10));
}
