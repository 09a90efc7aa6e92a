//! Checkpoint registry: size parsing, spec lookup and directory-backed
//! fetching.

mod common;

use anyhow::Result;
use hubert::pretrained::{checkpoint, config_for, kmeans_checkpoint};
use hubert::{CheckpointFetcher, DirFetcher, HubertKmeansSize, HubertSize, KMeans};

#[test]
fn size_strings_round_trip() -> Result<()> {
    for size in [HubertSize::Base, HubertSize::Large, HubertSize::ExtraLarge] {
        assert_eq!(size.as_str().parse::<HubertSize>()?, size);
    }
    for size in [
        HubertKmeansSize::BaseL7C100,
        HubertKmeansSize::BaseL7C200,
        HubertKmeansSize::BaseL7C500,
        HubertKmeansSize::BaseL7C1000,
        HubertKmeansSize::BaseL8C100,
        HubertKmeansSize::BaseL8C200,
        HubertKmeansSize::BaseL8C500,
        HubertKmeansSize::BaseL8C1000,
    ] {
        assert_eq!(size.as_str().parse::<HubertKmeansSize>()?, size);
    }
    assert!("tiny".parse::<HubertSize>().is_err());
    assert!("base-l9-c100".parse::<HubertKmeansSize>().is_err());
    Ok(())
}

#[test]
fn registry_specs_are_consistent() {
    for size in [HubertSize::Base, HubertSize::Large, HubertSize::ExtraLarge] {
        let spec = checkpoint(size);
        assert_eq!(spec.key, size.as_str());
        assert!(spec.url.starts_with("https://"));
        assert_eq!(spec.sha256.len(), 64);
        assert!(spec.filename.ends_with(".safetensors"));
    }
    // Only the large export wraps its keys.
    assert_eq!(checkpoint(HubertSize::Large).remove_prefix, Some("hubert."));
    assert_eq!(checkpoint(HubertSize::Base).remove_prefix, None);

    let spec = kmeans_checkpoint(HubertKmeansSize::BaseL8C500);
    assert_eq!(spec.key, "base-l8-c500");
    assert!(spec.url.ends_with("kmeans_base_8_sklearn_500.npy"));
    assert_eq!(spec.filename, "base-l8-c500.npy");
}

#[test]
fn published_configs_match_their_variants() {
    let base = config_for(HubertSize::Base);
    assert_eq!(base.hidden_size, 768);
    assert_eq!(base.num_hidden_layers, 12);
    assert_eq!(base.feat_extract_norm, "group");
    assert!(!base.do_stable_layer_norm);
    assert!(!base.pre_normalize);
    assert!(!base.conv_bias);

    let large = config_for(HubertSize::Large);
    assert_eq!(large.hidden_size, 1024);
    assert_eq!(large.num_hidden_layers, 24);
    assert_eq!(large.feat_extract_norm, "layer");
    assert!(large.do_stable_layer_norm);
    assert!(large.pre_normalize);
    assert!(large.conv_bias);

    let extra_large = config_for(HubertSize::ExtraLarge);
    assert_eq!(extra_large.hidden_size, 1280);
    assert_eq!(extra_large.num_hidden_layers, 48);
    assert_eq!(extra_large.intermediate_size, 5120);

    // The conv front-end is shared across all sizes.
    for config in [base, large, extra_large] {
        assert_eq!(config.conv_dim, vec![512; 7]);
        assert_eq!(config.conv_stride, vec![5, 2, 2, 2, 2, 2, 2]);
        assert_eq!(config.conv_kernel, vec![10, 3, 3, 3, 3, 2, 2]);
        assert_eq!(config.num_conv_pos_embeddings, 128);
        assert_eq!(config.num_conv_pos_embedding_groups, 16);
    }
}

#[test]
fn dir_fetcher_reads_checkpoint_files() -> Result<()> {
    let root = std::env::temp_dir().join(format!("hubert-registry-{}", std::process::id()));
    std::fs::create_dir_all(&root)?;

    let spec = kmeans_checkpoint(HubertKmeansSize::BaseL7C100);
    let mut rng = common::Rng::new(3);
    let centers_bytes = npy_2d(4, 6, &rng.fill(24, 1.0));
    std::fs::write(root.join(spec.filename), &centers_bytes)?;

    let fetcher = DirFetcher::new(&root);
    let fetched = fetcher.fetch(&spec)?;
    assert_eq!(fetched, centers_bytes);

    let kmeans = KMeans::from_npy(&fetched)?;
    assert_eq!(kmeans.num_clusters(), 4);
    assert_eq!(kmeans.dim(), 6);

    std::fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn dir_fetcher_reports_missing_files() {
    let fetcher = DirFetcher::new(std::env::temp_dir().join("hubert-registry-missing"));
    assert!(fetcher.fetch(&checkpoint(HubertSize::Base)).is_err());
}

fn npy_2d(rows: usize, cols: usize, data: &[f32]) -> Vec<u8> {
    let mut header =
        format!("{{'descr': '<f4', 'fortran_order': False, 'shape': ({rows}, {cols}), }}");
    while (10 + header.len() + 1) % 64 != 0 {
        header.push(' ');
    }
    header.push('\n');

    let mut out = Vec::new();
    out.extend_from_slice(b"\x93NUMPY");
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for v in data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}
