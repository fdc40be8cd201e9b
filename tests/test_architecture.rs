//! Graph-definition loading from JSON files.

use std::io::Write;

use blocknet::architecture;
use blocknet::error::GraphError;
use blocknet::optimizers::SGD;

const RESIDUAL: &str = r#"{
    "seed": 17,
    "layers": [
        { "name": "data", "kind": "input", "channels": 8, "height": 8, "width": 8 },
        { "name": "trunk", "kind": "convolution", "inputs": ["data"],
          "channels": 8, "kernel": 3, "stride": 1, "padding": 1 },
        { "name": "branch", "kind": "batchnorm_activation", "inputs": ["trunk"],
          "activation": "relu", "dropout": 0.1 },
        { "name": "join", "kind": "add", "inputs": ["trunk", "branch"] },
        { "name": "head", "kind": "global_avg_pooling", "inputs": ["join"] },
        { "name": "fc", "kind": "dense", "inputs": ["head"], "units": 4 },
        { "name": "cost", "kind": "cost", "inputs": ["fc"], "cost": "cross_entropy" }
    ]
}"#;

#[test]
fn test_definition_file_builds_and_trains() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json");
    std::fs::File::create(&path)
        .unwrap()
        .write_all(RESIDUAL.as_bytes())
        .unwrap();

    let mut g = architecture::from_file(&path).unwrap();
    assert_eq!(g.len(), 7);

    g.set_batch_size(2).unwrap();
    g.set_input(&vec![0.3f32; 2 * 8 * 8 * 8]);
    let mut targets = vec![0.0f32; 2 * 4];
    targets[0] = 1.0;
    targets[4 + 2] = 1.0;
    g.set_targets(&targets);

    let mut opt = SGD::new(0.05, 0.9);
    g.forward_prop(true);
    g.backward_prop();
    g.update_weights(&mut opt);
    assert!(g.loss().is_finite());
}

#[test]
fn test_missing_file_is_io_error() {
    let err = architecture::from_file("/nonexistent/model.json");
    assert!(matches!(err, Err(GraphError::Io(_))));
}

#[test]
fn test_forward_reference_rejected() {
    let json = r#"{ "layers": [
        { "name": "act", "kind": "activation", "inputs": ["data"], "activation": "relu" },
        { "name": "data", "kind": "input", "channels": 4, "height": 4, "width": 4 }
    ] }"#;
    assert!(matches!(
        architecture::from_str(json),
        Err(GraphError::UnknownInput { .. })
    ));
}

#[test]
fn test_duplicate_names_rejected_case_insensitively() {
    let json = r#"{ "layers": [
        { "name": "Data", "kind": "input", "channels": 4, "height": 4, "width": 4 },
        { "name": "data", "kind": "input", "channels": 4, "height": 4, "width": 4 }
    ] }"#;
    assert!(matches!(
        architecture::from_str(json),
        Err(GraphError::DuplicateName(_))
    ));
}

#[test]
fn test_channel_mismatch_at_fusion_rejected() {
    let json = r#"{ "layers": [
        { "name": "data", "kind": "input", "channels": 4, "height": 4, "width": 4 },
        { "name": "wide", "kind": "convolution", "inputs": ["data"],
          "channels": 8, "kernel": 3, "stride": 1, "padding": 1 },
        { "name": "join", "kind": "add", "inputs": ["data", "wide"] },
        { "name": "cost", "kind": "cost", "inputs": ["join"] }
    ] }"#;
    assert!(matches!(
        architecture::from_str(json),
        Err(GraphError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_plain_format_override() {
    let json = r#"{
        "format": "plain",
        "layers": [
            { "name": "data", "kind": "input", "channels": 8, "height": 4, "width": 4 },
            { "name": "conv", "kind": "convolution", "inputs": ["data"],
              "channels": 8, "kernel": 3, "stride": 1, "padding": 1 },
            { "name": "cost", "kind": "cost", "inputs": ["conv"] }
        ]
    }"#;
    let g = architecture::from_str(json).unwrap();
    use blocknet::MemoryFormat;
    for i in 0..g.len() {
        assert_eq!(g.base(i).desc().format, MemoryFormat::Plain);
    }
}
