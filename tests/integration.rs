//! Integration tests for control-vectors
//!
//! Everything here runs on synthetic data; no model or GPU is needed.

use control_vectors::{
    export_control_vectors, AnalyzerConfig, CollectingObserver, ControlVector, DirectionAnalyzer,
    HiddenStateSamples, LayerSkip, NullObserver, PromptDataset, RegularizationPolicy,
    SafetensorsExporter, SampleStore,
};
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::io::Write;
use tempfile::NamedTempFile;

const SAMPLES: usize = 100;
const HIDDEN: usize = 8;
const AXIS: usize = 3;

/// Baseline of zeros plus two Gaussian classes; the second is shifted by
/// `shift` along `AXIS`. Every layer holds the same data.
fn gaussian_store(shift: f32, layers: usize, seed: u64) -> HiddenStateSamples {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0_f32, 0.25).unwrap();

    let mut draw = |offset: f32| -> Array2<f32> {
        Array2::from_shape_fn((SAMPLES, HIDDEN), |(_, j)| {
            noise.sample(&mut rng) + if j == AXIS { offset } else { 0.0 }
        })
    };
    let a = draw(0.0);
    let b = draw(shift);

    let per_layer = |data: &Array2<f32>| {
        Array3::from_shape_fn((SAMPLES, layers, HIDDEN), |(i, _, j)| data[[i, j]])
    };
    HiddenStateSamples::new(vec![
        Array3::zeros((SAMPLES, layers, HIDDEN)),
        per_layer(&a),
        per_layer(&b),
    ])
    .unwrap()
}

fn unregularized_config() -> AnalyzerConfig {
    AnalyzerConfig {
        skip_begin_layers: LayerSkip::Absolute(0),
        skip_end_layers: LayerSkip::Absolute(0),
        discriminant_ratio_tolerance: 0.1,
        regularization: RegularizationPolicy::SoftThreshold { factor: 0.0 },
        ..Default::default()
    }
}

/// A shift along one axis is recovered as that axis
#[test]
fn test_recovers_planted_axis() {
    for seed in [1, 2, 3] {
        let store = gaussian_store(5.0, 2, seed);
        let analyzer = DirectionAnalyzer::new(unregularized_config()).unwrap();
        let mut observer = CollectingObserver::default();

        let report = analyzer.analyze(&store, &mut observer).unwrap();
        assert_eq!(observer.summaries.len(), 2);
        assert!(observer.summaries.iter().all(|s| s.has_direction()));

        let v = report.directions.class(1).unwrap().combined(0).unwrap();
        let norm = v.dot(&v).sqrt();
        let cosine = (v[AXIS] / norm).abs();
        assert!(cosine > 0.99, "seed {seed}: cosine {cosine}");
        // Scaled by the shifted class's mean projection
        assert!((norm - 5.0).abs() < 0.5, "seed {seed}: norm {norm}");
    }
}

/// Identically distributed classes give no direction at all
#[test]
fn test_identical_classes_select_nothing() {
    let store = gaussian_store(0.0, 2, 11);
    let analyzer = DirectionAnalyzer::new(unregularized_config()).unwrap();
    let mut observer = CollectingObserver::default();

    let report = analyzer.analyze(&store, &mut observer).unwrap();
    assert!(observer.summaries.iter().all(|s| !s.has_direction()));
    assert!(report.directions.classes.iter().all(|c| c.is_empty()));
}

/// Analyse, export, and read the control vector back
#[test]
fn test_analyze_and_export() {
    let store = gaussian_store(5.0, 3, 5);
    let config = AnalyzerConfig {
        skip_end_layers: LayerSkip::Absolute(1),
        ..unregularized_config()
    };
    let analyzer = DirectionAnalyzer::new(config).unwrap();
    let report = analyzer.analyze(&store, &mut NullObserver).unwrap();
    assert_eq!(report.layer_range, 0..2);

    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("run");
    let names = vec!["calm".to_string(), "excited".to_string()];
    let written = export_control_vectors(
        &SafetensorsExporter,
        &report.directions,
        &names,
        "test-model",
        store.num_layers(),
        &prefix,
    )
    .unwrap();

    let excited = dir.path().join("run_control_vector_excited.safetensors");
    assert!(written.contains(&excited));

    let vector = ControlVector::load(&excited).unwrap();
    assert_eq!(vector.model_hint, "test-model");
    assert_eq!(vector.layer_count, 3);
    assert_eq!(vector.directions.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(vector.hidden_size().unwrap(), HIDDEN);
}

/// Sample caches survive a save/load cycle and analyse identically
#[test]
fn test_sample_cache_round_trip() {
    let store = gaussian_store(5.0, 2, 9);
    let file = NamedTempFile::new().unwrap();
    store.save(file.path()).unwrap();
    let loaded = HiddenStateSamples::load(file.path()).unwrap();

    let analyzer = DirectionAnalyzer::new(unregularized_config()).unwrap();
    let a = analyzer.analyze(&store, &mut NullObserver).unwrap();
    let b = analyzer.analyze(&loaded, &mut NullObserver).unwrap();
    assert_eq!(a.summaries, b.summaries);
    assert_eq!(a.directions, b.directions);
}

/// Merging two runs stacks their directions layer by layer
#[test]
fn test_merge_runs() {
    let analyzer = DirectionAnalyzer::new(unregularized_config()).unwrap();
    let first = analyzer
        .analyze(&gaussian_store(5.0, 2, 21), &mut NullObserver)
        .unwrap();
    let second = analyzer
        .analyze(&gaussian_store(5.0, 2, 22), &mut NullObserver)
        .unwrap();

    let mut merged = first.directions.clone();
    merged.merge(&second.directions).unwrap();

    let stack = merged.class(1).unwrap().layer(0).unwrap();
    assert_eq!(stack.len(), 2);
    let combined = merged.class(1).unwrap().combined(0).unwrap();
    assert!(combined[AXIS].abs() > 9.0);
}

/// Prompt datasets load from the three input files
#[test]
fn test_dataset_loading() {
    let mut stems = NamedTempFile::new().unwrap();
    writeln!(stems, r#"{{"pre": ["You are", "Act as"], "post": ["a storyteller"]}}"#).unwrap();

    let mut continuations = NamedTempFile::new().unwrap();
    writeln!(
        continuations,
        r#"{{"classes": ["happy", "sad"], "data": [["who is always cheerful", "who is always gloomy"]]}}"#
    )
    .unwrap();

    let mut prompts = NamedTempFile::new().unwrap();
    writeln!(prompts, "Write about the sea.\n\nWrite about a city.").unwrap();

    let dataset =
        PromptDataset::load(stems.path(), continuations.path(), prompts.path(), 6, 3).unwrap();

    assert_eq!(dataset.class_names(), ["baseline", "happy", "sad"]);
    assert_eq!(dataset.total_samples(), 18);
    let sad = dataset.samples(2).unwrap();
    assert!(sad.iter().all(|s| s.system_message.ends_with("who is always gloomy.")));
    assert!(sad
        .iter()
        .all(|s| s.writing_prompt == "Write about the sea." || s.writing_prompt == "Write about a city."));
}

/// Analyzer configuration parses from JSON with defaults filled in
#[test]
fn test_config_from_json() {
    let json = r#"{
        "skip_begin_layers": 0.25,
        "discriminant_ratio_tolerance": 0.2,
        "regularization": {"policy": "midpoint_centering"},
        "parallel": true
    }"#;
    let config: AnalyzerConfig = serde_json::from_str(json).unwrap();

    assert_eq!(config.skip_begin_layers, LayerSkip::Fraction(0.25));
    assert_eq!(config.skip_end_layers, LayerSkip::Absolute(1));
    assert_eq!(config.regularization, RegularizationPolicy::MidpointCentering);
    assert_eq!(config.balancedness_score_exponent, 0.0);
    assert!(config.parallel);
    assert!(config.validate().is_ok());
}
