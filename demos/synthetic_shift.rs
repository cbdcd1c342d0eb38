//! Recover a planted shift direction from synthetic hidden states
//!
//! Builds a baseline plus two classes of Gaussian "hidden-state deltas",
//! pushes one class along a random unit direction in the middle layers, and
//! checks how closely the analyzer recovers it.
//!
//! Usage:
//!   cargo run --release --example synthetic_shift

use anyhow::Result;
use control_vectors::{
    AnalyzerConfig, CollectingObserver, DirectionAnalyzer, HiddenStateSamples, LayerSkip,
    RegularizationPolicy,
};
use ndarray::{Array1, Array3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const SAMPLES: usize = 200;
const LAYERS: usize = 12;
const HIDDEN: usize = 32;
const SHIFT: f32 = 3.0;

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut rng = StdRng::seed_from_u64(7);
    let noise = Normal::new(0.0_f32, 0.5)?;

    let planted: Array1<f32> = (0..HIDDEN).map(|_| noise.sample(&mut rng)).collect();
    let planted = &planted / planted.dot(&planted).sqrt();

    let mut classes = Vec::new();
    for class in 0..3 {
        let mut data = Array3::from_shape_fn((SAMPLES, LAYERS, HIDDEN), |_| noise.sample(&mut rng));
        if class == 2 {
            for layer in LAYERS / 3..2 * LAYERS / 3 {
                for mut row in data.slice_mut(ndarray::s![.., layer, ..]).rows_mut() {
                    row.scaled_add(SHIFT, &planted);
                }
            }
        }
        classes.push(data);
    }
    let samples = HiddenStateSamples::new(classes)?;

    let config = AnalyzerConfig {
        skip_begin_layers: LayerSkip::Absolute(0),
        skip_end_layers: LayerSkip::Absolute(0),
        discriminant_ratio_tolerance: 0.1,
        regularization: RegularizationPolicy::SoftThreshold { factor: 0.0 },
        parallel: true,
        ..Default::default()
    };
    let analyzer = DirectionAnalyzer::new(config)?;
    let mut observer = CollectingObserver::default();
    let report = analyzer.analyze(&samples, &mut observer)?;

    println!("\n=== Planted direction recovery ===");
    let shifted = report
        .directions
        .class(1)
        .ok_or_else(|| anyhow::anyhow!("Missing shifted class"))?;
    for summary in &observer.summaries {
        let layer = summary.layer;
        match shifted.combined(layer) {
            Some(v) => {
                let cosine = v.dot(&planted) / v.dot(&v).sqrt();
                println!(
                    "Layer {:2}: {} selected, |v| = {:.3}, cos = {:.4}",
                    layer + 1,
                    summary.selected_directions,
                    v.dot(&v).sqrt(),
                    cosine
                );
            }
            None => println!("Layer {:2}: no direction", layer + 1),
        }
    }

    Ok(())
}
