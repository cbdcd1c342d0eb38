//! Direction analyzer: runs extraction, composition and regularisation over
//! a range of layers and collects the per-class output directions.
//!
//! Per layer:
//!
//! ```text
//! extract → filter (tolerance) → [none ⇒ no direction]
//!         → sort → greedy compose → [none accepted ⇒ no direction]
//!         → regularise → emit mean · unit direction per class
//! ```

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use anyhow::Result;
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{CpuBackend, NumericBackend};
use crate::compose::{Composition, GreedyComposer};
use crate::extract::compute_symmetrised_cross_covariance_eigenvectors;
use crate::progress::{LayerObserver, LayerSummary, SelectionSummary};
use crate::regularize::{RegularizationPolicy, RegularizedMeans};
use crate::samples::SampleStore;
use crate::scoring::DirectionScorer;

/// Scaled directions whose class mean is smaller than this are not emitted
pub const MIN_DIRECTION_MAGNITUDE: f64 = 0.0005;

/// Layers to skip, either as a count or as a fraction of the model's depth
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayerSkip {
    Absolute(usize),
    Fraction(f64),
}

impl LayerSkip {
    /// Values in (0, 1) are fractions, non-negative whole numbers are counts
    pub fn from_value(value: f64) -> Result<Self> {
        if value > 0.0 && value < 1.0 {
            Ok(Self::Fraction(value))
        } else if value >= 0.0 && value.fract() == 0.0 && value.is_finite() {
            Ok(Self::Absolute(value as usize))
        } else {
            anyhow::bail!("Layer skip must be a fraction in (0, 1) or a whole number, got {value}")
        }
    }

    /// Number of layers this skips for a model with `num_layers` layers.
    ///
    /// Fractions round to the nearest layer, ties to even.
    pub fn resolve(&self, num_layers: usize) -> Result<usize> {
        match *self {
            Self::Absolute(count) => Ok(count),
            Self::Fraction(fraction) => {
                let value = Self::from_value(fraction)?;
                if let Self::Absolute(count) = value {
                    return Ok(count);
                }
                Ok((fraction * num_layers as f64).round_ties_even() as usize)
            }
        }
    }
}

impl Default for LayerSkip {
    fn default() -> Self {
        Self::Absolute(0)
    }
}

impl fmt::Display for LayerSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute(count) => write!(f, "{count}"),
            Self::Fraction(fraction) => write!(f, "{fraction}"),
        }
    }
}

impl FromStr for LayerSkip {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let value: f64 = s
            .trim()
            .parse()
            .map_err(|e| format!("Invalid layer skip '{s}': {e}"))?;
        Self::from_value(value).map_err(|e| e.to_string())
    }
}

/// Layers analysed: `skip_begin .. num_layers - skip_end`
pub fn resolve_layer_range(
    skip_begin: LayerSkip,
    skip_end: LayerSkip,
    num_layers: usize,
) -> Result<Range<usize>> {
    let begin = skip_begin.resolve(num_layers)?;
    let skip_end = skip_end.resolve(num_layers)?;
    let end = num_layers.saturating_sub(skip_end);
    anyhow::ensure!(
        begin < end,
        "No layers left to analyse: skipping {begin} at the start and {skip_end} at the end of {num_layers}"
    );
    Ok(begin..end)
}

/// Configuration for a direction analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Initial layers to skip (count or fraction)
    pub skip_begin_layers: LayerSkip,
    /// Final layers to skip (count or fraction)
    pub skip_end_layers: LayerSkip,
    /// Minimum candidate score, and minimum improvement when composing
    pub discriminant_ratio_tolerance: f64,
    /// Balancedness penalty exponent (0 = disabled)
    pub balancedness_score_exponent: f64,
    /// How the selected direction's class means are corrected
    pub regularization: RegularizationPolicy,
    /// Analyse layers on the rayon thread pool
    pub parallel: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            skip_begin_layers: LayerSkip::Absolute(0),
            skip_end_layers: LayerSkip::Absolute(1),
            discriminant_ratio_tolerance: 0.5,
            balancedness_score_exponent: 0.0,
            regularization: RegularizationPolicy::default(),
            parallel: false,
        }
    }
}

impl AnalyzerConfig {
    pub fn validate(&self) -> Result<()> {
        let tolerance = self.discriminant_ratio_tolerance;
        anyhow::ensure!(
            tolerance.is_finite() && tolerance >= 0.0,
            "discriminant_ratio_tolerance must be >= 0, got {tolerance}"
        );
        let exponent = self.balancedness_score_exponent;
        anyhow::ensure!(
            exponent.is_finite() && exponent >= 0.0,
            "balancedness_score_exponent must be >= 0, got {exponent}"
        );
        if let RegularizationPolicy::SoftThreshold { factor } = self.regularization {
            anyhow::ensure!(
                factor.is_finite() && factor >= 0.0,
                "regularisation factor must be >= 0, got {factor}"
            );
        }
        for skip in [self.skip_begin_layers, self.skip_end_layers] {
            if let LayerSkip::Fraction(f) = skip {
                LayerSkip::from_value(f)?;
            }
        }
        Ok(())
    }
}

/// Per-layer stacks of output directions for one class
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDirections {
    layers: Vec<Vec<Array1<f32>>>,
}

impl LayerDirections {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![Vec::new(); num_layers],
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn push(&mut self, layer: usize, direction: Array1<f32>) -> Result<()> {
        let num_layers = self.layers.len();
        let stack = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| anyhow::anyhow!("Layer {layer} out of range ({num_layers} layers)"))?;
        stack.push(direction);
        Ok(())
    }

    /// The stack for `layer`, or `None` when it has no directions
    pub fn layer(&self, layer: usize) -> Option<&[Array1<f32>]> {
        self.layers
            .get(layer)
            .filter(|stack| !stack.is_empty())
            .map(Vec::as_slice)
    }

    /// Sum of the stack for `layer`
    pub fn combined(&self, layer: usize) -> Option<Array1<f32>> {
        let stack = self.layer(layer)?;
        let mut sum = stack[0].clone();
        for direction in &stack[1..] {
            sum += direction;
        }
        Some(sum)
    }

    /// Indices of layers holding at least one direction
    pub fn present_layers(&self) -> impl Iterator<Item = usize> + '_ {
        self.layers
            .iter()
            .enumerate()
            .filter(|(_, stack)| !stack.is_empty())
            .map(|(i, _)| i)
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(Vec::is_empty)
    }

    /// Append another run's directions, layer by layer
    pub fn merge(&mut self, other: &LayerDirections) -> Result<()> {
        anyhow::ensure!(
            self.layers.len() == other.layers.len(),
            "Cannot merge directions for {} layers into {}",
            other.layers.len(),
            self.layers.len()
        );
        for (mine, theirs) in self.layers.iter_mut().zip(&other.layers) {
            mine.extend(theirs.iter().cloned());
        }
        Ok(())
    }
}

/// Output of an analysis: one [`LayerDirections`] per non-baseline class
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionMatrices {
    pub classes: Vec<LayerDirections>,
    /// Midpoint directions (midpoint-centering policy only)
    pub debias: Option<LayerDirections>,
}

impl DirectionMatrices {
    fn new(num_classes: usize, num_layers: usize, with_debias: bool) -> Self {
        Self {
            classes: vec![LayerDirections::new(num_layers); num_classes],
            debias: with_debias.then(|| LayerDirections::new(num_layers)),
        }
    }

    pub fn class(&self, index: usize) -> Option<&LayerDirections> {
        self.classes.get(index)
    }

    pub fn merge(&mut self, other: &DirectionMatrices) -> Result<()> {
        anyhow::ensure!(
            self.classes.len() == other.classes.len(),
            "Cannot merge {} classes into {}",
            other.classes.len(),
            self.classes.len()
        );
        for (mine, theirs) in self.classes.iter_mut().zip(&other.classes) {
            mine.merge(theirs)?;
        }
        match (&mut self.debias, &other.debias) {
            (Some(mine), Some(theirs)) => mine.merge(theirs)?,
            (None, Some(theirs)) => self.debias = Some(theirs.clone()),
            _ => {}
        }
        Ok(())
    }
}

/// The direction selected for a layer, with its regularised means
#[derive(Debug, Clone)]
pub struct Selection {
    pub composition: Composition,
    pub regularized: RegularizedMeans,
}

/// Result of analysing one layer
#[derive(Debug, Clone)]
pub struct LayerAnalysis {
    pub layer: usize,
    pub total_directions: usize,
    pub filtered_directions: usize,
    /// `None` when nothing passed the filter or nothing was accepted
    pub selection: Option<Selection>,
}

impl LayerAnalysis {
    pub fn summary(&self) -> LayerSummary {
        LayerSummary {
            layer: self.layer,
            total_directions: self.total_directions,
            filtered_directions: self.filtered_directions,
            selected_directions: self
                .selection
                .as_ref()
                .map_or(0, |s| s.composition.accepted),
            selection: self.selection.as_ref().map(|s| {
                let stats = &s.composition.stats;
                SelectionSummary {
                    discriminant_ratio: stats.discriminant_ratio,
                    variance_reduction: stats.variance_reduction,
                    means: [stats.classes[0].mean, stats.classes[1].mean],
                    std_devs: [stats.classes[0].std_dev, stats.classes[1].std_dev],
                    regularized_means: s.regularized.means,
                    debias: s.regularized.debias,
                }
            }),
        }
    }
}

/// Everything an analysis produces
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub directions: DirectionMatrices,
    pub summaries: Vec<LayerSummary>,
    pub layer_range: Range<usize>,
}

/// Finds per-layer control directions in a [`SampleStore`]
pub struct DirectionAnalyzer {
    config: AnalyzerConfig,
    backend: Box<dyn NumericBackend>,
    cancel: CancellationToken,
}

impl DirectionAnalyzer {
    /// Create an analyzer on the CPU backend
    pub fn new(config: AnalyzerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            backend: Box::new(CpuBackend),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_backend(mut self, backend: Box<dyn NumericBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Checked before every layer; a cancelled run returns an error
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    fn composer(&self) -> GreedyComposer {
        GreedyComposer::new(
            DirectionScorer::new(self.config.balancedness_score_exponent),
            self.config.discriminant_ratio_tolerance,
        )
    }

    fn check_cancelled(&self, layer: usize) -> Result<()> {
        if self.cancel.is_cancelled() {
            anyhow::bail!("Analysis cancelled before layer {}", layer + 1);
        }
        Ok(())
    }

    /// The two contrasted (baseline-differenced) classes for `layer`
    fn layer_data(&self, store: &dyn SampleStore, layer: usize) -> Result<[Array2<f32>; 2]> {
        let datasets = store.differenced_datasets(layer)?;
        let count = datasets.len();
        let data: [Array2<f32>; 2] = datasets.try_into().map_err(|_| {
            anyhow::anyhow!("Expected exactly 2 contrasted classes per layer, got {count}")
        })?;
        anyhow::ensure!(
            data[0].ncols() == data[1].ncols(),
            "Layer {}: feature dimension mismatch ({} vs {})",
            layer + 1,
            data[0].ncols(),
            data[1].ncols()
        );
        Ok(data)
    }

    /// Analyse a single layer
    pub fn analyze_layer(&self, store: &dyn SampleStore, layer: usize) -> Result<LayerAnalysis> {
        let data = self.layer_data(store, layer)?;
        let eigenvectors =
            compute_symmetrised_cross_covariance_eigenvectors(self.backend.as_ref(), &data[0], &data[1])?;

        let composer = self.composer();
        let candidates = composer.candidates(&data, &eigenvectors)?;
        let composition = composer.compose(&data, &candidates)?;

        let selection = composition.map(|composition| {
            let regularized = self.config.regularization.apply(&composition.stats.classes);
            Selection {
                composition,
                regularized,
            }
        });

        debug!(
            "Layer {}: {} candidates, selected = {}",
            layer + 1,
            candidates.len(),
            selection.is_some()
        );

        Ok(LayerAnalysis {
            layer,
            total_directions: eigenvectors.nrows(),
            filtered_directions: candidates.len(),
            selection,
        })
    }

    /// Analyse every configured layer of `store`
    pub fn analyze(
        &self,
        store: &dyn SampleStore,
        observer: &mut dyn LayerObserver,
    ) -> Result<AnalysisReport> {
        let num_layers = store.num_layers();
        let num_types = store.num_dataset_types();
        anyhow::ensure!(
            num_types == 3,
            "Expected a baseline plus exactly 2 classes, got {num_types} dataset types"
        );

        let range = resolve_layer_range(
            self.config.skip_begin_layers,
            self.config.skip_end_layers,
            num_layers,
        )?;
        info!(
            "Analysing layers {} to {} of {} on {}",
            range.start + 1,
            range.end,
            num_layers,
            self.backend.name()
        );

        let with_debias = matches!(
            self.config.regularization,
            RegularizationPolicy::MidpointCentering
        );
        let mut directions = DirectionMatrices::new(num_types - 1, num_layers, with_debias);
        let mut summaries = Vec::with_capacity(range.len());

        let mut record = |analysis: LayerAnalysis| -> Result<()> {
            let summary = analysis.summary();
            observer.on_layer_result(analysis.layer, &summary);
            summaries.push(summary);
            emit_directions(&mut directions, &analysis)
        };

        if self.config.parallel {
            let analyses = range
                .clone()
                .into_par_iter()
                .map(|layer| {
                    self.check_cancelled(layer)?;
                    self.analyze_layer(store, layer)
                })
                .collect::<Result<Vec<_>>>()?;
            for analysis in analyses {
                record(analysis)?;
            }
        } else {
            for layer in range.clone() {
                self.check_cancelled(layer)?;
                record(self.analyze_layer(store, layer)?)?;
            }
        }

        let selected = summaries.iter().filter(|s| s.has_direction()).count();
        info!("Selected directions for {}/{} layers", selected, range.len());

        Ok(AnalysisReport {
            directions,
            summaries,
            layer_range: range,
        })
    }
}

/// Scale the layer's unit direction by each regularised class mean
fn emit_directions(directions: &mut DirectionMatrices, analysis: &LayerAnalysis) -> Result<()> {
    let Some(selection) = &analysis.selection else {
        return Ok(());
    };
    let unit = &selection.composition.direction;

    for (class, &mean) in directions
        .classes
        .iter_mut()
        .zip(&selection.regularized.means)
    {
        if mean.abs() >= MIN_DIRECTION_MAGNITUDE {
            class.push(analysis.layer, unit * mean as f32)?;
        }
    }

    if let (Some(debias), Some(midpoint)) = (&mut directions.debias, selection.regularized.debias) {
        if midpoint.abs() >= MIN_DIRECTION_MAGNITUDE {
            debias.push(analysis.layer, unit * midpoint as f32)?;
        }
    }
    Ok(())
}
