//! Hidden-state sample store
//!
//! Holds, for every class, one hidden-state delta per sample per layer: the
//! change a layer made to the last-token residual stream. Index 0 is the
//! baseline class; the analysis works on every other class's deltas minus
//! the baseline's (the "differenced" datasets).
//!
//! The store can be cached to disk as safetensors (one `class.<i>` tensor of
//! shape `(samples, layers, hidden)` per class) so a run can skip collection.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use ndarray::{s, Array2, Array3};
use tracing::{debug, info};

use crate::dataset::{ChatMessage, MessageLayout, PromptDataset};

/// Provider of per-layer feature matrices for the direction analyzer
pub trait SampleStore: Sync {
    /// Number of transformer layers with samples
    fn num_layers(&self) -> usize;

    /// Number of classes, baseline included
    fn num_dataset_types(&self) -> usize;

    /// Every non-baseline class's samples minus the baseline's, for one layer
    fn differenced_datasets(&self, layer: usize) -> Result<Vec<Array2<f32>>>;
}

/// Model execution collaborator: runs one conversation through the model and
/// returns the last-token hidden state after the embeddings and after every
/// layer (`n_layers + 1` vectors).
pub trait HiddenStateSource {
    fn hidden_states(&mut self, conversation: &[ChatMessage]) -> Result<Vec<Vec<f32>>>;
}

/// Per-layer deltas `h[i] - h[i - 1]` of a sequence of hidden states
pub fn layer_deltas(hidden_states: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
    anyhow::ensure!(
        hidden_states.len() >= 2,
        "Need at least two hidden states to form a delta, got {}",
        hidden_states.len()
    );
    hidden_states
        .windows(2)
        .map(|pair| {
            anyhow::ensure!(
                pair[0].len() == pair[1].len(),
                "Hidden state size changed between layers: {} vs {}",
                pair[0].len(),
                pair[1].len()
            );
            Ok(pair[1].iter().zip(&pair[0]).map(|(b, a)| b - a).collect())
        })
        .collect()
}

/// In-memory hidden-state deltas for all classes
#[derive(Debug, Clone)]
pub struct HiddenStateSamples {
    /// One `(samples, layers, hidden)` array per class
    classes: Vec<Array3<f32>>,
}

impl HiddenStateSamples {
    /// Create a store from per-class `(samples, layers, hidden)` arrays.
    ///
    /// All classes must have the same shape (samples are paired).
    pub fn new(classes: Vec<Array3<f32>>) -> Result<Self> {
        anyhow::ensure!(classes.len() >= 2, "Need a baseline and at least one class");
        let shape = classes[0].dim();
        anyhow::ensure!(
            shape.0 > 0 && shape.1 > 0 && shape.2 > 0,
            "Empty sample store: {shape:?}"
        );
        for (i, class) in classes.iter().enumerate() {
            anyhow::ensure!(
                class.dim() == shape,
                "Class {i} has shape {:?}, expected {shape:?}",
                class.dim()
            );
        }
        Ok(Self { classes })
    }

    /// Run every prompt of every class through `source`, keeping the
    /// per-layer deltas of the last-token hidden state.
    pub fn collect(
        source: &mut dyn HiddenStateSource,
        dataset: &PromptDataset,
        layout: MessageLayout,
    ) -> Result<Self> {
        let total = dataset.total_samples();
        let mut done = 0;
        let mut classes = Vec::with_capacity(dataset.num_classes());

        for (class, name) in dataset.class_names().iter().enumerate() {
            let samples = dataset
                .samples(class)
                .ok_or_else(|| anyhow::anyhow!("Missing samples for class {name}"))?;
            let mut rows: Vec<Vec<Vec<f32>>> = Vec::with_capacity(samples.len());

            for sample in samples {
                let hidden = source.hidden_states(&sample.conversation(layout))?;
                rows.push(layer_deltas(&hidden)?);
                done += 1;
                if done % 100 == 0 || done == total {
                    info!("Sampled hidden states: {done}/{total}");
                }
            }

            classes.push(stack_samples(&rows).with_context(|| format!("Class '{name}'"))?);
        }

        Self::new(classes)
    }

    pub fn num_samples(&self) -> usize {
        self.classes[0].dim().0
    }

    pub fn hidden_size(&self) -> usize {
        self.classes[0].dim().2
    }

    pub fn total_samples(&self) -> usize {
        self.num_samples() * self.classes.len()
    }

    /// Raw (un-differenced) samples of every class for one layer
    pub fn datasets(&self, layer: usize) -> Result<Vec<Array2<f32>>> {
        anyhow::ensure!(
            layer < self.num_layers(),
            "Layer {layer} out of range ({} layers)",
            self.num_layers()
        );
        Ok(self
            .classes
            .iter()
            .map(|class| class.slice(s![.., layer, ..]).to_owned())
            .collect())
    }

    /// Save as a safetensors cache
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tensors = HashMap::new();
        for (i, class) in self.classes.iter().enumerate() {
            let flat: Vec<f32> = class.iter().copied().collect();
            let tensor = Tensor::from_vec(flat, class.dim(), &Device::Cpu)?;
            tensors.insert(format!("class.{i}"), tensor);
        }
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("Failed to save samples to {}", path.display()))?;
        info!(
            "Saved {} samples ({} layers) to {}",
            self.total_samples(),
            self.num_layers(),
            path.display()
        );
        Ok(())
    }

    /// Load a safetensors cache written by [`HiddenStateSamples::save`]
    pub fn load(path: &Path) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("Failed to load samples from {}", path.display()))?;

        let mut classes = Vec::with_capacity(tensors.len());
        for i in 0..tensors.len() {
            let name = format!("class.{i}");
            let tensor = tensors
                .get(&name)
                .ok_or_else(|| anyhow::anyhow!("Missing tensor '{name}' in {}", path.display()))?;
            let dims = tensor.dims3()?;
            let flat: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
            classes.push(Array3::from_shape_vec(dims, flat).context("Bad sample tensor shape")?);
        }
        debug!("Loaded {} classes from {}", classes.len(), path.display());

        let samples = Self::new(classes)?;
        info!(
            "Loaded {} samples ({} layers) from {}",
            samples.total_samples(),
            samples.num_layers(),
            path.display()
        );
        Ok(samples)
    }
}

impl SampleStore for HiddenStateSamples {
    fn num_layers(&self) -> usize {
        self.classes[0].dim().1
    }

    fn num_dataset_types(&self) -> usize {
        self.classes.len()
    }

    fn differenced_datasets(&self, layer: usize) -> Result<Vec<Array2<f32>>> {
        let mut datasets = self.datasets(layer)?.into_iter();
        let baseline = datasets
            .next()
            .ok_or_else(|| anyhow::anyhow!("No baseline class"))?;
        Ok(datasets.map(|class| class - &baseline).collect())
    }
}

/// Stack `samples × layers × hidden` nested vectors into one array
fn stack_samples(rows: &[Vec<Vec<f32>>]) -> Result<Array3<f32>> {
    let n_samples = rows.len();
    anyhow::ensure!(n_samples > 0, "No samples");
    let n_layers = rows[0].len();
    let hidden = rows[0].first().map_or(0, Vec::len);

    let mut flat = Vec::with_capacity(n_samples * n_layers * hidden);
    for (i, sample) in rows.iter().enumerate() {
        anyhow::ensure!(
            sample.len() == n_layers && sample.iter().all(|v| v.len() == hidden),
            "Sample {i} does not match shape ({n_layers} layers, {hidden} hidden)"
        );
        flat.extend(sample.iter().flatten().copied());
    }
    Array3::from_shape_vec((n_samples, n_layers, hidden), flat).context("Bad sample shape")
}
