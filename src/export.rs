//! Control vector export
//!
//! A [`ControlVector`] is one class's per-layer directions, each layer's stack
//! summed into a single vector. It is written as safetensors with one F32
//! tensor per layer named `direction.<layer + 1>` and two metadata entries
//! (`controlvector.model_hint`, `controlvector.layer_count`).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use safetensors::tensor::{SafeTensors, TensorView};
use safetensors::Dtype;
use tracing::{info, warn};

use crate::analyzer::{DirectionMatrices, LayerDirections};

const MODEL_HINT_KEY: &str = "controlvector.model_hint";
const LAYER_COUNT_KEY: &str = "controlvector.layer_count";

/// Summed per-layer directions for one class
#[derive(Debug, Clone, PartialEq)]
pub struct ControlVector {
    pub model_hint: String,
    pub layer_count: usize,
    /// Zero-based layer index to direction
    pub directions: BTreeMap<usize, Vec<f32>>,
}

impl ControlVector {
    /// Sum each layer's stack; layers without directions are left out.
    pub fn from_directions(
        directions: &LayerDirections,
        model_hint: &str,
        layer_count: usize,
    ) -> Result<Self> {
        let summed: BTreeMap<usize, Vec<f32>> = directions
            .present_layers()
            .filter_map(|layer| directions.combined(layer).map(|v| (layer, v.to_vec())))
            .collect();
        anyhow::ensure!(!summed.is_empty(), "No directions to export");

        let vector = Self {
            model_hint: model_hint.to_string(),
            layer_count,
            directions: summed,
        };
        vector.hidden_size()?;
        Ok(vector)
    }

    pub fn tensor_name(layer: usize) -> String {
        format!("direction.{}", layer + 1)
    }

    /// Common length of all directions
    pub fn hidden_size(&self) -> Result<usize> {
        let mut sizes = self.directions.values().map(Vec::len);
        let size = sizes
            .next()
            .ok_or_else(|| anyhow::anyhow!("Control vector has no directions"))?;
        anyhow::ensure!(
            sizes.all(|s| s == size),
            "Control vector directions have different lengths"
        );
        Ok(size)
    }

    /// Read a control vector written by [`SafetensorsExporter`]
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let (_, metadata) = SafeTensors::read_metadata(&data)
            .with_context(|| format!("Failed to read header of {}", path.display()))?;
        let metadata = metadata.metadata().clone().unwrap_or_default();
        let model_hint = metadata.get(MODEL_HINT_KEY).cloned().unwrap_or_default();
        let layer_count: usize = metadata
            .get(LAYER_COUNT_KEY)
            .ok_or_else(|| anyhow::anyhow!("Missing '{LAYER_COUNT_KEY}' in {}", path.display()))?
            .parse()
            .with_context(|| format!("Bad '{LAYER_COUNT_KEY}' in {}", path.display()))?;

        let tensors = SafeTensors::deserialize(&data)
            .with_context(|| format!("Failed to deserialize {}", path.display()))?;
        let mut directions = BTreeMap::new();
        for (name, view) in tensors.tensors() {
            let layer: usize = name
                .strip_prefix("direction.")
                .and_then(|n| n.parse().ok())
                .filter(|&n| n > 0)
                .ok_or_else(|| anyhow::anyhow!("Unexpected tensor '{name}'"))?;
            anyhow::ensure!(
                view.dtype() == Dtype::F32,
                "Tensor '{name}' has dtype {:?}, expected F32",
                view.dtype()
            );
            directions.insert(layer - 1, f32_from_le_bytes(view.data()));
        }

        Ok(Self {
            model_hint,
            layer_count,
            directions,
        })
    }
}

/// Writes a control vector to disk in some format
pub trait DirectionExporter {
    fn export(&self, vector: &ControlVector, path: &Path) -> Result<()>;

    /// File extension, without the dot
    fn extension(&self) -> &'static str;
}

/// safetensors writer
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetensorsExporter;

impl DirectionExporter for SafetensorsExporter {
    fn export(&self, vector: &ControlVector, path: &Path) -> Result<()> {
        let buffers: Vec<(String, Vec<u8>, usize)> = vector
            .directions
            .iter()
            .map(|(&layer, v)| {
                let bytes = v.iter().flat_map(|x| x.to_le_bytes()).collect();
                (ControlVector::tensor_name(layer), bytes, v.len())
            })
            .collect();

        let mut views = Vec::with_capacity(buffers.len());
        for (name, bytes, len) in &buffers {
            views.push((name.as_str(), TensorView::new(Dtype::F32, vec![*len], bytes)?));
        }

        let metadata = HashMap::from([
            (MODEL_HINT_KEY.to_string(), vector.model_hint.clone()),
            (LAYER_COUNT_KEY.to_string(), vector.layer_count.to_string()),
        ]);
        safetensors::tensor::serialize_to_file(
            views.iter().map(|(name, view)| (*name, view)),
            &Some(metadata),
            path,
        )
        .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn extension(&self) -> &'static str {
        "safetensors"
    }
}

/// Path of the control vector file for one class
pub fn control_vector_path(output_prefix: &Path, class_name: &str, extension: &str) -> PathBuf {
    let mut name = output_prefix.as_os_str().to_owned();
    name.push(format!("_control_vector_{class_name}.{extension}"));
    PathBuf::from(name)
}

/// Export one file per class with at least one direction.
///
/// `class_names` are the non-baseline classes, in the same order as
/// `directions.classes`. Returns the paths written.
pub fn export_control_vectors(
    exporter: &dyn DirectionExporter,
    directions: &DirectionMatrices,
    class_names: &[String],
    model_hint: &str,
    layer_count: usize,
    output_prefix: &Path,
) -> Result<Vec<PathBuf>> {
    anyhow::ensure!(
        class_names.len() == directions.classes.len(),
        "Got {} class names for {} direction sets",
        class_names.len(),
        directions.classes.len()
    );

    let mut written = Vec::new();
    for (name, class) in class_names.iter().zip(&directions.classes) {
        if class.is_empty() {
            warn!("No directions for class '{name}', skipping export");
            continue;
        }
        let vector = ControlVector::from_directions(class, model_hint, layer_count)?;
        let path = control_vector_path(output_prefix, name, exporter.extension());
        exporter.export(&vector, &path)?;
        info!(
            "Exported {} layers for '{name}' to {}",
            vector.directions.len(),
            path.display()
        );
        written.push(path);
    }
    Ok(written)
}

fn f32_from_le_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(chunk);
            f32::from_le_bytes(buf)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn directions() -> LayerDirections {
        let mut directions = LayerDirections::new(4);
        directions.push(1, array![1.0_f32, -2.0, 0.5]).unwrap();
        directions.push(1, array![0.5_f32, 0.0, 0.5]).unwrap();
        directions.push(3, array![0.0_f32, 3.0, 0.0]).unwrap();
        directions
    }

    #[test]
    fn test_from_directions_sums_stacks() {
        let vector = ControlVector::from_directions(&directions(), "llama", 4).unwrap();

        assert_eq!(vector.directions.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(vector.directions[&1], vec![1.5, -2.0, 1.0]);
        assert_eq!(vector.hidden_size().unwrap(), 3);
    }

    #[test]
    fn test_empty_directions_rejected() {
        assert!(ControlVector::from_directions(&LayerDirections::new(4), "llama", 4).is_err());
    }

    #[test]
    fn test_tensor_names_are_one_based() {
        assert_eq!(ControlVector::tensor_name(0), "direction.1");
        assert_eq!(ControlVector::tensor_name(31), "direction.32");
    }

    #[test]
    fn test_safetensors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vector.safetensors");
        let vector = ControlVector::from_directions(&directions(), "mistral", 4).unwrap();

        SafetensorsExporter.export(&vector, &path).unwrap();
        let loaded = ControlVector::load(&path).unwrap();

        assert_eq!(loaded, vector);
    }

    #[test]
    fn test_control_vector_path() {
        let path = control_vector_path(Path::new("out/run"), "happy", "safetensors");
        assert_eq!(path, PathBuf::from("out/run_control_vector_happy.safetensors"));
    }
}
