//! Per-layer progress reporting
//!
//! The analyzer reports each finished layer through [`LayerObserver`] instead
//! of writing to the console itself. [`TracingObserver`] logs a one-line
//! summary per layer; [`CollectingObserver`] keeps the summaries.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::regularize::magnitude_share;

/// What was selected for a layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionSummary {
    pub discriminant_ratio: f64,
    pub variance_reduction: f64,
    pub means: [f64; 2],
    pub std_devs: [f64; 2],
    pub regularized_means: [f64; 2],
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub debias: Option<f64>,
}

/// Outcome of one analysed layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSummary {
    /// Zero-based layer index
    pub layer: usize,
    pub total_directions: usize,
    pub filtered_directions: usize,
    pub selected_directions: usize,
    /// `None` when no direction was selected
    pub selection: Option<SelectionSummary>,
}

impl LayerSummary {
    pub fn has_direction(&self) -> bool {
        self.selection.is_some()
    }

    /// One-line human readable form
    pub fn describe(&self, show_regularized: bool) -> String {
        let mut line = format!("Layer {}: ", self.layer + 1);
        if self.filtered_directions > 0 {
            line.push_str(&format!(
                "[{}/{} filtered]",
                self.filtered_directions, self.total_directions
            ));
        } else {
            line.push_str("[no directions filtered]");
        }

        let Some(sel) = &self.selection else {
            line.push_str(" [no directions selected]");
            return line;
        };

        line.push_str(&format!(
            " [{}/{} selected] Δ = {:.0}%, Δσ² = {:.1}%, Δμ = ({:.3}, {:.3} [{:.1}%])",
            self.selected_directions,
            self.total_directions,
            sel.discriminant_ratio * 100.0,
            sel.variance_reduction * 100.0,
            sel.means[0],
            sel.means[1],
            magnitude_share(sel.means) * 100.0
        ));
        if show_regularized {
            line.push_str(&format!(
                ", σ = ({:.3}, {:.3}) --> Δμ' = ({:.3}, {:.3} [{:.1}%])",
                sel.std_devs[0],
                sel.std_devs[1],
                sel.regularized_means[0],
                sel.regularized_means[1],
                magnitude_share(sel.regularized_means) * 100.0
            ));
        }
        if let Some(debias) = sel.debias {
            line.push_str(&format!(", midpoint = {debias:.3}"));
        }
        line
    }
}

/// Receives layer results in layer order
pub trait LayerObserver {
    fn on_layer_result(&mut self, layer: usize, summary: &LayerSummary);
}

/// Logs each layer summary at INFO level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver {
    show_regularized: bool,
}

impl TracingObserver {
    /// `show_regularized` adds standard deviations and regularised means
    pub fn new(show_regularized: bool) -> Self {
        Self { show_regularized }
    }
}

impl LayerObserver for TracingObserver {
    fn on_layer_result(&mut self, _layer: usize, summary: &LayerSummary) {
        info!("{}", summary.describe(self.show_regularized));
    }
}

/// Keeps every summary it receives
#[derive(Debug, Clone, Default)]
pub struct CollectingObserver {
    pub summaries: Vec<LayerSummary>,
}

impl LayerObserver for CollectingObserver {
    fn on_layer_result(&mut self, _layer: usize, summary: &LayerSummary) {
        self.summaries.push(summary.clone());
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl LayerObserver for NullObserver {
    fn on_layer_result(&mut self, _layer: usize, _summary: &LayerSummary) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(selection: Option<SelectionSummary>) -> LayerSummary {
        LayerSummary {
            layer: 4,
            total_directions: 8,
            filtered_directions: 3,
            selected_directions: usize::from(selection.is_some()),
            selection,
        }
    }

    #[test]
    fn test_describe_without_selection() {
        let line = summary(None).describe(true);
        assert_eq!(line, "Layer 5: [3/8 filtered] [no directions selected]");
    }

    #[test]
    fn test_describe_with_selection() {
        let line = summary(Some(SelectionSummary {
            discriminant_ratio: 1.5,
            variance_reduction: 0.25,
            means: [-1.0, 3.0],
            std_devs: [0.5, 0.5],
            regularized_means: [-0.5, 2.5],
            debias: None,
        }))
        .describe(false);

        assert!(line.starts_with("Layer 5: [3/8 filtered] [1/8 selected]"));
        assert!(line.contains("Δ = 150%"));
        assert!(line.contains("Δσ² = 25.0%"));
        assert!(line.contains("[75.0%]"));
        assert!(!line.contains("-->"));
    }

    #[test]
    fn test_collecting_observer() {
        let mut observer = CollectingObserver::default();
        observer.on_layer_result(4, &summary(None));
        assert_eq!(observer.summaries.len(), 1);
        assert!(!observer.summaries[0].has_direction());
    }
}
