// Pedantic clippy configuration for numerical code
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in statistics
#![allow(clippy::cast_possible_truncation)] // f64→f32 when scaling directions
#![allow(clippy::many_single_char_names)] // a, b, s, v standard in math
#![allow(clippy::similar_names)] // related variables like `mean_a`/`mean_b`
#![allow(clippy::module_name_repetitions)] // DirectionAnalyzer in analyzer.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! control-vectors: control vector direction analysis
//!
//! Finds, for each transformer layer, the direction in hidden-state space
//! that best separates two classes of paired samples (each already
//! differenced against a shared baseline), and turns it into per-class
//! steering vectors.
//!
//! ## Architecture
//!
//! - `backend`: Numeric backend trait (ndarray CPU, candle CPU/CUDA) and the symmetric eigensolver
//! - `extract`: Eigenvectors of the symmetrised cross-covariance of two classes
//! - `scoring`: Discriminant ratio, variance reduction and balancedness of 1-D projections
//! - `compose`: Candidate filtering and greedy composition of a compound direction
//! - `regularize`: Soft-threshold and midpoint-centering of class means
//! - `analyzer`: Per-layer orchestration, layer skipping, configuration
//! - `progress`: Per-layer summaries and observers
//! - `dataset`: Paired prompt dataset synthesis
//! - `samples`: Hidden-state sample store with safetensors cache
//! - `export`: Control vector aggregation and safetensors export

pub mod analyzer;
pub mod backend;
pub mod compose;
pub mod dataset;
pub mod export;
pub mod extract;
pub mod progress;
pub mod regularize;
pub mod samples;
pub mod scoring;

pub use analyzer::{
    resolve_layer_range, AnalysisReport, AnalyzerConfig, DirectionAnalyzer, DirectionMatrices,
    LayerAnalysis, LayerDirections, LayerSkip, Selection, MIN_DIRECTION_MAGNITUDE,
};
pub use backend::{CandleBackend, CpuBackend, NumericBackend};
pub use compose::{Candidate, Composition, GreedyComposer};
pub use dataset::{
    ChatMessage, Continuations, MessageLayout, PromptDataset, PromptSample, PromptStems,
    BASELINE_CLASS,
};
pub use export::{
    control_vector_path, export_control_vectors, ControlVector, DirectionExporter,
    SafetensorsExporter,
};
pub use extract::compute_symmetrised_cross_covariance_eigenvectors;
pub use progress::{
    CollectingObserver, LayerObserver, LayerSummary, NullObserver, SelectionSummary,
    TracingObserver,
};
pub use regularize::{soft_threshold, RegularizationPolicy, RegularizedMeans};
pub use samples::{layer_deltas, HiddenStateSamples, HiddenStateSource, SampleStore};
pub use scoring::{
    balancedness_score, discriminant_ratio, project_onto_direction, variance_reduction,
    ClassStats, DirectionScorer, ProjectionStats,
};
