//! control-vectors CLI: prompt dataset synthesis and direction analysis

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use control_vectors::{
    export_control_vectors, AnalyzerConfig, CandleBackend, CpuBackend, DirectionAnalyzer,
    DirectionMatrices, HiddenStateSamples, LayerSkip, NumericBackend, PromptDataset,
    RegularizationPolicy, SafetensorsExporter, SampleStore, TracingObserver,
};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "control-vectors")]
#[command(about = "Control vector direction analysis")]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate paired prompt datasets for every class
    Prompts(PromptsArgs),
    /// Find per-layer directions in cached hidden-state samples and export them
    Analyze(AnalyzeArgs),
}

#[derive(Args)]
struct PromptsArgs {
    /// JSON file with "pre" and "post" prompt stems
    #[arg(long)]
    stems: PathBuf,

    /// JSON file with class names and continuation tuples
    #[arg(long)]
    continuations: PathBuf,

    /// Text file with one writing prompt per line
    #[arg(long)]
    writing_prompts: PathBuf,

    /// Samples to generate per class
    #[arg(short, long, default_value_t = 1000)]
    num_samples: usize,

    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Output JSON file
    #[arg(short, long, default_value = "prompts.json")]
    output: PathBuf,
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Hidden-state sample caches (safetensors); several runs are merged
    #[arg(short, long, required = true, num_args = 1..)]
    samples: Vec<PathBuf>,

    /// Output prefix for control vectors and the layer summary file
    #[arg(short, long, default_value = "outputs/run")]
    output: PathBuf,

    /// Model name recorded in the exported files
    #[arg(long, default_value = "llama")]
    model_hint: String,

    /// Names of the non-baseline classes, in sample order
    #[arg(long, value_delimiter = ',', required = true)]
    class_names: Vec<String>,

    /// JSON analyzer configuration (flags given here override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Initial layers to skip: a count, or a fraction in (0, 1)
    #[arg(long)]
    skip_begin_layers: Option<LayerSkip>,

    /// Final layers to skip: a count, or a fraction in (0, 1)
    #[arg(long)]
    skip_end_layers: Option<LayerSkip>,

    /// Minimum discriminant ratio for a candidate, and minimum improvement when composing
    #[arg(long)]
    discriminant_ratio_tolerance: Option<f64>,

    /// Balancedness penalty exponent (0 disables it)
    #[arg(long)]
    balancedness_score_exponent: Option<f64>,

    /// Soft-threshold factor in standard deviations (0 disables it)
    #[arg(long, conflicts_with = "midpoint_centering")]
    regularisation_factor: Option<f64>,

    /// Re-centre class means on their midpoint and export the midpoint separately
    #[arg(long)]
    midpoint_centering: bool,

    /// Analyse layers in parallel
    #[arg(long)]
    parallel: bool,

    /// Force CPU mode (ndarray backend, no candle device)
    #[arg(long)]
    cpu: bool,
}

impl AnalyzeArgs {
    fn analyzer_config(&self) -> Result<AnalyzerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))?
            }
            None => AnalyzerConfig::default(),
        };

        if let Some(skip) = self.skip_begin_layers {
            config.skip_begin_layers = skip;
        }
        if let Some(skip) = self.skip_end_layers {
            config.skip_end_layers = skip;
        }
        if let Some(tolerance) = self.discriminant_ratio_tolerance {
            config.discriminant_ratio_tolerance = tolerance;
        }
        if let Some(exponent) = self.balancedness_score_exponent {
            config.balancedness_score_exponent = exponent;
        }
        if let Some(factor) = self.regularisation_factor {
            config.regularization = RegularizationPolicy::SoftThreshold { factor };
        }
        if self.midpoint_centering {
            config.regularization = RegularizationPolicy::MidpointCentering;
        }
        if self.parallel {
            config.parallel = true;
        }

        config.validate()?;
        Ok(config)
    }

    fn backend(&self) -> Box<dyn NumericBackend> {
        if self.cpu {
            Box::new(CpuBackend)
        } else {
            Box::new(CandleBackend::with_device(None))
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Prompts(args) => run_prompts(&args),
        Command::Analyze(args) => run_analyze(&args),
    }
}

fn run_prompts(args: &PromptsArgs) -> Result<()> {
    let dataset = PromptDataset::load(
        &args.stems,
        &args.continuations,
        &args.writing_prompts,
        args.num_samples,
        args.seed,
    )?;

    let classes: Vec<serde_json::Value> = dataset
        .class_names()
        .iter()
        .enumerate()
        .map(|(i, name)| {
            serde_json::json!({
                "name": name,
                "samples": dataset.samples(i).unwrap_or_default(),
            })
        })
        .collect();

    create_parent_dir(&args.output)?;
    std::fs::write(
        &args.output,
        serde_json::to_string_pretty(&serde_json::json!({ "classes": classes }))?,
    )
    .with_context(|| format!("Failed to write {}", args.output.display()))?;
    info!(
        "Saved {} prompts to {}",
        dataset.total_samples(),
        args.output.display()
    );
    Ok(())
}

fn run_analyze(args: &AnalyzeArgs) -> Result<()> {
    let config = args.analyzer_config()?;
    info!("Config: {}", serde_json::to_string(&config)?);

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone())?;

    let analyzer = DirectionAnalyzer::new(config)?
        .with_backend(args.backend())
        .with_cancellation(cancel);
    let mut observer = TracingObserver::new(!analyzer.config().regularization.is_identity());

    let mut merged: Option<DirectionMatrices> = None;
    let mut summaries = Vec::new();
    let mut num_layers = 0;

    for path in &args.samples {
        let samples = HiddenStateSamples::load(path)?;
        anyhow::ensure!(
            samples.num_dataset_types() == args.class_names.len() + 1,
            "{} holds {} classes besides the baseline, but {} class names were given",
            path.display(),
            samples.num_dataset_types() - 1,
            args.class_names.len()
        );
        num_layers = samples.num_layers();

        let report = analyzer.analyze(&samples, &mut observer)?;
        summaries.extend(report.summaries);
        match merged.as_mut() {
            Some(directions) => directions.merge(&report.directions)?,
            None => merged = Some(report.directions),
        }
    }

    let directions = merged.ok_or_else(|| anyhow::anyhow!("No sample files given"))?;

    create_parent_dir(&args.output)?;
    let written = export_control_vectors(
        &SafetensorsExporter,
        &directions,
        &args.class_names,
        &args.model_hint,
        num_layers,
        &args.output,
    )?;
    if let Some(debias) = &directions.debias {
        if debias.is_empty() {
            warn!("Midpoint centering produced no de-bias directions");
        } else {
            let debias_set = DirectionMatrices {
                classes: vec![debias.clone()],
                debias: None,
            };
            export_control_vectors(
                &SafetensorsExporter,
                &debias_set,
                &["debias".to_string()],
                &args.model_hint,
                num_layers,
                &args.output,
            )?;
        }
    }

    let mut summary_name = args.output.as_os_str().to_owned();
    summary_name.push("_layer_summaries.json");
    let summary_path = PathBuf::from(summary_name);
    std::fs::write(&summary_path, serde_json::to_string_pretty(&summaries)?)
        .with_context(|| format!("Failed to write {}", summary_path.display()))?;

    info!(
        "Wrote {} control vector files and {}",
        written.len(),
        summary_path.display()
    );
    Ok(())
}

/// Cancel `token` on Ctrl+C; the analysis stops before its next layer
fn spawn_ctrl_c_handler(token: CancellationToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start signal runtime")?;
    std::thread::spawn(move || {
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received Ctrl+C, stopping before the next layer");
                token.cancel();
            }
        });
    });
    Ok(())
}

fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}
