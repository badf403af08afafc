use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use clap::error::ErrorKind;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use photosorter::bridge::{self, BridgeMessage, JsonLines};
use photosorter::config::{DEFAULTS, Device, Linkage, PipelineParams, Pooling, Preprocess};
use photosorter::core::manifest::{Manifest, manifest_path_for_input};
use photosorter::core::{Pipeline, PipelineOutcome, StepInfo, ThumbnailEmbedder};

#[derive(Parser, Debug)]
#[command(
    name = "photosorter",
    version,
    about = "Reorder travel photos so similar shots sit together"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Group a folder of photos and write the ordered manifest
    Sort {
        /// Directory containing the photos
        #[arg(value_name = "INPUT_DIR")]
        input_dir: PathBuf,
        #[command(flatten)]
        options: SortOptions,
    },

    /// Print the manifest written by a previous sort
    Show {
        /// Directory that was sorted
        #[arg(value_name = "INPUT_DIR")]
        input_dir: PathBuf,
    },

    /// JSON Lines interface for the desktop app
    Bridge {
        #[command(subcommand)]
        command: BridgeCmd,
    },
}

#[derive(Subcommand, Debug)]
enum BridgeCmd {
    /// Run the full pipeline, streaming progress as JSON Lines
    Run {
        /// Directory containing the photos
        #[arg(long, value_name = "DIR")]
        input_dir: PathBuf,
        /// App settings as a JSON object; replaces the option flags
        #[arg(long, value_name = "JSON")]
        settings: Option<String>,
        #[command(flatten)]
        options: SortOptions,
    },

    /// Report whether a manifest already exists
    CheckManifest {
        /// Directory to check
        #[arg(long, value_name = "DIR")]
        input_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct SortOptions {
    /// Compute device: auto, cpu, mps or cuda
    #[arg(long, default_value_t = DEFAULTS.device)]
    device: Device,
    /// Images embedded per batch
    #[arg(long, default_value_t = DEFAULTS.batch_size)]
    batch_size: usize,
    /// Embedding pooling: cls, avg or cls+avg
    #[arg(long, default_value_t = DEFAULTS.pooling)]
    pooling: Pooling,
    /// Square preprocessing: letterbox or timm
    #[arg(long, default_value_t = DEFAULTS.preprocess)]
    preprocess: Preprocess,
    /// Cosine distance at or below which clusters merge, in (0, 2]
    #[arg(long, default_value_t = DEFAULTS.distance_threshold)]
    distance_threshold: f64,
    /// Extra distance per step of capture-order separation
    #[arg(long, default_value_t = DEFAULTS.temporal_weight)]
    temporal_weight: f64,
    /// Cluster linkage: average, complete or single
    #[arg(long, default_value_t = DEFAULTS.linkage)]
    linkage: Linkage,
}

impl SortOptions {
    fn into_params(self, input_dir: PathBuf) -> PipelineParams {
        PipelineParams::new(input_dir)
            .with_device(self.device)
            .with_batch_size(self.batch_size)
            .with_pooling(self.pooling)
            .with_preprocess(self.preprocess)
            .with_distance_threshold(self.distance_threshold)
            .with_temporal_weight(self.temporal_weight)
            .with_linkage(self.linkage)
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    init_logging();

    let result = match cli.command {
        Commands::Sort { input_dir, options } => sort(input_dir, options),
        Commands::Show { input_dir } => show(&input_dir),
        Commands::Bridge { command } => match command {
            BridgeCmd::Run {
                input_dir,
                settings,
                options,
            } => bridge_run(input_dir, settings.as_deref(), options),
            BridgeCmd::CheckManifest { input_dir } => {
                let mut out = JsonLines::new(io::stdout().lock());
                bridge::check_manifest(&resolve_dir(input_dir), &mut out)
                    .map(|_| ())
                    .context("Failed to write to stdout")
            }
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so stdout stays free for results and JSON Lines.
fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<8} {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();
}

fn resolve_dir(dir: PathBuf) -> PathBuf {
    fs::canonicalize(&dir).unwrap_or(dir)
}

fn sort(input_dir: PathBuf, options: SortOptions) -> Result<()> {
    let params = options.into_params(resolve_dir(input_dir)).validated()?;
    println!("▶ Sorting photos in: {}", params.input_dir.display());

    let bar = ProgressBar::new(0);
    bar.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
    )?);
    bar.enable_steady_tick(Duration::from_millis(100));

    let start = Instant::now();
    let pipeline = Pipeline::new(params, ThumbnailEmbedder::new());
    let outcome = pipeline.run(&mut |info: StepInfo| {
        if info.total > 0 {
            bar.set_length(info.total as u64);
            bar.set_position(info.processed as u64);
        }
        bar.set_message(format!("{}: {}", info.step, info.detail));
    });
    bar.finish_and_clear();
    let outcome = outcome.context("Sorting failed")?;

    print_summary(&outcome);
    println!("⏱ Finished in {:.2?}", start.elapsed());
    Ok(())
}

fn print_summary(outcome: &PipelineOutcome) {
    println!(
        "✅ Ordered {} photos into {} cluster(s)",
        outcome.total_ordered(),
        outcome.n_clusters
    );
    if outcome.skipped > 0 {
        println!("⚠ Skipped {} unreadable image(s)", outcome.skipped);
    }
    println!("Manifest written to {}", outcome.manifest_path.display());
}

fn show(input_dir: &Path) -> Result<()> {
    let manifest_path = manifest_path_for_input(input_dir);
    let manifest = Manifest::load(&manifest_path)
        .with_context(|| format!("No readable manifest at {}", manifest_path.display()))?;

    println!(
        "▶ {} photos in {} cluster(s) from {}",
        manifest.total,
        manifest.clusters.len(),
        manifest.input_dir
    );
    for (i, cluster) in manifest.clusters.iter().enumerate() {
        println!(" Cluster {} ({} photos):", i + 1, cluster.count);
        for photo in &cluster.photos {
            println!("   {:>4} ▶ {}", photo.position, photo.filename);
        }
    }
    Ok(())
}

fn bridge_run(input_dir: PathBuf, settings: Option<&str>, options: SortOptions) -> Result<()> {
    let input_dir = resolve_dir(input_dir);
    let mut out = JsonLines::new(io::stdout().lock());

    let params = match settings {
        None => options.into_params(input_dir),
        Some(raw) => {
            let parsed = serde_json::from_str::<Map<String, Value>>(raw)
                .context("--settings must be a JSON object")
                .and_then(|map| Ok(bridge::params_from_gui(input_dir, &map)?));
            match parsed {
                Ok(params) => params,
                Err(e) => {
                    out.emit(&BridgeMessage::Error {
                        message: format!("{:#}", e),
                    })?;
                    return Err(e);
                }
            }
        }
    };

    let pipeline = Pipeline::new(params, ThumbnailEmbedder::new());
    // The error line has already been written to stdout.
    bridge::run_pipeline(&pipeline, &mut out).context("Pipeline failed")?;
    Ok(())
}
