use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use thiserror::Error;

use mrs_pipeline::config::{ConfigError, RunConfig};
use mrs_pipeline::data::import::write_json;
use mrs_pipeline::fitting::{LcModelFitter, VoxelFit};
use mrs_pipeline::pipeline::controller::{ControllerState, ExecutionController, ManualAdjustment};
use mrs_pipeline::pipeline::graph::{build_pipeline, PipelineBuildError, PipelineGraph};
use mrs_pipeline::pipeline::worker::{PipelineWorker, RunSummary, WorkerCommand, WorkerEvent};
use mrs_pipeline::pipeline::Pipeline;
use mrs_pipeline::steps::StepRegistry;

#[derive(Parser)]
#[command(name = "mrs-pipeline", version, about = "MRS processing pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process one acquisition through a pipeline
    Run {
        /// Saved pipeline graph (JSON)
        #[arg(short, long, conflicts_with = "step")]
        graph: Option<PathBuf>,

        /// Build a linear pipeline from step kinds, in order
        #[arg(short, long)]
        step: Vec<String>,

        /// Metabolite data files or directories
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,

        /// Water reference file
        #[arg(short, long)]
        wref: Option<PathBuf>,

        /// Run configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output directory, overrides the configuration
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Wait for Enter before every transition
        #[arg(long)]
        step_mode: bool,

        /// Skip fitting even when LCModel is configured
        #[arg(long)]
        no_fit: bool,

        /// Save the pipeline as a graph file before running
        #[arg(long)]
        save_graph: Option<PathBuf>,

        /// Manual frequency shift applied before fitting (Hz)
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        shift_hz: f64,

        /// Manual zero-order phase applied before fitting (degrees)
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        phase0: f64,

        /// Manual first-order phase applied before fitting (degrees/ppm)
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        phase1: f64,
    },
    /// List the available step kinds and their default parameters
    Kinds {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Graph(#[from] PipelineBuildError),
    #[error("Unknown step kind {0}")]
    UnknownStep(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Run(String),
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Kinds { config } => list_kinds(config),
        Command::Run {
            graph,
            step,
            input,
            wref,
            config,
            output,
            step_mode,
            no_fit,
            save_graph,
            shift_hz,
            phase0,
            phase1,
        } => {
            let adjustment = ManualAdjustment {
                frequency_hz: shift_hz,
                phase0_deg: phase0,
                phase1_deg_per_ppm: phase1,
            };
            run(RunArgs {
                graph,
                steps: step,
                input,
                wref,
                config,
                output,
                step_mode,
                no_fit,
                save_graph,
                adjustment,
            })
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<RunConfig, CliError> {
    match path {
        Some(p) => Ok(RunConfig::load(&p)?),
        None => Ok(RunConfig::default()),
    }
}

fn list_kinds(config: Option<PathBuf>) -> Result<(), CliError> {
    let registry = load_config(config)?.registry();
    for kind in registry.kinds() {
        if let Some(step) = registry.create(kind) {
            println!("{:<24} {}", kind, step.parameters().summary());
        }
    }
    Ok(())
}

struct RunArgs {
    graph: Option<PathBuf>,
    steps: Vec<String>,
    input: Vec<PathBuf>,
    wref: Option<PathBuf>,
    config: Option<PathBuf>,
    output: Option<PathBuf>,
    step_mode: bool,
    no_fit: bool,
    save_graph: Option<PathBuf>,
    adjustment: ManualAdjustment,
}

fn linear_pipeline(registry: &StepRegistry, kinds: &[String]) -> Result<Pipeline, CliError> {
    let mut pipeline = Pipeline::new();
    for kind in kinds {
        let step = registry
            .create(kind)
            .ok_or_else(|| CliError::UnknownStep(kind.clone()))?;
        pipeline.push(step);
    }
    Ok(pipeline)
}

fn run(args: RunArgs) -> Result<(), CliError> {
    let config = load_config(args.config)?;
    let registry = config.registry();
    let pipeline = match &args.graph {
        Some(path) => build_pipeline(&PipelineGraph::load(path)?, &registry)?,
        None => linear_pipeline(&registry, &args.steps)?,
    };
    log::info!("Pipeline: {}", pipeline.describe());
    if let Some(path) = &args.save_graph {
        PipelineGraph::from_pipeline(&pipeline).save(path)?;
        log::info!("Saved pipeline graph to {}", path.display());
    }

    let output_dir = args.output.unwrap_or_else(|| config.output_dir.clone());
    fs::create_dir_all(&output_dir)?;

    let mut controller =
        ExecutionController::new(pipeline).with_ppm_reference(config.ppm_reference);
    match (&config.lcmodel, args.no_fit) {
        (Some(settings), false) => {
            let fitter = LcModelFitter::new(settings.clone(), Some(output_dir.join("lcmodel")));
            controller = controller.with_fitter(Box::new(fitter));
        }
        (Some(_), true) => log::info!("Fitting disabled on the command line"),
        (None, _) => log::info!("No LCModel configuration, fitting is skipped"),
    }

    let autorun = config.autorun && !args.step_mode;
    let worker = PipelineWorker::spawn(controller)?;
    worker.send(WorkerCommand::SetManualAdjustment(args.adjustment));
    worker.send(WorkerCommand::Start {
        inputs: args.input,
        wref: args.wref,
    });

    let mut autorun_sent = false;
    let mut outcome = Err(CliError::Run("Pipeline worker stopped unexpectedly".to_string()));
    for event in worker.events().iter() {
        match event {
            WorkerEvent::StateChanged(state @ (ControllerState::Running(_) | ControllerState::Fitting)) => {
                if !autorun {
                    wait_for_enter(state)?;
                    worker.send(WorkerCommand::Advance);
                } else if !autorun_sent {
                    worker.send(WorkerCommand::Autorun);
                    autorun_sent = true;
                }
            }
            WorkerEvent::StateChanged(state) => log::debug!("State: {}", state),
            WorkerEvent::StepCompleted { index, kind } => {
                log::info!("Step {} ({}) complete", index, kind);
            }
            WorkerEvent::StepDegraded {
                index,
                kind,
                warnings,
            } => {
                for w in warnings {
                    log::warn!("Step {} ({}): {}", index, kind, w);
                }
            }
            WorkerEvent::FitCompleted { fitted, failed } => {
                log::info!("Fitting: {} voxel(s) fitted, {} failed", fitted, failed);
            }
            WorkerEvent::Failed(message) | WorkerEvent::Rejected(message) => {
                outcome = Err(CliError::Run(message));
                break;
            }
            WorkerEvent::Finished(summary) => {
                outcome = write_outputs(&output_dir, &summary);
                break;
            }
        }
    }
    worker.shutdown();
    outcome
}

fn wait_for_enter(state: ControllerState) -> Result<(), CliError> {
    print!("[{}] press Enter to continue ", state);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(())
}

fn write_outputs(dir: &std::path::Path, summary: &RunSummary) -> Result<(), CliError> {
    if let Some(output) = &summary.output {
        let path = dir.join("processed.json");
        write_json(&path, output, &summary.header)?;
        log::info!("Wrote {} to {}", output.describe(), path.display());
    }
    summary.log.save_text(&dir.join("processing_log.txt"))?;
    summary.log.save_json(&dir.join("processing_log.json"))?;
    log::debug!("Step labels: {}", summary.labels.join(", "));
    if !summary.fits.is_empty() {
        fs::write(dir.join("fits.json"), serde_json::to_string_pretty(&summary.fits)?)?;
        report_fits(&summary.fits);
    }
    for entry in summary.log.degraded() {
        log::warn!("{} ran degraded: {}", entry.operation, entry.warnings.join("; "));
    }
    Ok(())
}

fn report_fits(fits: &[VoxelFit]) {
    for fit in fits {
        let [i, j, k] = fit.voxel;
        match fit.result() {
            Some(result) => {
                let summary: Vec<String> = result
                    .metabolites
                    .iter()
                    .map(|m| format!("{} {:.3} ({:.0}%)", m.name, m.concentration, m.sd_percent))
                    .collect();
                log::info!("Voxel {},{},{}: {}", i, j, k, summary.join(", "));
            }
            None => log::warn!("Voxel {},{},{}: fit failed", i, j, k),
        }
    }
}
