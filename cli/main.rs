#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

// ========================================================================================
//
//                                THE ROADRUNNER CLI
//
// ========================================================================================
//
// Brings the compute backends up once, builds a pass from a TOML description plus
// command-line overrides, and runs it with or without an overlapped CF server. The
// backends are finalized from a process-exit hook registered on first bring-up.

use clap::{Args, CommandFactory, Parser, Subcommand};
use ndarray::Array2;
use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use roadrunner::backend::{
    self, BACKEND_ENV, Backend, BackendInitResult, backend_from_env, parse_backend_selector,
    request_list_for,
};
use roadrunner::config::PassConfig;
use roadrunner::driver::{IterationDriver, NoopHooks, PassSettings};
use roadrunner::engine::{CpuGridder, KernelCache};
use roadrunner::progress::ConsoleProgress;
use roadrunner::source::synthetic_observation;
use roadrunner::staging::run_overlapped_pass;
use roadrunner::types::{DataColumn, ImagingMode, PassSummary, Visibility};

type CliResult = Result<(), Box<dyn Error + Send + Sync>>;

#[derive(Parser)]
#[command(
    name = "roadrunner",
    version,
    about = "Visibility gridding with overlapped convolution-function staging",
    long_about = "Runs a gridding pass over a (synthetic) visibility set, staging \
                 convolution-function kernels on a dedicated thread while gridding proceeds."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one gridding pass
    #[command(about = "Run one gridding pass")]
    Run(RunArgs),

    /// Bring the compute backends up and report what initialized
    #[command(about = "Report compute backend bring-up")]
    Backends {
        /// Backend to select instead of the RR_BACKEND / HPGDEVICE environment value
        #[arg(long, value_name = "NAME")]
        backend: Option<String>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Pass description (.toml). Defaults are used for anything it omits.
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Backend to select instead of the RR_BACKEND / HPGDEVICE environment value
    #[arg(long, value_name = "NAME")]
    backend: Option<String>,

    /// Imaging mode: weight, psf, snrpsf, residual or predict
    #[arg(long, value_parser = ImagingMode::parse)]
    mode: Option<ImagingMode>,

    /// Data column: data, corrected or model
    #[arg(long, value_parser = parse_column)]
    column: Option<DataColumn>,

    /// Stage kernels inline instead of on a CF server thread
    #[arg(long)]
    no_overlap: bool,

    /// Use one kernel set for every spectral window
    #[arg(long)]
    single_kernel_set: bool,

    /// Grid size in cells along each axis
    #[arg(long, value_name = "N")]
    grid_size: Option<usize>,

    /// Write the resolved configuration to this path before running
    #[arg(long, value_name = "PATH")]
    save_config: Option<PathBuf>,
}

fn parse_column(value: &str) -> Result<DataColumn, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "data" | "observed" => Ok(DataColumn::Observed),
        "corrected" => Ok(DataColumn::Corrected),
        "model" => Ok(DataColumn::Model),
        other => Err(format!(
            "Unknown data column '{other}'. Expected one of: data, corrected, model."
        )),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Backends { backend }) => report_backends(backend),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn select_backend(flag: Option<String>) -> Result<Backend, Box<dyn Error + Send + Sync>> {
    match flag {
        Some(name) => Ok(parse_backend_selector("--backend", Some(name.as_str()))?),
        None => Ok(backend_from_env()?),
    }
}

fn bring_up(flag: Option<String>) -> Result<BackendInitResult, Box<dyn Error + Send + Sync>> {
    let selected = select_backend(flag)?;
    let requested = request_list_for(selected);
    eprintln!(
        "> Requesting backends: {}",
        requested
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(backend::request_backends(&requested))
}

fn report_backends(flag: Option<String>) -> CliResult {
    let result = bring_up(flag)?;
    for backend in Backend::ALL {
        let state = if backend::is_backend_initialized(backend) {
            "initialized"
        } else if result.requested.contains(&backend) {
            "FAILED"
        } else {
            "not requested"
        };
        eprintln!("> {backend:<8} {state}");
    }
    eprintln!(
        "> Gridder library: {}",
        if result.gridder_ready { "ready" } else { "unavailable" }
    );
    if result.ready_for_gridding() {
        Ok(())
    } else {
        Err(format!(
            "backends did not come up as requested; set {BACKEND_ENV} to one of the initialized backends"
        )
        .into())
    }
}

fn run(args: RunArgs) -> CliResult {
    let session_start = Instant::now();

    let result = bring_up(args.backend.clone())?;
    if !result.ready_for_gridding() {
        return Err(format!(
            "backend initialization failed for [{}]",
            result
                .failed()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        )
        .into());
    }

    let mut config = match &args.config {
        Some(path) => PassConfig::load(path)?,
        None => PassConfig::default(),
    };
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if args.column.is_some() {
        config.column = args.column;
    }
    if args.no_overlap {
        config.overlap = false;
    }
    if args.single_kernel_set {
        config.single_kernel_set = true;
    }
    if let Some(n) = args.grid_size {
        config.grid_size = n;
    }
    config.validate()?;
    if let Some(path) = &args.save_config {
        config.save(path)?;
        eprintln!("> Wrote resolved configuration to {}", path.display());
    }

    eprintln!(
        "> Mode: {}. Kernel staging: {}.",
        config.mode,
        if config.overlap { "overlapped" } else { "inline" }
    );

    let mut source = synthetic_observation(&config.observation, &config.windows);
    let mut engine = CpuGridder::new(config.grid_size, config.cell_lambda);
    if config.mode.is_predict() {
        // A flat grid is the transform of a unit point source at the phase centre.
        engine.set_grid(Array2::from_elem(
            (config.grid_size, config.grid_size),
            Visibility::ONE,
        ))?;
    }

    let settings = PassSettings {
        mode: config.mode,
        column: config.column,
        is_root: config.is_root,
    };
    let mut driver = IterationDriver::new(settings, ConsoleProgress::new("Gridding..."));
    let kernels = KernelCache::new(&config.windows, config.support, config.single_kernel_set);

    let summary = if config.overlap {
        let (summary, staging) =
            run_overlapped_pass(&mut driver, &mut source, &mut engine, kernels, &config.windows)?;
        eprintln!(
            "> CF server: {} kernel sets published over {} chunks.",
            staging.sets_published, staging.chunks_served
        );
        report_grid(&engine);
        summary
    } else {
        let mut engine = engine.with_inline_kernels(kernels);
        let summary = driver.run_pass(&mut source, &mut engine, &mut NoopHooks)?;
        report_grid(&engine);
        summary
    };

    report_pass(&summary);
    eprintln!(
        "> Total runtime: {:.3}s",
        session_start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn report_pass(summary: &PassSummary) {
    eprintln!(
        "> Gridded {} rows in {} row-buffers.",
        summary.rows, summary.row_buffers
    );
    eprintln!(
        "> Gridding time: {:.3}s. Data rate: {:.0} rows/s.",
        summary.gridding_seconds,
        summary.data_rate()
    );
}

fn report_grid(engine: &CpuGridder) {
    let peak = engine
        .grid()
        .iter()
        .map(|v| v.norm_sqr())
        .fold(0.0f32, f32::max)
        .sqrt();
    eprintln!(
        "> Sum of weights: {:.1}. Peak grid amplitude: {peak:.4}",
        engine.sum_of_weights()
    );
}
