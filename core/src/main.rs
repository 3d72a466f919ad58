//! CTRV FUSION: command-line driver for the lidar/radar unscented Kalman filter.
//!
//! - `run`: process a measurement feed CSV and write the estimate after every accepted packet.
//! - `simulate`: generate a synthetic CTRV measurement feed with ground truth.
//! - `create-config`: write the default tracker configuration to a TOML/JSON/YAML file.

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use ctrv_fusion::sim::{
    EstimateRecord, MeasurementRecord, NisSummary, ScenarioConfig, generate_scenario, rmse,
    run_tracker,
};
use ctrv_fusion::{SensorType, Tracker, TrackerConfig};

/// Command line arguments
#[derive(Parser)]
#[command(
    author,
    version,
    about = "Lidar/radar sensor fusion with a CTRV unscented Kalman filter."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(about = "Run the tracker over a measurement feed CSV")]
    Run(RunArgs),
    #[command(about = "Generate a synthetic measurement feed with ground truth")]
    Simulate(SimulateArgs),
    #[command(
        name = "create-config",
        about = "Write the default tracker configuration to a file"
    )]
    CreateConfig(CreateConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Measurement feed CSV (timestamp,sensor,z0,z1,z2[,gt_px,gt_py,gt_vx,gt_vy])
    #[arg(short, long)]
    input: PathBuf,
    /// Output CSV for the estimates
    #[arg(short, long)]
    output: PathBuf,
    /// Tracker configuration (TOML/JSON/YAML); defaults are used if omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Number of initial NIS samples per sensor left out of the summary
    #[arg(long, default_value_t = 0)]
    burn_in: usize,
}

#[derive(Args, Clone, Debug)]
struct SimulateArgs {
    /// Output CSV for the generated feed
    #[arg(short, long)]
    output: PathBuf,
    /// Number of packets
    #[arg(long, default_value_t = 500)]
    steps: usize,
    /// Interval between packets in seconds
    #[arg(long, default_value_t = 0.05)]
    dt: f64,
    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Output path; the extension selects the format
    #[arg(short, long, default_value = "tracker.toml")]
    output: PathBuf,
}

/// Route `log` records to stderr, or appended to `log_file`, each line prefixed with the local
/// time and level.
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level: log::LevelFilter = log_level
        .parse()
        .map_err(|_| format!("invalid log level '{}'", log_level))?;

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format(|buf, record| {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        writeln!(buf, "{} [{}] - {}", stamp, record.level(), record.args())
    });

    if let Some(log_path) = log_file {
        create_parent_dir(log_path)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init()?;
    Ok(())
}

fn create_parent_dir(path: &Path) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn run(args: &RunArgs) -> Result<(), Box<dyn Error>> {
    if !args.input.is_file() {
        return Err(format!("Input path '{}' is not a file.", args.input.display()).into());
    }
    let config = match &args.config {
        Some(path) => {
            info!("Loading tracker configuration from {}", path.display());
            TrackerConfig::from_file(path)?
        }
        None => TrackerConfig::default(),
    };
    let records = MeasurementRecord::from_csv(&args.input)?;
    info!("Read {} records from {}", records.len(), args.input.display());

    let mut tracker = Tracker::new(config)?;
    let estimates = run_tracker(&mut tracker, &records);
    if estimates.len() < records.len() {
        warn!(
            "{} of {} records were rejected",
            records.len() - estimates.len(),
            records.len()
        );
    }

    create_parent_dir(&args.output)?;
    EstimateRecord::to_csv(&estimates, &args.output)?;
    info!(
        "Wrote {} estimates to {}",
        estimates.len(),
        args.output.display()
    );

    for sensor in [SensorType::Lidar, SensorType::Radar] {
        let summary = NisSummary::from_estimates(&estimates, sensor, args.burn_in);
        info!(
            "{} NIS: {} samples, mean {:.3}, {:.1}% above 95% bound",
            sensor,
            summary.count,
            summary.mean,
            100.0 * summary.fraction_above_95
        );
    }
    match rmse(&estimates, &records) {
        Some([px, py, vx, vy]) => info!(
            "RMSE: px {:.4}, py {:.4}, vx {:.4}, vy {:.4}",
            px, py, vx, vy
        ),
        None => info!("No ground truth in feed, RMSE not computed"),
    }
    Ok(())
}

fn simulate(args: &SimulateArgs) -> Result<(), Box<dyn Error>> {
    let scenario = ScenarioConfig {
        steps: args.steps,
        dt: args.dt,
        seed: args.seed,
        ..ScenarioConfig::default()
    };
    let records = generate_scenario(&scenario)?;
    create_parent_dir(&args.output)?;
    MeasurementRecord::to_csv(&records, &args.output)?;
    info!(
        "Wrote {} simulated records to {}",
        records.len(),
        args.output.display()
    );
    Ok(())
}

fn create_config(args: &CreateConfigArgs) -> Result<(), Box<dyn Error>> {
    create_parent_dir(&args.output)?;
    TrackerConfig::default().to_file(&args.output)?;
    info!("Wrote default configuration to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;
    match &cli.command {
        Command::Run(args) => {
            info!("Running tracker with input: {}", args.input.display());
            run(args)
        }
        Command::Simulate(args) => simulate(args),
        Command::CreateConfig(args) => create_config(args),
    }
}
