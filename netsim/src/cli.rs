//! Parses the command line arguments and runs the chosen simulation.
//!
//! Running the line of routers with logs written to `./logs`:
//!
//! ```cargo run -- rip-line --log```

use crate::simulations::{self, Settings};
use clap::{Parser, ValueEnum};
use std::{
    fs::{create_dir_all, OpenOptions},
    sync::Arc,
    time::Duration,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Stores the different command line arguments.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// The simulation to run
    #[arg(value_enum)]
    simulation: Simulation,
    /// Write JSON logs to a file under ./logs instead of the terminal
    #[arg(short, long)]
    log: bool,
    /// Include debug events in the logs
    #[arg(short, long)]
    verbose: bool,
    /// Give up on the simulation after this many milliseconds
    #[arg(long, default_value_t = 30_000)]
    duration_ms: u64,
    /// Milliseconds between two routing advertisements
    #[arg(long, default_value_t = 1_000)]
    advertise_ms: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Simulation {
    /// Two hosts bounce a TTL until it runs out
    PingPong,
    /// A message crosses a line of three routers
    RipLine,
    /// Two bare kernels count up together
    Counting,
}

/// Parses the command line, sets up logging and runs the simulation until
/// it finishes or Ctrl-C is pressed.
pub async fn initialize_from_arguments() -> anyhow::Result<()> {
    let args = Args::parse();
    initialize_logging(args.log, args.verbose)?;
    let settings = Settings {
        time_limit: Duration::from_millis(args.duration_ms),
        advertise_period: Duration::from_millis(args.advertise_ms),
    };
    tokio::select! {
        result = run(args.simulation, settings) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted");
            Ok(())
        }
    }
}

async fn run(simulation: Simulation, settings: Settings) -> anyhow::Result<()> {
    match simulation {
        Simulation::PingPong => {
            simulations::ping_pong(settings).await?;
            println!("PingPong completed");
        }
        Simulation::RipLine => {
            let message = simulations::rip_line(settings).await?;
            println!("Captured {}", message);
        }
        Simulation::Counting => {
            let highest = simulations::counting(settings).await?;
            println!("Counted to {}", highest);
        }
    }
    Ok(())
}

/// Installs the global subscriber. Only should be called once. With `to_file`
/// the events are written as JSON to a new file in `./logs`, otherwise they
/// go to stderr. `RUST_LOG` overrides the level.
fn initialize_logging(to_file: bool, verbose: bool) -> anyhow::Result<()> {
    let level = match verbose {
        true => LevelFilter::DEBUG,
        false => LevelFilter::INFO,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    if !to_file {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        return Ok(());
    }

    let main_path = "./logs";
    create_dir_all(main_path)?;
    let file_path = format!(
        "{}/debug-{}.log",
        main_path,
        chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
    );
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(file_path)?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(Arc::new(file))
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
