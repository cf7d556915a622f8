//! `millstream` command line: inspect, number and reverse programs offline, or
//! stream them to a controller.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use millstream::communication::{available_ports, open_transport};
use millstream::config::{Config, load_config};
use millstream::file_manager::FileManager;
use millstream::shared::{OffsetId, Point, add_line_numbers, clean_gcode_text, parse, reverse};
use millstream::streaming::{ChannelReporter, MachineHost, OperatorReport, SessionOutcome};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Parser, Debug)]
#[command(name = "millstream", version, about = "G-code streamer for GRBL-class motion controllers.")]
struct Cli {
    /// Path to a TOML config file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More logging; repeat for trace output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a program and print one JSON record per line
    Check { file: PathBuf },
    /// Print the cleaned, numbered program
    Number { file: PathBuf },
    /// Print the program reversed from a line, starting at a machine position
    Reverse {
        file: PathBuf,
        #[arg(long)]
        from_line: u32,
        /// Machine position as x,y,z
        #[arg(long, value_parser = parse_point)]
        at: Point,
    },
    /// Stream a program to the configured controller
    Stream {
        file: PathBuf,
        /// Use the built-in controller emulator instead of real hardware
        #[arg(long)]
        simulate: bool,
    },
    /// List serial ports
    Ports,
}

fn parse_point(s: &str) -> Result<Point, String> {
    let values: Vec<f64> = s
        .split(',')
        .map(|v| v.trim().parse::<f64>().map_err(|e| format!("invalid coordinate '{v}': {e}")))
        .collect::<Result<_, _>>()?;
    match values.as_slice() {
        [x, y, z] => Ok(Point::new(*x, *y, *z)),
        _ => Err(format!("expected x,y,z but got '{s}'")),
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::INFO,
        (false, 1) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).with_writer(std::io::stderr).init();
}

fn config_for(path: Option<&PathBuf>) -> Result<Config, BoxError> {
    match path {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            Ok(load_config(path)?)
        }
        None => Ok(Config::default()),
    }
}

async fn numbered_program(file: &Path) -> Result<Vec<String>, BoxError> {
    let text = FileManager::default().load_program(file).await?;
    Ok(add_line_numbers(&clean_gcode_text(&text)).lines().map(str::to_string).collect())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    let config = config_for(cli.config.as_ref())?;
    let offsets = config.offsets.table()?;
    let active = config.offsets.active_offset()?;

    match cli.command {
        Command::Check { file } => {
            let lines = numbered_program(&file).await?;
            for record in parse(&lines, &offsets, active) {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Command::Number { file } => {
            for line in numbered_program(&file).await? {
                println!("{line}");
            }
        }
        Command::Reverse { file, from_line, at } => {
            let lines = numbered_program(&file).await?;
            let records = parse(&lines, &offsets, active);
            for line in reverse(&records, from_line, &at, &offsets)? {
                println!("{line}");
            }
        }
        Command::Stream { file, simulate } => stream(&config, &file, simulate, active).await?,
        Command::Ports => {
            for port in available_ports() {
                println!("{port}");
            }
        }
    }
    Ok(())
}

async fn stream(config: &Config, file: &Path, simulate: bool, active: OffsetId) -> Result<(), BoxError> {
    let text = FileManager::default().load_program(file).await?;
    let transport = open_transport(config, simulate);
    let (reporter, mut reports) = ChannelReporter::new();
    let (host, handle) = MachineHost::new(transport, config, Box::new(reporter))?;
    let host_task = tokio::spawn(host.run());

    handle.connect().await?;
    handle.wait_for(|s| s.connected).await?;
    let lines = handle.load(text).await?;
    tracing::info!("Streaming {} lines from {} ({})", lines, file.display(), active.code());
    let session = handle.start().await?;

    let snapshots = handle.snapshots();
    tokio::pin!(snapshots);
    let mut last_acked = 0;
    let outcome = loop {
        tokio::select! {
            snapshot = snapshots.next() => {
                let Some(snapshot) = snapshot else { break None };
                if let Some(view) = snapshot.session.as_ref().filter(|v| v.id == session) {
                    if view.acknowledged_count / 50 != last_acked / 50 {
                        tracing::info!("{}/{} lines acknowledged", view.acknowledged_count, view.total_lines);
                    }
                    last_acked = view.acknowledged_count;
                }
                if let Some(finished) = snapshot.last_finished.filter(|f| f.id == session) {
                    break Some(finished.outcome);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, stopping session");
                handle.stop().await?;
            }
        }
    };

    while let Ok(report) = reports.try_recv() {
        match report {
            OperatorReport::Error(e) => {
                eprintln!("error near line {}: {} ({})", e.estimated_line_number, e.message, e.raw)
            }
            OperatorReport::Alarm(a) => eprintln!("alarm: {}", a.message),
        }
    }

    handle.disconnect().await?;
    handle.shutdown().await;
    if let Err(e) = host_task.await {
        tracing::error!("Machine host task failed: {}", e);
    }

    match outcome {
        Some(SessionOutcome::Completed) => {
            tracing::info!("Program complete");
            Ok(())
        }
        Some(outcome) => Err(format!("session ended: {outcome:?}").into()),
        None => Err("machine host stopped unexpectedly".into()),
    }
}
