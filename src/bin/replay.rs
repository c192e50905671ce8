use clap::Parser;
use flash_log::{CsvSink, FileRecordStream, FollowConfig, FollowTask};
use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Print every record of an order-event log as CSV.
#[derive(Parser, Debug)]
#[command(name = "replay")]
struct Args {
    /// Log to read.
    path: PathBuf,

    /// Keep tailing the log until stdin is closed.
    #[arg(long)]
    follow: bool,

    /// Write CSV here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Idle poll interval while following.
    #[arg(long, default_value_t = 1)]
    poll_ms: u64,

    /// Pin the follow thread to the last core.
    #[arg(long)]
    pin: bool,
}

fn output(path: Option<&PathBuf>) -> io::Result<Box<dyn Write + Send>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout())),
    })
}

fn run(args: Args) -> flash_log::Result<()> {
    let out = output(args.output.as_ref()).map_err(|source| flash_log::Error::Construction {
        path: args.output.clone().unwrap_or_else(|| "<stdout>".into()),
        source,
    })?;
    let mut stream = FileRecordStream::open(&args.path)?;

    if !args.follow {
        stream.register_listener(CsvSink::new(out));
        let records = stream.replay()?;
        info!(records, bytes = stream.position(), "replay complete");
        return Ok(());
    }

    let config = FollowConfig::default()
        .with_poll_interval(Duration::from_millis(args.poll_ms))
        .with_pin_to_core(args.pin);
    let task = FollowTask::spawn_with_output(stream, out, config)
        .map_err(|source| flash_log::Error::Construction { path: args.path.clone(), source })?;

    // Ctrl-D (or a closed pipe) ends the tail.
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        if line.is_err() || task.is_finished() {
            break;
        }
    }

    let summary = task.stop();
    info!(records = summary.records, bytes = summary.stream.position(), "follow complete");
    match summary.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "replay failed");
            ExitCode::FAILURE
        }
    }
}
