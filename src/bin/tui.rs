use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use flash_log::listener::format_timestamp;
use flash_log::{AppendLog, FileRecordStream, FollowConfig, FollowTask, KindCounts, LogConfig};
use parking_lot::Mutex;
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Paragraph},
};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use std::{io, time::Duration};
use tracing_subscriber::EnvFilter;

/// Live dashboard for an order-event log.
#[derive(Parser, Debug)]
#[command(name = "log-top")]
struct Args {
    /// Log to watch.
    path: PathBuf,

    /// Send diagnostics here; the terminal is taken by the dashboard.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

// Helper to generate the ASCII Bar string
fn render_kind_bars(counts: &KindCounts) -> String {
    let mut out = String::new();
    let max = counts.iter().map(|(_, n)| n).max().unwrap_or(1) as f64;

    for (kind, n) in counts.iter() {
        let bar_len = ((n as f64 / max) * 30.0).ceil() as usize;
        out.push_str(&format!("{:<24} {:<30} {}\n", kind.as_str(), "█".repeat(bar_len), n));
    }
    if counts.unknown > 0 {
        out.push_str(&format!("{:<24} {:<30} {}\n", "(unknown)", "", counts.unknown));
    }
    out
}

fn human_bytes(n: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    if let Some(path) = &args.log_file {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with_writer(std::sync::Mutex::new(File::create(path)?))
            .with_ansi(false)
            .init();
    }

    // Shared state
    let log = Arc::new(AppendLog::open(&args.path, &LogConfig::reader())?);
    let counts = Arc::new(Mutex::new(KindCounts::default()));

    let mut stream = FileRecordStream::new(Arc::clone(&log));
    stream.register_listener(Arc::clone(&counts));
    let task = FollowTask::spawn(stream, FollowConfig::default().with_thread_name("log-top-follow"))?;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Run TUI Loop
    let mut last_records = 0;
    let mut last_bytes = 0;
    let mut last_time = Instant::now();
    let mut record_rate = 0.0;
    let mut byte_rate = 0.0;

    loop {
        // Handle input
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.code == KeyCode::Char('q') {
                    break;
                }
            }
        }

        // Calculate rates
        let now = Instant::now();
        let elapsed = now.duration_since(last_time).as_secs_f64();
        if elapsed >= 1.0 {
            let records = task.records();
            let bytes = log.size();
            record_rate = (records - last_records) as f64 / elapsed;
            byte_rate = bytes.saturating_sub(last_bytes) as f64 / elapsed;
            last_records = records;
            last_bytes = bytes;
            last_time = now;
        }

        let snapshot = counts.lock().clone();
        let follow_state = if task.is_finished() { "STOPPED (see log)" } else { "following" };

        terminal.draw(|f| {
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .margin(1)
                .constraints(
                    [
                        Constraint::Length(3),  // Header
                        Constraint::Min(10),    // Kinds
                        Constraint::Length(7),  // Stats
                    ]
                    .as_ref(),
                )
                .split(f.size());

            // 1. Header
            let header = Block::default().borders(Borders::ALL).title("FLASH-LOG Monitor");
            let title = Paragraph::new(format!("{} | Press 'q' to quit", args.path.display()))
                .block(header)
                .alignment(Alignment::Center)
                .style(Style::default().fg(Color::Cyan));
            f.render_widget(title, chunks[0]);

            // 2. Kinds
            let body_chunks = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(70), Constraint::Percentage(30)])
                .split(chunks[1]);

            let kinds_widget = Paragraph::new(render_kind_bars(&snapshot))
                .block(Block::default().borders(Borders::ALL).title("RECORDS BY KIND").style(Style::default().fg(Color::Green)));

            let last_ts = if snapshot.last_timestamp > 0 {
                format_timestamp(snapshot.last_timestamp)
            } else {
                "-".to_string()
            };
            let tail_text = format!(
                "Total: {}\nUnknown: {}\nLast record:\n{}\nFollow: {}",
                snapshot.total(),
                snapshot.unknown,
                last_ts,
                follow_state
            );
            let tail_widget = Paragraph::new(tail_text)
                .block(Block::default().borders(Borders::ALL).title("TAIL").style(Style::default().fg(Color::Magenta)));

            f.render_widget(kinds_widget, body_chunks[0]);
            f.render_widget(tail_widget, body_chunks[1]);

            // 3. Stats
            let rate_fmt = if record_rate > 1_000_000.0 {
                format!("{:.2} M", record_rate / 1_000_000.0)
            } else {
                format!("{:.1} k", record_rate / 1_000.0)
            };

            let committed = log.size();
            let capacity = log.capacity();
            let used_pct = if capacity > 0 { committed as f64 / capacity as f64 * 100.0 } else { 0.0 };

            let stats_text = format!(
                "Records: {} records/sec\nAppend Rate: {}/sec\nCommitted: {} / {} ({:.3}%)",
                rate_fmt,
                human_bytes(byte_rate),
                human_bytes(committed as f64),
                human_bytes(capacity as f64),
                used_pct
            );

            let stats_block = Paragraph::new(stats_text)
                .block(Block::default().borders(Borders::ALL).title("Log Telemetry"))
                .style(Style::default().fg(Color::Yellow));
            f.render_widget(stats_block, chunks[2]);
        })?;
    }

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;

    task.stop();
    Ok(())
}
