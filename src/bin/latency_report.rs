use clap::Parser;
use flash_log::record::{fixed, timestamp_now, NewOrderBody, OrderIdentifier, OrderType, Side, TimeInForce};
use flash_log::{encode_record, AppendLog, LogConfig, RecordKind};
use hdrhistogram::Histogram;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Measure the latency of appending order records to a log.
#[derive(Parser, Debug)]
#[command(name = "latency-report")]
struct Args {
    /// Records appended per thread.
    #[arg(long, default_value_t = 1_000_000)]
    records: u64,

    /// Concurrent writer threads.
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Log to write (removed afterwards). Defaults to a file in the temp dir.
    #[arg(long)]
    path: Option<PathBuf>,
}

fn order(local_id: u32) -> NewOrderBody {
    NewOrderBody {
        esi: 1,
        market: *b"XNAS",
        oid: OrderIdentifier { local_account: 1, local_id, session: fixed("BENCH") },
        client_order_id: fixed("LATENCY"),
        price: 10_000_000 + u64::from(local_id % 100),
        size: 100,
        side: if local_id % 2 == 0 { Side::Buy } else { Side::Sell },
        tif: TimeInForce::Day,
        order_type: OrderType::Limit,
        user_data: 0,
    }
}

fn run_writer(log: &AppendLog, records: u64, thread_id: u64) -> (Histogram<u64>, Duration) {
    let mut histogram = Histogram::<u64>::new_with_bounds(1, 1_000_000, 3).unwrap();
    let mut total = Duration::ZERO;

    for i in 0..records {
        let image = encode_record(RecordKind::OrderSent, timestamp_now(), &order((thread_id * records + i) as u32));

        // Critical measurement section
        let start = Instant::now();
        std::hint::black_box(log.write(&image)).unwrap();
        let elapsed = start.elapsed();

        histogram.record(elapsed.as_nanos() as u64).unwrap_or(());
        total += elapsed;
    }
    (histogram, total)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();
    let path = args
        .path
        .unwrap_or_else(|| std::env::temp_dir().join(format!("flash-log-latency-{}.log", std::process::id())));

    println!("Preparing Append Latency Benchmark...");
    let log = Arc::new(AppendLog::open(&path, &LogConfig::default()).unwrap());

    println!("Running {} records x {} threads...", args.records, args.threads);

    let handles: Vec<_> = (0..args.threads as u64)
        .map(|t| {
            let log = Arc::clone(&log);
            let records = args.records;
            thread::spawn(move || run_writer(&log, records, t))
        })
        .collect();

    let mut histogram = Histogram::<u64>::new_with_bounds(1, 1_000_000, 3).unwrap();
    let mut total_duration = Duration::ZERO;
    for handle in handles {
        let (h, d) = handle.join().unwrap();
        histogram.add(&h).unwrap();
        total_duration = total_duration.max(d);
    }

    let ops = args.records * args.threads as u64;
    println!("\n=== Append Latency Report (ns) ===");
    println!("Total Ops:  {}", ops);
    println!("Bytes:      {}", log.size());
    println!("Throughput: {:.2} ops/sec", ops as f64 / total_duration.as_secs_f64());
    println!("---------------------------");
    println!("Min:    {:6} ns", histogram.min());
    println!("P50:    {:6} ns", histogram.value_at_quantile(0.50));
    println!("P90:    {:6} ns", histogram.value_at_quantile(0.90));
    println!("P99:    {:6} ns", histogram.value_at_quantile(0.99));
    println!("P99.9:  {:6} ns", histogram.value_at_quantile(0.999));
    println!("P99.99: {:6} ns", histogram.value_at_quantile(0.9999));
    println!("Max:    {:6} ns", histogram.max());
    println!("---------------------------");

    println!("\nDistribution:");
    for v in histogram.iter_log(100, 2.0) {
        let count = v.count_since_last_iteration();
        if count > 0 {
            println!("<= {:8} ns: {:10} count", v.value_iterated_to(), count);
        }
    }

    match Arc::try_unwrap(log) {
        Ok(log) => log.close().unwrap(),
        Err(_) => unreachable!("writer threads joined"),
    }
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(flash_log::offset_path(&path));
}
