//! Determinism Test - Golden Master verification.
//!
//! Verifies that a log written from the same event sequence replays to the
//! same CSV across runs, across rewinds, and across a close and reopen.

use flash_log::record::{
    encode_record, fixed, NewOrderBody, OrderAckBody, OrderCancelBody, OrderFillBody, OrderIdentifier, OrderType,
    RecordKind, Side, TimeInForce, TimestampBody,
};
use flash_log::{offset_path, AppendLog, CsvSink, FileRecordStream, LogConfig, RecordStream, ReplayListener};
use parking_lot::Mutex;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

const CAPACITY: u64 = 1 << 24;

/// Generate a deterministic order lifecycle and the open quantity each
/// order should end with.
fn generate_events(seed: u64, count: usize) -> (Vec<Vec<u8>>, FxHashMap<u32, u32>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut events = Vec::with_capacity(count);
    let mut open: FxHashMap<u32, u32> = FxHashMap::default();
    let mut live: Vec<u32> = Vec::new();
    let mut next_id = 1u32;
    let mut ts = 1_700_000_000_000_000_000u64;

    for i in 0..count {
        ts += rng.gen_range(1..10_000);
        if i % 64 == 0 {
            events.push(encode_record(RecordKind::Timestamp, ts, &TimestampBody { nanos: ts }).to_vec());
            continue;
        }

        // 50% new order, 30% fill, 20% cancel
        let roll = rng.gen_range(0..10);
        if live.is_empty() || roll < 5 {
            let id = next_id;
            next_id += 1;
            let size = rng.gen_range(1..500);
            let order = NewOrderBody {
                esi: rng.gen_range(1..20),
                market: *b"XNYS",
                oid: oid(id),
                client_order_id: fixed(&format!("C{id}")),
                price: rng.gen_range(9_500..10_500) * 1_000,
                size,
                side: if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell },
                tif: TimeInForce::Day,
                order_type: OrderType::Limit,
                user_data: 0,
            };
            events.push(encode_record(RecordKind::OrderSent, ts, &order).to_vec());
            let ack = OrderAckBody { oid: oid(id), open_size: size, exchange_ts: ts + 5 };
            events.push(encode_record(RecordKind::OrderAck, ts + 10, &ack).to_vec());
            open.insert(id, size);
            live.push(id);
        } else if roll < 8 {
            let idx = rng.gen_range(0..live.len());
            let id = live[idx];
            let remaining = open[&id];
            let qty = rng.gen_range(1..=remaining);
            let kind = if qty == remaining { RecordKind::OrderFill } else { RecordKind::OrderPartialFill };
            let body = OrderFillBody {
                oid: oid(id),
                filled_qty: qty,
                filled_price: 10_000_000,
                fee_code: 0,
                exchange_ts: ts,
            };
            events.push(encode_record(kind, ts, &body).to_vec());
            open.insert(id, remaining - qty);
            if qty == remaining {
                live.swap_remove(idx);
            }
        } else {
            let id = live.swap_remove(rng.gen_range(0..live.len()));
            let body = OrderCancelBody { oid: oid(id), cancelled_qty: open[&id], exchange_ts: ts };
            events.push(encode_record(RecordKind::OrderCancel, ts, &body).to_vec());
            open.insert(id, 0);
        }
    }

    (events, open)
}

fn oid(local_id: u32) -> OrderIdentifier {
    OrderIdentifier { local_account: 1, local_id, session: fixed("GOLDEN") }
}

/// Rebuilds open quantity per order from replayed records.
#[derive(Default)]
struct OpenQty(FxHashMap<u32, u32>);

impl ReplayListener for OpenQty {
    fn on_acknowledged(&mut self, _timestamp: u64, body: &OrderAckBody) {
        self.0.insert(body.oid.local_id, body.open_size);
    }

    fn on_filled(&mut self, _timestamp: u64, _partial: bool, body: &OrderFillBody) {
        if let Some(open) = self.0.get_mut(&body.oid.local_id) {
            *open -= body.filled_qty;
        }
    }

    fn on_cancelled(&mut self, _timestamp: u64, body: &OrderCancelBody) {
        self.0.insert(body.oid.local_id, 0);
    }
}

fn write_log(path: &Path, events: &[Vec<u8>]) {
    let log = AppendLog::open(path, &LogConfig::default().with_capacity(CAPACITY)).unwrap();
    for event in events {
        log.write(event).unwrap();
    }
    log.close().unwrap();
}

/// Replay the log at `path` to CSV text.
fn replay_csv(path: &Path) -> String {
    let sink = Arc::new(Mutex::new(CsvSink::new(Vec::new())));
    {
        let mut stream = FileRecordStream::open(path).unwrap();
        stream.register_listener(Arc::clone(&sink));
        stream.replay().unwrap();
    }
    let sink = Arc::try_unwrap(sink).ok().unwrap().into_inner();
    String::from_utf8(sink.into_inner().unwrap()).unwrap()
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Write and replay an event sequence, returning the file and CSV hashes.
fn run_log(events: &[Vec<u8>]) -> (u64, u64) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("golden.log");
    write_log(&path, events);

    let bytes = std::fs::read(&path).unwrap();
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);

    (hasher.finish(), hash_text(&replay_csv(&path)))
}

// ============================================================================
// Golden Master
// ============================================================================

#[test]
fn test_determinism_small() {
    const SEED: u64 = 0xDEADBEEF;
    const COUNT: usize = 1000;
    const RUNS: usize = 10;

    let (events, _) = generate_events(SEED, COUNT);
    let (first_file_hash, first_csv_hash) = run_log(&events);

    for run in 1..RUNS {
        let (file_hash, csv_hash) = run_log(&events);
        assert_eq!(file_hash, first_file_hash, "File hash mismatch on run {}", run);
        assert_eq!(csv_hash, first_csv_hash, "CSV hash mismatch on run {}", run);
    }

    println!("Determinism test passed!");
    println!("  Events: {}", events.len());
    println!("  Runs: {}", RUNS);
    println!("  File hash: {:#018x}", first_file_hash);
    println!("  CSV hash: {:#018x}", first_csv_hash);
}

#[test]
fn test_determinism_large() {
    const SEED: u64 = 0xCAFEBABE;
    const COUNT: usize = 100_000;
    const RUNS: usize = 3;

    let (events, _) = generate_events(SEED, COUNT);
    let (first_file_hash, first_csv_hash) = run_log(&events);

    for run in 1..RUNS {
        let (file_hash, csv_hash) = run_log(&events);
        assert_eq!(file_hash, first_file_hash, "File hash mismatch on run {}", run);
        assert_eq!(csv_hash, first_csv_hash, "CSV hash mismatch on run {}", run);
    }
}

#[test]
fn test_different_seeds_produce_different_results() {
    let (events1, _) = generate_events(1, 1000);
    let (events2, _) = generate_events(2, 1000);

    let (hash1, _) = run_log(&events1);
    let (hash2, _) = run_log(&events2);

    assert_ne!(hash1, hash2, "Different seeds should produce different results");
}

// ============================================================================
// Replay Semantics
// ============================================================================

#[test]
fn test_replay_rebuilds_order_state() {
    let (events, expected) = generate_events(0x5EED, 20_000);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.log");
    write_log(&path, &events);

    let state = Arc::new(Mutex::new(OpenQty::default()));
    let mut stream = FileRecordStream::open(&path).unwrap();
    stream.register_listener(Arc::clone(&state));
    assert_eq!(stream.replay().unwrap(), events.len());

    assert_eq!(state.lock().0, expected);
}

#[test]
fn test_rewind_replays_identically() {
    let (events, _) = generate_events(77, 2_000);
    let bytes: Vec<u8> = events.concat();

    let sink = Arc::new(Mutex::new(CsvSink::new(Vec::new())));
    let mut stream = RecordStream::new(bytes);
    stream.register_listener(Arc::clone(&sink));

    assert_eq!(stream.replay().unwrap(), events.len());
    assert_eq!(stream.replay().unwrap(), events.len());
    drop(stream);

    let out = Arc::try_unwrap(sink).ok().unwrap().into_inner().into_inner().unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), events.len() * 2);
    assert_eq!(lines[..events.len()], lines[events.len()..]);
}

#[test]
fn test_reopen_continues_after_close() {
    let (events, _) = generate_events(3, 1_000);
    let (first, second) = events.split_at(400);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.log");

    write_log(&path, first);
    let first_len: usize = first.iter().map(Vec::len).sum();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), first_len as u64);

    // A second writer session appends after the committed prefix.
    write_log(&path, second);
    let total_len: usize = events.iter().map(Vec::len).sum();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), total_len as u64);
    assert_eq!(std::fs::read(&path).unwrap(), events.concat());
    assert_eq!(std::fs::read(offset_path(&path)).unwrap().len(), 8);

    let whole = replay_csv(&path);
    assert_eq!(whole.lines().count(), events.len());
}
