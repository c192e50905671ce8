//! Stress Tests - Push the log to its limits.
//!
//! These tests verify correctness under extreme conditions:
//! - Many writers contending on one counter
//! - A reader tailing while writers append
//! - Writers racing into the end of the capacity
//! - Rings cycled through many wraparounds

use flash_log::record::{fixed, NewOrderBody, OrderIdentifier, OrderType, Side, TimeInForce};
use flash_log::{
    decode, encode_record, offset_path, AppendLog, BoxedListener, Decoded, Error, FileRecordStream, FollowConfig,
    FollowTask, LogConfig, RecordKind, RecordStream, ReplayListener, RingBuffer,
};
use parking_lot::Mutex;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const ORDER_RECORD_LEN: usize = 12 + 65;

fn order_image(account: u16, seq: u32) -> Vec<u8> {
    let body = NewOrderBody {
        esi: 7,
        market: *b"XNAS",
        oid: OrderIdentifier { local_account: account, local_id: seq, session: fixed("STRESS") },
        client_order_id: fixed("C"),
        price: 10_000_000 + u64::from(seq % 1_000),
        size: 1 + seq % 500,
        side: if seq % 2 == 0 { Side::Buy } else { Side::Sell },
        tif: TimeInForce::Day,
        order_type: OrderType::Limit,
        user_data: u64::from(seq),
    };
    encode_record(RecordKind::OrderSent, u64::from(seq), &body).to_vec()
}

/// Records every order identifier in replay order.
#[derive(Default)]
struct OrderIds(Vec<(u16, u32)>);

impl ReplayListener for OrderIds {
    fn on_order_sent(&mut self, _timestamp: u64, body: &NewOrderBody) {
        self.0.push((body.oid.local_account, body.oid.local_id));
    }
}

/// Smallest ring order that is a whole number of pages.
fn page_order() -> u8 {
    flash_log::region::page_size().trailing_zeros() as u8
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out");
        thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Writer Contention
// ============================================================================

#[test]
fn test_concurrent_writers_partition_log() {
    const THREADS: u16 = 8;
    const PER_THREAD: u32 = 5_000;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contended.log");
    let log = AppendLog::open(&path, &LogConfig::default().with_capacity(1 << 26)).unwrap();

    thread::scope(|s| {
        for account in 0..THREADS {
            let log = &log;
            s.spawn(move || {
                for seq in 0..PER_THREAD {
                    assert_eq!(log.write(&order_image(account, seq)).unwrap(), ORDER_RECORD_LEN);
                }
            });
        }
    });

    let total = THREADS as usize * PER_THREAD as usize;
    assert_eq!(log.size(), (total * ORDER_RECORD_LEN) as u64);

    let ids = Arc::new(Mutex::new(OrderIds::default()));
    {
        let mut stream = RecordStream::new(log.as_readonly_buffer());
        stream.register_listener(Arc::clone(&ids));
        assert_eq!(stream.replay().unwrap(), total);
    }

    // Every record is intact and each writer's records stay in its own order.
    let ids = ids.lock();
    let mut next = vec![0u32; THREADS as usize];
    for &(account, seq) in &ids.0 {
        assert_eq!(seq, next[account as usize], "writer {} out of order", account);
        next[account as usize] += 1;
    }
    assert!(next.iter().all(|&n| n == PER_THREAD));
    drop(ids);

    log.close().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), (total * ORDER_RECORD_LEN) as u64);
}

#[test]
fn test_mixed_size_writers_never_overlap() {
    const THREADS: u64 = 6;
    const PER_THREAD: u64 = 2_000;

    let dir = tempfile::tempdir().unwrap();
    let log = AppendLog::open(dir.path().join("mixed.log"), &LogConfig::default().with_capacity(1 << 26)).unwrap();
    let expected = AtomicU64::new(0);

    // Each chunk is filled with its writer's byte; any overlap mixes bytes.
    thread::scope(|s| {
        for t in 0..THREADS {
            let (log, expected) = (&log, &expected);
            s.spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(t);
                for _ in 0..PER_THREAD {
                    let len = rng.gen_range(1..=300);
                    let chunk = vec![(t + 1) as u8; len];
                    log.write(&chunk).unwrap();
                    expected.fetch_add(len as u64, Ordering::Relaxed);
                }
            });
        }
    });

    let buf = log.as_readonly_buffer();
    assert_eq!(buf.len() as u64, expected.load(Ordering::Relaxed));
    assert!(buf.iter().all(|&b| (1..=THREADS as u8).contains(&b)));
}

// ============================================================================
// Reader While Writing
// ============================================================================

#[test]
fn test_follow_keeps_up_with_writers() {
    const THREADS: u16 = 4;
    const PER_THREAD: u32 = 2_500;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("live.log");
    let log = AppendLog::open(&path, &LogConfig::default().with_capacity(1 << 24)).unwrap();

    let task = FollowTask::spawn(
        FileRecordStream::open(&path).unwrap(),
        FollowConfig::default().with_poll_interval(Duration::from_micros(200)),
    )
    .unwrap();

    thread::scope(|s| {
        for account in 0..THREADS {
            let log = &log;
            s.spawn(move || {
                for seq in 0..PER_THREAD {
                    log.write(&order_image(account, seq)).unwrap();
                }
            });
        }
    });

    let total = u64::from(THREADS) * u64::from(PER_THREAD);
    wait_for(|| task.records() == total);

    let summary = task.stop();
    assert!(summary.error.is_none());
    assert_eq!(summary.records, total);
    assert_eq!(summary.stream.position(), log.size());
}

#[test]
fn test_late_reader_sees_committed_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("late.log");
    let log = AppendLog::open(&path, &LogConfig::default().with_capacity(1 << 20)).unwrap();
    for seq in 0..100 {
        log.write(&order_image(1, seq)).unwrap();
    }

    let reader = AppendLog::open(&path, &LogConfig::reader()).unwrap();
    assert_eq!(reader.as_readonly_buffer(), log.as_readonly_buffer());

    // Later appends show up through the reader's mapping.
    log.write(&order_image(1, 100)).unwrap();
    assert_eq!(reader.size(), 101 * ORDER_RECORD_LEN as u64);
    assert_eq!(&reader.as_readonly_buffer()[100 * ORDER_RECORD_LEN..], &order_image(1, 100)[..]);
}

// ============================================================================
// Capacity Stress Tests
// ============================================================================

#[test]
fn test_writers_racing_into_capacity() {
    const THREADS: u16 = 4;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("full.log");
    let capacity = (ORDER_RECORD_LEN * 1_000 + 40) as u64;
    let log = AppendLog::open(&path, &LogConfig::default().with_capacity(capacity)).unwrap();
    let accepted = AtomicU64::new(0);

    thread::scope(|s| {
        for account in 0..THREADS {
            let (log, accepted) = (&log, &accepted);
            s.spawn(move || {
                for seq in 0.. {
                    match log.write(&order_image(account, seq)) {
                        Ok(_) => {
                            accepted.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(Error::SpaceExhausted { capacity: c, .. }) => {
                            assert_eq!(c, capacity);
                            break;
                        }
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            });
        }
    });

    assert_eq!(accepted.load(Ordering::Relaxed), 1_000);
    assert_eq!(log.size(), capacity);

    // The 40 lost bytes were reserved but never written; replay stops there.
    {
        let mut stream = RecordStream::new(log.as_readonly_buffer());
        assert_eq!(stream.replay().unwrap(), 1_000);
        assert_eq!(stream.position(), (ORDER_RECORD_LEN * 1_000) as u64);
    }

    log.close().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), capacity);
    assert!(std::fs::metadata(offset_path(&path)).is_ok());
}

// ============================================================================
// Ring Churn
// ============================================================================

#[test]
fn test_ring_many_wraparounds() {
    let order = page_order();
    let mut ring = RingBuffer::anonymous(order).unwrap();
    let cap = ring.capacity();
    let mut rng = ChaCha8Rng::seed_from_u64(99);

    let mut produced = 0u64;
    let mut consumed = 0u64;
    while consumed < (cap as u64) * 50 {
        let n = rng.gen_range(0..=ring.free().min(cap / 3));
        for (i, b) in ring.writable()[..n].iter_mut().enumerate() {
            *b = ((produced + i as u64) % 251) as u8;
        }
        ring.write_advance(n);
        produced += n as u64;

        let m = rng.gen_range(0..=ring.size());
        for (i, &b) in ring.readable()[..m].iter().enumerate() {
            assert_eq!(b, ((consumed + i as u64) % 251) as u8);
        }
        ring.read_advance(m);
        consumed += m as u64;
        assert_eq!(ring.size() as u64, produced - consumed);
    }
}

#[test]
fn test_records_through_ring() {
    let order = page_order();
    let mut ring = RingBuffer::anonymous(order).unwrap();
    let ids = Arc::new(Mutex::new(OrderIds::default()));
    let mut listeners: Vec<BoxedListener> = vec![Box::new(Arc::clone(&ids))];

    let mut next_seq = 0u32;
    for step in 0..10_000 {
        let image = order_image(3, next_seq);
        if ring.free() >= image.len() {
            ring.writable()[..image.len()].copy_from_slice(&image);
            ring.write_advance(image.len());
            next_seq += 1;
        }
        // The consumer skips every third step, so the ring fills and wraps.
        if step % 3 != 0 {
            if let Decoded::Record(n) = decode(ring.readable(), 0, &mut listeners).unwrap() {
                ring.read_advance(n);
            }
        }
    }
    while let Decoded::Record(n) = decode(ring.readable(), 0, &mut listeners).unwrap() {
        ring.read_advance(n);
    }

    let ids = ids.lock();
    assert_eq!(ids.0.len(), next_seq as usize);
    assert!(ids.0.iter().enumerate().all(|(i, &(a, s))| a == 3 && s == i as u32));
}
