//! Replay listeners.
//!
//! A [`ReplayListener`] is notified once per decoded record. Every callback
//! has a no-op default, so a listener overrides only the kinds it cares
//! about. [`ReplayListener::on_record`] is the single entry point the
//! decoder calls; its default implementation fans out to the per-kind
//! methods.

use crate::record::{
    trimmed, FileHeader, FileTrailer, ManualPositionAdjBody, NewAccountBody, NewInstrumentBody,
    NewOrderBody, NewSessionBody, OrderAckBody, OrderCancelBody, OrderCancelReplaceBody,
    OrderCancelRequestBody, OrderDestroyBody, OrderFillBody, OrderIdentifier, OrderRejectBody,
    PositionBody, Price, Record, RecordKind, TimestampBody, PRICE_DECIMALS,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::io::Write;
use std::sync::Arc;
use tracing::warn;

/// Receiver of decoded records. Timestamps are nanoseconds since the epoch.
#[allow(unused_variables)]
pub trait ReplayListener {
    /// Called for every decoded record. Override to see records untyped.
    fn on_record(&mut self, timestamp: u64, record: &Record<'_>) {
        match *record {
            Record::Timestamp(ref b) => self.on_timestamp(timestamp, b),
            Record::StartOfLog(ref b) => self.on_log_start(timestamp, b),
            Record::EndOfLog(ref b) => self.on_log_end(timestamp, b),
            Record::NewInstrument(ref b) => self.on_new_instrument(timestamp, b),
            Record::NewOrder(ref b) => self.on_new_order(timestamp, b),
            Record::OrderLocalReject(ref b) => self.on_local_reject(timestamp, b),
            Record::OrderSent(ref b) => self.on_order_sent(timestamp, b),
            Record::OrderAck(ref b) => self.on_acknowledged(timestamp, b),
            Record::OrderPartialFill(ref b) => self.on_filled(timestamp, true, b),
            Record::OrderFill(ref b) => self.on_filled(timestamp, false, b),
            Record::OrderCancelRequest(ref b) => self.on_pending_cancel(timestamp, b),
            Record::OrderPartialCancel(ref b) => self.on_partial_cancel(timestamp, b),
            Record::OrderCancel(ref b) => self.on_cancelled(timestamp, b),
            Record::OrderCancelReplaceRequest(ref b) => self.on_cancel_replace_request(timestamp, b),
            Record::OrderCancelReplace(ref b) => self.on_cancel_replaced(timestamp, b),
            Record::OrderRemoteReject(ref b) => self.on_rejected(timestamp, b),
            Record::OrderCancelReject(ref b) => self.on_cancel_rejected(timestamp, b),
            Record::OrderDestroy(ref b) => self.on_destroy(timestamp, b),
            Record::Position(ref b) => self.on_position(timestamp, b),
            Record::ManualPositionAdj(ref b) => self.on_manual_position_adj(timestamp, b),
            Record::NewSession(ref b) => self.on_new_session(timestamp, b),
            Record::OrderSessionData { ref oid, data } => self.on_order_session_data(timestamp, oid, data),
            Record::NewAccount(ref b) => self.on_new_account(timestamp, b),
            Record::Unknown { code, body } => self.on_unknown(timestamp, code, body),
        }
    }

    fn on_timestamp(&mut self, timestamp: u64, body: &TimestampBody) {}
    fn on_log_start(&mut self, timestamp: u64, header: &FileHeader) {}
    fn on_log_end(&mut self, timestamp: u64, trailer: &FileTrailer) {}
    fn on_new_instrument(&mut self, timestamp: u64, body: &NewInstrumentBody) {}
    fn on_new_order(&mut self, timestamp: u64, body: &NewOrderBody) {}
    fn on_local_reject(&mut self, timestamp: u64, body: &NewOrderBody) {}
    fn on_order_sent(&mut self, timestamp: u64, body: &NewOrderBody) {}
    fn on_acknowledged(&mut self, timestamp: u64, body: &OrderAckBody) {}
    /// Both fill kinds; `partial` tells them apart.
    fn on_filled(&mut self, timestamp: u64, partial: bool, body: &OrderFillBody) {}
    fn on_pending_cancel(&mut self, timestamp: u64, body: &OrderCancelRequestBody) {}
    fn on_partial_cancel(&mut self, timestamp: u64, body: &OrderCancelBody) {}
    fn on_cancelled(&mut self, timestamp: u64, body: &OrderCancelBody) {}
    fn on_cancel_replace_request(&mut self, timestamp: u64, body: &OrderCancelReplaceBody) {}
    fn on_cancel_replaced(&mut self, timestamp: u64, body: &OrderCancelReplaceBody) {}
    fn on_rejected(&mut self, timestamp: u64, body: &OrderRejectBody) {}
    fn on_cancel_rejected(&mut self, timestamp: u64, body: &OrderRejectBody) {}
    fn on_destroy(&mut self, timestamp: u64, body: &OrderDestroyBody) {}
    fn on_position(&mut self, timestamp: u64, body: &PositionBody) {}
    fn on_manual_position_adj(&mut self, timestamp: u64, body: &ManualPositionAdjBody) {}
    fn on_new_session(&mut self, timestamp: u64, body: &NewSessionBody) {}
    fn on_order_session_data(&mut self, timestamp: u64, oid: &OrderIdentifier, data: &[u8]) {}
    fn on_new_account(&mut self, timestamp: u64, body: &NewAccountBody) {}
    /// A kind this build does not know. The record has been skipped.
    fn on_unknown(&mut self, timestamp: u64, code: u8, body: &[u8]) {}

    /// The stream delivered at least one record and has reached the
    /// published end of the buffer.
    fn on_caught_up(&mut self) {}
}

/// Listeners as the stream stores them.
pub type BoxedListener = Box<dyn ReplayListener + Send>;

/// A listener shared with another thread, e.g. a dashboard reading counts
/// while a follow thread feeds them.
impl<L: ReplayListener> ReplayListener for Arc<Mutex<L>> {
    fn on_record(&mut self, timestamp: u64, record: &Record<'_>) {
        self.lock().on_record(timestamp, record);
    }

    fn on_caught_up(&mut self) {
        self.lock().on_caught_up();
    }
}

// ============================================================================
// Counting
// ============================================================================

/// Counts records per kind.
#[derive(Clone, Debug, Default)]
pub struct KindCounts {
    counts: [u64; RecordKind::COUNT],
    /// Records whose kind code is outside [`RecordKind`].
    pub unknown: u64,
    /// Timestamp of the most recent record.
    pub last_timestamp: u64,
}

impl KindCounts {
    pub fn get(&self, kind: RecordKind) -> u64 {
        self.counts[kind as usize]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum::<u64>() + self.unknown
    }

    /// Known kinds with a non-zero count, in kind order.
    pub fn iter(&self) -> impl Iterator<Item = (RecordKind, u64)> + '_ {
        self.counts
            .iter()
            .enumerate()
            .filter(|&(_, &n)| n > 0)
            .filter_map(|(code, &n)| RecordKind::from_u8(code as u8).map(|k| (k, n)))
    }
}

impl ReplayListener for KindCounts {
    fn on_record(&mut self, timestamp: u64, record: &Record<'_>) {
        self.last_timestamp = timestamp;
        match record {
            Record::Unknown { .. } => self.unknown += 1,
            other => self.counts[other.kind() as usize] += 1,
        }
    }
}

// ============================================================================
// CSV output
// ============================================================================

/// Render a fixed-point price as a decimal string.
pub fn format_price(price: Price) -> String {
    match i64::try_from(price) {
        Ok(p) => Decimal::new(p, PRICE_DECIMALS).normalize().to_string(),
        Err(_) => price.to_string(),
    }
}

/// Render epoch nanoseconds as RFC 3339 UTC.
pub fn format_timestamp(nanos: u64) -> String {
    match i64::try_from(nanos) {
        Ok(ns) => DateTime::<Utc>::from_timestamp_nanos(ns)
            .format("%Y-%m-%dT%H:%M:%S%.9fZ")
            .to_string(),
        Err(_) => nanos.to_string(),
    }
}

fn oid_fields(oid: &OrderIdentifier, out: &mut Vec<String>) {
    out.push(oid.local_account.to_string());
    out.push(oid.local_id.to_string());
    out.push(trimmed(&oid.session));
}

fn order_fields(order: &NewOrderBody, out: &mut Vec<String>) {
    out.push(order.esi.to_string());
    out.push(trimmed(&order.market));
    oid_fields(&order.oid, out);
    out.push(trimmed(&order.client_order_id));
    out.push(format_price(order.price));
    out.push(order.size.to_string());
    out.push(order.side.as_str().to_string());
    out.push(order.tif.as_str().to_string());
    out.push(order.order_type.as_str().to_string());
}

fn instrument_fields(body: &NewInstrumentBody, out: &mut Vec<String>) {
    out.push(body.esi.to_string());
    out.push(trimmed(&body.listing_market));
    out.push(trimmed(&body.symbol));
    out.push(trimmed(&body.figi));
}

/// The body fields of `record`, in wire order, as CSV cells.
pub fn record_fields(record: &Record<'_>) -> Vec<String> {
    let mut out = Vec::with_capacity(12);
    match record {
        Record::Timestamp(b) => out.push(format_timestamp(b.nanos)),
        Record::StartOfLog(b) => {
            out.push(format!("{:#010x}", b.magic));
            out.push(b.version.to_string());
            out.push(trimmed(&b.commit));
        }
        Record::EndOfLog(b) => out.push(b.terminator.to_string()),
        Record::NewInstrument(b) => instrument_fields(b, &mut out),
        Record::NewOrder(b) | Record::OrderLocalReject(b) | Record::OrderSent(b) => {
            order_fields(b, &mut out)
        }
        Record::OrderAck(b) => {
            oid_fields(&b.oid, &mut out);
            out.push(b.open_size.to_string());
            out.push(b.exchange_ts.to_string());
        }
        Record::OrderPartialFill(b) | Record::OrderFill(b) => {
            oid_fields(&b.oid, &mut out);
            out.push(b.filled_qty.to_string());
            out.push(format_price(b.filled_price));
            out.push(b.fee_code.to_string());
            out.push(b.exchange_ts.to_string());
        }
        Record::OrderCancelRequest(b) => {
            oid_fields(&b.oid, &mut out);
            out.push(b.new_qty.to_string());
        }
        Record::OrderPartialCancel(b) | Record::OrderCancel(b) => {
            oid_fields(&b.oid, &mut out);
            out.push(b.cancelled_qty.to_string());
            out.push(b.exchange_ts.to_string());
        }
        Record::OrderCancelReplaceRequest(b) | Record::OrderCancelReplace(b) => {
            oid_fields(&b.old_oid, &mut out);
            order_fields(&b.new_order, &mut out);
        }
        Record::OrderRemoteReject(b) | Record::OrderCancelReject(b) => {
            oid_fields(&b.oid, &mut out);
            out.push(b.exchange_ts.to_string());
        }
        Record::OrderDestroy(b) => oid_fields(&b.oid, &mut out),
        Record::Position(b) => {
            out.push(b.source.to_string());
            instrument_fields(&b.instrument, &mut out);
            out.push(b.qty.to_string());
            out.push(format_price(b.avg_price));
            out.push(format_price(b.mark_price));
        }
        Record::ManualPositionAdj(b) => {
            out.push(b.esi.to_string());
            out.push(b.delta_trading_qty.to_string());
            out.push(b.delta_start_qty.to_string());
        }
        Record::NewSession(b) => {
            out.push(trimmed(&b.name));
            out.push(trimmed(&b.market));
        }
        Record::OrderSessionData { oid, data } => {
            oid_fields(oid, &mut out);
            out.push(data.len().to_string());
        }
        Record::NewAccount(b) => {
            out.push(b.local_account.to_string());
            out.push(trimmed(&b.name));
        }
        Record::Unknown { code, body } => {
            out.push(code.to_string());
            out.push(body.len().to_string());
        }
    }
    out
}

/// Writes one CSV row per record: `timestamp,KIND,fields...`.
///
/// Rows have different widths per kind. Write failures are logged once and
/// kept; later records are dropped until [`take_error`](Self::take_error)
/// clears it.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    rows: u64,
    error: Option<csv::Error>,
}

impl<W: Write> CsvSink<W> {
    pub fn new(inner: W) -> Self {
        let writer = csv::WriterBuilder::new().flexible(true).has_headers(false).from_writer(inner);
        Self { writer, rows: 0, error: None }
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn take_error(&mut self) -> Option<csv::Error> {
        self.error.take()
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(self) -> std::io::Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error())
    }

    fn write_row(&mut self, timestamp: u64, record: &Record<'_>) -> csv::Result<()> {
        let kind = match record {
            Record::Unknown { .. } => RecordKind::Unknown.as_str(),
            other => other.kind().as_str(),
        };
        let mut row = Vec::with_capacity(14);
        row.push(format_timestamp(timestamp));
        row.push(kind.to_string());
        row.extend(record_fields(record));
        self.writer.write_record(&row)
    }
}

impl<W: Write> ReplayListener for CsvSink<W> {
    fn on_record(&mut self, timestamp: u64, record: &Record<'_>) {
        if self.error.is_some() {
            return;
        }
        match self.write_row(timestamp, record) {
            Ok(()) => self.rows += 1,
            Err(e) => {
                warn!(error = %e, "csv sink write failed");
                self.error = Some(e);
            }
        }
    }

    fn on_caught_up(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(error = %e, "csv sink flush failed");
        }
    }
}

// ============================================================================
// Channel output
// ============================================================================

/// A record copied out of the log for another thread.
#[cfg(feature = "runtime")]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayEvent {
    pub timestamp: u64,
    pub kind: RecordKind,
    /// The full record image, header included.
    pub bytes: Vec<u8>,
}

/// Forwards records to a consumer thread over a lock-free SPSC queue.
///
/// Records that find the queue full are counted and dropped; the follow
/// thread never blocks on a slow consumer.
#[cfg(feature = "runtime")]
pub struct ChannelSink {
    producer: rtrb::Producer<ReplayEvent>,
    dropped: u64,
}

#[cfg(feature = "runtime")]
impl ChannelSink {
    /// A sink and the consumer end of its queue.
    pub fn with_capacity(capacity: usize) -> (Self, rtrb::Consumer<ReplayEvent>) {
        let (producer, consumer) = rtrb::RingBuffer::new(capacity);
        (Self { producer, dropped: 0 }, consumer)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(feature = "runtime")]
impl ReplayListener for ChannelSink {
    fn on_record(&mut self, timestamp: u64, record: &Record<'_>) {
        let event = ReplayEvent { timestamp, kind: record.kind(), bytes: record.to_bytes(timestamp) };
        if self.producer.push(event).is_err() {
            self.dropped += 1;
        }
    }
}
