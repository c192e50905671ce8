//! Order-log record format.
//!
//! Every record is a 12-byte header followed by its body, little-endian,
//! with no padding between records:
//!
//! | Offset | Size | Field       |
//! |--------|------|-------------|
//! | 0      | 2    | `body_len`  |
//! | 2      | 1    | `kind`      |
//! | 3      | 1    | `subtype`   |
//! | 4      | 8    | `timestamp` |
//!
//! Kind 0 is never written. A zero kind at the tail of a live log means the
//! writer has reserved the bytes but not yet copied them in.

use arrayvec::ArrayVec;
use chrono::Utc;

/// Size of [`RecordHeader`] on the wire.
pub const HEADER_LEN: usize = 12;

/// Largest fixed body ([`NewAccountBody`]).
pub const MAX_BODY_LEN: usize = NewAccountBody::LEN;

/// Largest record image [`encode_record`] produces.
pub const MAX_RECORD_LEN: usize = HEADER_LEN + MAX_BODY_LEN;

/// Carried by [`FileHeader`]; asymmetric so byte order can be detected.
pub const MAGIC_NUMBER: u32 = 0x4F4C_4649;

/// Version written into [`FileHeader`].
pub const FORMAT_VERSION: u64 = 1;

/// Fixed-point price with [`PRICE_DECIMALS`] decimal places
/// (e.g., $100.50 -> 10050000).
pub type Price = u64;

/// Decimal places of a [`Price`].
pub const PRICE_DECIMALS: u32 = 5;

/// Nanoseconds since the Unix epoch, now.
pub fn timestamp_now() -> u64 {
    Utc::now().timestamp_nanos_opt().map_or(0, |ns| ns.max(0) as u64)
}

// ============================================================================
// Kinds and header
// ============================================================================

/// What a record's body holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RecordKind {
    Unknown = 0,
    Timestamp = 1,
    StartOfLog = 2,
    EndOfLog = 3,
    NewInstrument = 4,
    NewOrder = 5,
    OrderLocalReject = 6,
    OrderSent = 7,
    OrderAck = 8,
    OrderPartialFill = 9,
    OrderFill = 10,
    OrderCancelRequest = 11,
    OrderPartialCancel = 12,
    OrderCancel = 13,
    OrderCancelReplaceRequest = 14,
    OrderCancelReplace = 15,
    OrderRemoteReject = 16,
    OrderCancelReject = 17,
    OrderDestroy = 18,
    Position = 19,
    ManualPositionAdj = 20,
    NewSession = 21,
    OrderSessionData = 22,
    NewAccount = 23,
}

impl RecordKind {
    /// Number of defined kinds, `Unknown` included.
    pub const COUNT: usize = 24;

    pub const fn from_u8(code: u8) -> Option<Self> {
        use RecordKind::*;
        Some(match code {
            0 => Unknown,
            1 => Timestamp,
            2 => StartOfLog,
            3 => EndOfLog,
            4 => NewInstrument,
            5 => NewOrder,
            6 => OrderLocalReject,
            7 => OrderSent,
            8 => OrderAck,
            9 => OrderPartialFill,
            10 => OrderFill,
            11 => OrderCancelRequest,
            12 => OrderPartialCancel,
            13 => OrderCancel,
            14 => OrderCancelReplaceRequest,
            15 => OrderCancelReplace,
            16 => OrderRemoteReject,
            17 => OrderCancelReject,
            18 => OrderDestroy,
            19 => Position,
            20 => ManualPositionAdj,
            21 => NewSession,
            22 => OrderSessionData,
            23 => NewAccount,
            _ => return None,
        })
    }

    /// Upper-case name used in CSV output.
    pub const fn as_str(self) -> &'static str {
        use RecordKind::*;
        match self {
            Unknown => "UNKNOWN",
            Timestamp => "TIMESTAMP",
            StartOfLog => "START_OF_LOG",
            EndOfLog => "END_OF_LOG",
            NewInstrument => "NEW_INSTRUMENT",
            NewOrder => "NEW_ORDER",
            OrderLocalReject => "ORDER_LOCAL_REJECT",
            OrderSent => "ORDER_SENT",
            OrderAck => "ORDER_ACKNOWLEDGEMENT",
            OrderPartialFill => "ORDER_PARTIAL_FILL",
            OrderFill => "ORDER_FILL",
            OrderCancelRequest => "ORDER_CANCEL_REQUEST",
            OrderPartialCancel => "ORDER_PARTIAL_CANCEL",
            OrderCancel => "ORDER_CANCEL",
            OrderCancelReplaceRequest => "ORDER_CXLREPL_REQUEST",
            OrderCancelReplace => "ORDER_CANCEL_REPLACE",
            OrderRemoteReject => "ORDER_REMOTE_REJECT",
            OrderCancelReject => "ORDER_CANCEL_REJECT",
            OrderDestroy => "ORDER_DESTROY",
            Position => "POSITION",
            ManualPositionAdj => "MANUAL_POSITION_ADJ",
            NewSession => "NEW_SESSION",
            OrderSessionData => "ORDER_SESSION_DATA",
            NewAccount => "NEW_ACCOUNT",
        }
    }

    /// Smallest body a record of this kind may carry.
    pub const fn min_body_len(self) -> usize {
        use RecordKind::*;
        match self {
            Unknown => 0,
            Timestamp => TimestampBody::LEN,
            StartOfLog => FileHeader::LEN,
            EndOfLog => FileTrailer::LEN,
            NewInstrument => NewInstrumentBody::LEN,
            NewOrder | OrderLocalReject | OrderSent => NewOrderBody::LEN,
            OrderAck => OrderAckBody::LEN,
            OrderPartialFill | OrderFill => OrderFillBody::LEN,
            OrderCancelRequest => OrderCancelRequestBody::LEN,
            OrderPartialCancel | OrderCancel => OrderCancelBody::LEN,
            OrderCancelReplaceRequest | OrderCancelReplace => OrderCancelReplaceBody::LEN,
            OrderRemoteReject | OrderCancelReject => OrderRejectBody::LEN,
            OrderDestroy => OrderDestroyBody::LEN,
            Position => PositionBody::LEN,
            ManualPositionAdj => ManualPositionAdjBody::LEN,
            NewSession => NewSessionBody::LEN,
            OrderSessionData => OrderIdentifier::LEN,
            NewAccount => NewAccountBody::LEN,
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed prefix of every record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub body_len: u16,
    /// Raw kind code; may be outside [`RecordKind`].
    pub kind: u8,
    pub subtype: u8,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: u64,
}

impl RecordHeader {
    pub fn new(kind: RecordKind, body_len: u16, timestamp: u64) -> Self {
        Self { body_len, kind: kind as u8, subtype: 0, timestamp }
    }

    /// Parse a header from the front of `buf`, or `None` if it is too short.
    #[inline]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let mut r = FieldReader::new(&buf[..HEADER_LEN]);
        Some(Self {
            body_len: r.u16(),
            kind: r.u8(),
            subtype: r.u8(),
            timestamp: r.u64(),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut w = FieldWriter::new(&mut out);
        w.u16(self.body_len);
        w.u8(self.kind);
        w.u8(self.subtype);
        w.u64(self.timestamp);
        out
    }

    /// Header plus body length in bytes.
    #[inline]
    pub fn record_len(&self) -> usize {
        HEADER_LEN + self.body_len as usize
    }
}

// ============================================================================
// Field codec
// ============================================================================

/// Little-endian cursor over a body being encoded.
///
/// The slice must be exactly as long as the body; writing past it panics.
pub struct FieldWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> FieldWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn bytes(&mut self, src: &[u8]) {
        self.buf[self.pos..self.pos + src.len()].copy_from_slice(src);
        self.pos += src.len();
    }

    pub fn u8(&mut self, v: u8) {
        self.bytes(&[v]);
    }
    pub fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }
    pub fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }
    pub fn i32(&mut self, v: i32) {
        self.bytes(&v.to_le_bytes());
    }
    pub fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }
    pub fn i64(&mut self, v: i64) {
        self.bytes(&v.to_le_bytes());
    }
}

/// Little-endian cursor over a body being decoded.
///
/// Callers check the body length first; reading past the end panics.
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    pub fn u8(&mut self) -> u8 {
        self.array::<1>()[0]
    }
    pub fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.array())
    }
    pub fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }
    pub fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.array())
    }
    pub fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.array())
    }
    pub fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.array())
    }

    /// Bytes not yet consumed.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// A fixed-size record body.
pub trait WireBody: Sized {
    /// Encoded size in bytes.
    const LEN: usize;

    fn put(&self, w: &mut FieldWriter<'_>);
    fn get(r: &mut FieldReader<'_>) -> Self;

    /// Decode from the front of `buf`, or `None` if it is too short.
    fn decode(buf: &[u8]) -> Option<Self> {
        (buf.len() >= Self::LEN).then(|| Self::get(&mut FieldReader::new(buf)))
    }
}

/// Copy `s` into a zero-padded fixed field, truncating if it is too long.
pub fn fixed<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let n = s.len().min(N);
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
    out
}

/// The text of a zero-padded fixed field.
pub fn trimmed(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

// ============================================================================
// Order attributes
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Side {
    #[default]
    Unknown = 0,
    Buy = 1,
    Sell = 2,
    Short = 3,
    ShortExempt = 4,
}

impl Side {
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => Side::Buy,
            2 => Side::Sell,
            3 => Side::Short,
            4 => Side::ShortExempt,
            _ => Side::Unknown,
        }
    }

    /// The side that closes a position opened on this side.
    #[inline]
    pub const fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell | Side::Short | Side::ShortExempt => Side::Buy,
            Side::Unknown => Side::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Side::Unknown => "UNKNOWN",
            Side::Buy => "BUY",
            Side::Sell => "SELL",
            Side::Short => "SHORT",
            Side::ShortExempt => "SHORT_EXEMPT",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TimeInForce {
    #[default]
    Unknown = 0,
    Day = 1,
    Ext = 2,
    Gtc = 3,
    AuctionOpen = 4,
    AuctionClose = 5,
    AuctionHalt = 6,
    Timed = 7,
    ImmediateOrCancel = 8,
    FillOrKill = 9,
}

impl TimeInForce {
    pub const fn from_u8(v: u8) -> Self {
        use TimeInForce::*;
        match v {
            1 => Day,
            2 => Ext,
            3 => Gtc,
            4 => AuctionOpen,
            5 => AuctionClose,
            6 => AuctionHalt,
            7 => Timed,
            8 => ImmediateOrCancel,
            9 => FillOrKill,
            _ => Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        use TimeInForce::*;
        match self {
            Unknown => "UNKNOWN",
            Day => "DAY",
            Ext => "EXT",
            Gtc => "GTC",
            AuctionOpen => "AUCTION_OPEN",
            AuctionClose => "AUCTION_CLOSE",
            AuctionHalt => "AUCTION_HALT",
            Timed => "TIMED",
            ImmediateOrCancel => "IOC",
            FillOrKill => "FOK",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OrderType {
    #[default]
    Unknown = 0,
    Market = 1,
    Limit = 2,
    Stop = 4,
    MidpointPeg = 8,
}

impl OrderType {
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => OrderType::Market,
            2 => OrderType::Limit,
            4 => OrderType::Stop,
            8 => OrderType::MidpointPeg,
            _ => OrderType::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            OrderType::Unknown => "UNKNOWN",
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Stop => "STOP",
            OrderType::MidpointPeg => "MIDPOINT_PEG",
        }
    }
}

// ============================================================================
// Bodies
// ============================================================================

/// Body of `StartOfLog`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u64,
    /// Commit hash of the writing build, hex, zero padded.
    pub commit: [u8; 40],
}

impl FileHeader {
    pub fn new(commit: &str) -> Self {
        Self { magic: MAGIC_NUMBER, version: FORMAT_VERSION, commit: fixed(commit) }
    }

    /// True if the magic number reads back in native order.
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC_NUMBER
    }
}

impl WireBody for FileHeader {
    const LEN: usize = 4 + 8 + 40;

    fn put(&self, w: &mut FieldWriter<'_>) {
        w.u32(self.magic);
        w.u64(self.version);
        w.bytes(&self.commit);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self { magic: r.u32(), version: r.u64(), commit: r.array() }
    }
}

/// Body of `EndOfLog`. A new [`FileHeader`] must follow it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileTrailer {
    pub terminator: u32,
}

impl WireBody for FileTrailer {
    const LEN: usize = 4;

    fn put(&self, w: &mut FieldWriter<'_>) {
        w.u32(self.terminator);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self { terminator: r.u32() }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimestampBody {
    pub nanos: u64,
}

impl WireBody for TimestampBody {
    const LEN: usize = 8;

    fn put(&self, w: &mut FieldWriter<'_>) {
        w.u64(self.nanos);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self { nanos: r.u64() }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NewInstrumentBody {
    /// Engine-local instrument index.
    pub esi: u32,
    /// Listing market MIC, e.g. `XNAS`.
    pub listing_market: [u8; 4],
    pub symbol: [u8; 10],
    pub figi: [u8; 12],
}

impl WireBody for NewInstrumentBody {
    const LEN: usize = 4 + 4 + 10 + 12;

    fn put(&self, w: &mut FieldWriter<'_>) {
        w.u32(self.esi);
        w.bytes(&self.listing_market);
        w.bytes(&self.symbol);
        w.bytes(&self.figi);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self { esi: r.u32(), listing_market: r.array(), symbol: r.array(), figi: r.array() }
    }
}

/// Identifies an order across every record about it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct OrderIdentifier {
    pub local_account: u16,
    pub local_id: u32,
    pub session: [u8; 8],
}

impl WireBody for OrderIdentifier {
    const LEN: usize = 2 + 4 + 8;

    fn put(&self, w: &mut FieldWriter<'_>) {
        w.u16(self.local_account);
        w.u32(self.local_id);
        w.bytes(&self.session);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self { local_account: r.u16(), local_id: r.u32(), session: r.array() }
    }
}

/// Body of `NewOrder`, `OrderLocalReject` and `OrderSent`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NewOrderBody {
    pub esi: u32,
    pub market: [u8; 4],
    pub oid: OrderIdentifier,
    pub client_order_id: [u8; 20],
    pub price: Price,
    pub size: u32,
    pub side: Side,
    pub tif: TimeInForce,
    pub order_type: OrderType,
    /// Opaque strategy cookie, logged for debugging only.
    pub user_data: u64,
}

impl WireBody for NewOrderBody {
    const LEN: usize = 4 + 4 + OrderIdentifier::LEN + 20 + 8 + 4 + 3 + 8;

    fn put(&self, w: &mut FieldWriter<'_>) {
        w.u32(self.esi);
        w.bytes(&self.market);
        self.oid.put(w);
        w.bytes(&self.client_order_id);
        w.u64(self.price);
        w.u32(self.size);
        w.u8(self.side as u8);
        w.u8(self.tif as u8);
        w.u8(self.order_type as u8);
        w.u64(self.user_data);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self {
            esi: r.u32(),
            market: r.array(),
            oid: OrderIdentifier::get(r),
            client_order_id: r.array(),
            price: r.u64(),
            size: r.u32(),
            side: Side::from_u8(r.u8()),
            tif: TimeInForce::from_u8(r.u8()),
            order_type: OrderType::from_u8(r.u8()),
            user_data: r.u64(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrderAckBody {
    pub oid: OrderIdentifier,
    pub open_size: u32,
    pub exchange_ts: u64,
}

impl WireBody for OrderAckBody {
    const LEN: usize = OrderIdentifier::LEN + 4 + 8;

    fn put(&self, w: &mut FieldWriter<'_>) {
        self.oid.put(w);
        w.u32(self.open_size);
        w.u64(self.exchange_ts);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self { oid: OrderIdentifier::get(r), open_size: r.u32(), exchange_ts: r.u64() }
    }
}

/// Body of `OrderPartialFill` and `OrderFill`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrderFillBody {
    pub oid: OrderIdentifier,
    pub filled_qty: u32,
    pub filled_price: Price,
    /// Venue liquidity flag, raw.
    pub fee_code: u32,
    pub exchange_ts: u64,
}

impl WireBody for OrderFillBody {
    const LEN: usize = OrderIdentifier::LEN + 4 + 8 + 4 + 8;

    fn put(&self, w: &mut FieldWriter<'_>) {
        self.oid.put(w);
        w.u32(self.filled_qty);
        w.u64(self.filled_price);
        w.u32(self.fee_code);
        w.u64(self.exchange_ts);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self {
            oid: OrderIdentifier::get(r),
            filled_qty: r.u32(),
            filled_price: r.u64(),
            fee_code: r.u32(),
            exchange_ts: r.u64(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrderCancelRequestBody {
    pub oid: OrderIdentifier,
    pub new_qty: u32,
}

impl WireBody for OrderCancelRequestBody {
    const LEN: usize = OrderIdentifier::LEN + 4;

    fn put(&self, w: &mut FieldWriter<'_>) {
        self.oid.put(w);
        w.u32(self.new_qty);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self { oid: OrderIdentifier::get(r), new_qty: r.u32() }
    }
}

/// Body of `OrderPartialCancel` and `OrderCancel`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrderCancelBody {
    pub oid: OrderIdentifier,
    pub cancelled_qty: u32,
    pub exchange_ts: u64,
}

impl WireBody for OrderCancelBody {
    const LEN: usize = OrderIdentifier::LEN + 4 + 8;

    fn put(&self, w: &mut FieldWriter<'_>) {
        self.oid.put(w);
        w.u32(self.cancelled_qty);
        w.u64(self.exchange_ts);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self { oid: OrderIdentifier::get(r), cancelled_qty: r.u32(), exchange_ts: r.u64() }
    }
}

/// Body of `OrderCancelReplaceRequest` and `OrderCancelReplace`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrderCancelReplaceBody {
    pub old_oid: OrderIdentifier,
    pub new_order: NewOrderBody,
}

impl WireBody for OrderCancelReplaceBody {
    const LEN: usize = OrderIdentifier::LEN + NewOrderBody::LEN;

    fn put(&self, w: &mut FieldWriter<'_>) {
        self.old_oid.put(w);
        self.new_order.put(w);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self { old_oid: OrderIdentifier::get(r), new_order: NewOrderBody::get(r) }
    }
}

/// Body of `OrderRemoteReject` and `OrderCancelReject`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrderRejectBody {
    pub oid: OrderIdentifier,
    pub exchange_ts: u64,
}

impl WireBody for OrderRejectBody {
    const LEN: usize = OrderIdentifier::LEN + 8;

    fn put(&self, w: &mut FieldWriter<'_>) {
        self.oid.put(w);
        w.u64(self.exchange_ts);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self { oid: OrderIdentifier::get(r), exchange_ts: r.u64() }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrderDestroyBody {
    pub oid: OrderIdentifier,
}

impl WireBody for OrderDestroyBody {
    const LEN: usize = OrderIdentifier::LEN;

    fn put(&self, w: &mut FieldWriter<'_>) {
        self.oid.put(w);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self { oid: OrderIdentifier::get(r) }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PositionBody {
    /// Engine that reported the position.
    pub source: u8,
    pub instrument: NewInstrumentBody,
    pub qty: i64,
    pub avg_price: Price,
    pub mark_price: Price,
}

impl WireBody for PositionBody {
    const LEN: usize = 1 + NewInstrumentBody::LEN + 8 + 8 + 8;

    fn put(&self, w: &mut FieldWriter<'_>) {
        w.u8(self.source);
        self.instrument.put(w);
        w.i64(self.qty);
        w.u64(self.avg_price);
        w.u64(self.mark_price);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self {
            source: r.u8(),
            instrument: NewInstrumentBody::get(r),
            qty: r.i64(),
            avg_price: r.u64(),
            mark_price: r.u64(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ManualPositionAdjBody {
    pub esi: u32,
    pub delta_trading_qty: i32,
    pub delta_start_qty: i32,
}

impl WireBody for ManualPositionAdjBody {
    const LEN: usize = 4 + 4 + 4;

    fn put(&self, w: &mut FieldWriter<'_>) {
        w.u32(self.esi);
        w.i32(self.delta_trading_qty);
        w.i32(self.delta_start_qty);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self { esi: r.u32(), delta_trading_qty: r.i32(), delta_start_qty: r.i32() }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NewSessionBody {
    pub name: [u8; 8],
    pub market: [u8; 4],
}

impl WireBody for NewSessionBody {
    const LEN: usize = 8 + 4;

    fn put(&self, w: &mut FieldWriter<'_>) {
        w.bytes(&self.name);
        w.bytes(&self.market);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self { name: r.array(), market: r.array() }
    }
}

/// Strategy/account definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewAccountBody {
    pub local_account: u16,
    pub name: [u8; 256],
}

impl NewAccountBody {
    pub fn new(local_account: u16, name: &str) -> Self {
        Self { local_account, name: fixed(name) }
    }
}

impl WireBody for NewAccountBody {
    const LEN: usize = 2 + 256;

    fn put(&self, w: &mut FieldWriter<'_>) {
        w.u16(self.local_account);
        w.bytes(&self.name);
    }

    fn get(r: &mut FieldReader<'_>) -> Self {
        Self { local_account: r.u16(), name: r.array() }
    }
}

// ============================================================================
// Decoded records
// ============================================================================

/// One decoded record. Variable parts borrow from the log buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Record<'a> {
    Timestamp(TimestampBody),
    StartOfLog(FileHeader),
    EndOfLog(FileTrailer),
    NewInstrument(NewInstrumentBody),
    NewOrder(NewOrderBody),
    OrderLocalReject(NewOrderBody),
    OrderSent(NewOrderBody),
    OrderAck(OrderAckBody),
    OrderPartialFill(OrderFillBody),
    OrderFill(OrderFillBody),
    OrderCancelRequest(OrderCancelRequestBody),
    OrderPartialCancel(OrderCancelBody),
    OrderCancel(OrderCancelBody),
    OrderCancelReplaceRequest(OrderCancelReplaceBody),
    OrderCancelReplace(OrderCancelReplaceBody),
    OrderRemoteReject(OrderRejectBody),
    OrderCancelReject(OrderRejectBody),
    OrderDestroy(OrderDestroyBody),
    Position(PositionBody),
    ManualPositionAdj(ManualPositionAdjBody),
    NewSession(NewSessionBody),
    OrderSessionData { oid: OrderIdentifier, data: &'a [u8] },
    NewAccount(NewAccountBody),
    /// A kind code this build does not know. The body is skipped.
    Unknown { code: u8, body: &'a [u8] },
}

impl<'a> Record<'a> {
    /// Decode a body of kind `code`.
    ///
    /// Returns `None` if `code` is a known kind whose body is shorter than
    /// its fixed size. Code 0 decodes as [`Record::Unknown`]; the stream
    /// decoder never gets that far with it.
    pub fn parse(code: u8, body: &'a [u8]) -> Option<Self> {
        let kind = match RecordKind::from_u8(code) {
            Some(RecordKind::Unknown) | None => return Some(Record::Unknown { code, body }),
            Some(kind) => kind,
        };
        if body.len() < kind.min_body_len() {
            return None;
        }

        use RecordKind as K;
        Some(match kind {
            K::Unknown => Record::Unknown { code, body },
            K::Timestamp => Record::Timestamp(WireBody::decode(body)?),
            K::StartOfLog => Record::StartOfLog(WireBody::decode(body)?),
            K::EndOfLog => Record::EndOfLog(WireBody::decode(body)?),
            K::NewInstrument => Record::NewInstrument(WireBody::decode(body)?),
            K::NewOrder => Record::NewOrder(WireBody::decode(body)?),
            K::OrderLocalReject => Record::OrderLocalReject(WireBody::decode(body)?),
            K::OrderSent => Record::OrderSent(WireBody::decode(body)?),
            K::OrderAck => Record::OrderAck(WireBody::decode(body)?),
            K::OrderPartialFill => Record::OrderPartialFill(WireBody::decode(body)?),
            K::OrderFill => Record::OrderFill(WireBody::decode(body)?),
            K::OrderCancelRequest => Record::OrderCancelRequest(WireBody::decode(body)?),
            K::OrderPartialCancel => Record::OrderPartialCancel(WireBody::decode(body)?),
            K::OrderCancel => Record::OrderCancel(WireBody::decode(body)?),
            K::OrderCancelReplaceRequest => Record::OrderCancelReplaceRequest(WireBody::decode(body)?),
            K::OrderCancelReplace => Record::OrderCancelReplace(WireBody::decode(body)?),
            K::OrderRemoteReject => Record::OrderRemoteReject(WireBody::decode(body)?),
            K::OrderCancelReject => Record::OrderCancelReject(WireBody::decode(body)?),
            K::OrderDestroy => Record::OrderDestroy(WireBody::decode(body)?),
            K::Position => Record::Position(WireBody::decode(body)?),
            K::ManualPositionAdj => Record::ManualPositionAdj(WireBody::decode(body)?),
            K::NewSession => Record::NewSession(WireBody::decode(body)?),
            K::OrderSessionData => {
                let mut r = FieldReader::new(body);
                let oid = OrderIdentifier::get(&mut r);
                Record::OrderSessionData { oid, data: r.rest() }
            }
            K::NewAccount => Record::NewAccount(WireBody::decode(body)?),
        })
    }

    /// The kind this record was decoded as.
    pub fn kind(&self) -> RecordKind {
        use RecordKind as K;
        match self {
            Record::Timestamp(_) => K::Timestamp,
            Record::StartOfLog(_) => K::StartOfLog,
            Record::EndOfLog(_) => K::EndOfLog,
            Record::NewInstrument(_) => K::NewInstrument,
            Record::NewOrder(_) => K::NewOrder,
            Record::OrderLocalReject(_) => K::OrderLocalReject,
            Record::OrderSent(_) => K::OrderSent,
            Record::OrderAck(_) => K::OrderAck,
            Record::OrderPartialFill(_) => K::OrderPartialFill,
            Record::OrderFill(_) => K::OrderFill,
            Record::OrderCancelRequest(_) => K::OrderCancelRequest,
            Record::OrderPartialCancel(_) => K::OrderPartialCancel,
            Record::OrderCancel(_) => K::OrderCancel,
            Record::OrderCancelReplaceRequest(_) => K::OrderCancelReplaceRequest,
            Record::OrderCancelReplace(_) => K::OrderCancelReplace,
            Record::OrderRemoteReject(_) => K::OrderRemoteReject,
            Record::OrderCancelReject(_) => K::OrderCancelReject,
            Record::OrderDestroy(_) => K::OrderDestroy,
            Record::Position(_) => K::Position,
            Record::ManualPositionAdj(_) => K::ManualPositionAdj,
            Record::NewSession(_) => K::NewSession,
            Record::OrderSessionData { .. } => K::OrderSessionData,
            Record::NewAccount(_) => K::NewAccount,
            Record::Unknown { .. } => K::Unknown,
        }
    }

    /// Encode this record with `timestamp` into a fresh buffer.
    pub fn to_bytes(&self, timestamp: u64) -> Vec<u8> {
        let kind = self.kind();
        match *self {
            Record::Timestamp(b) => encode_record(kind, timestamp, &b).to_vec(),
            Record::StartOfLog(b) => encode_record(kind, timestamp, &b).to_vec(),
            Record::EndOfLog(b) => encode_record(kind, timestamp, &b).to_vec(),
            Record::NewInstrument(b) => encode_record(kind, timestamp, &b).to_vec(),
            Record::NewOrder(b) | Record::OrderLocalReject(b) | Record::OrderSent(b) => {
                encode_record(kind, timestamp, &b).to_vec()
            }
            Record::OrderAck(b) => encode_record(kind, timestamp, &b).to_vec(),
            Record::OrderPartialFill(b) | Record::OrderFill(b) => {
                encode_record(kind, timestamp, &b).to_vec()
            }
            Record::OrderCancelRequest(b) => encode_record(kind, timestamp, &b).to_vec(),
            Record::OrderPartialCancel(b) | Record::OrderCancel(b) => {
                encode_record(kind, timestamp, &b).to_vec()
            }
            Record::OrderCancelReplaceRequest(b) | Record::OrderCancelReplace(b) => {
                encode_record(kind, timestamp, &b).to_vec()
            }
            Record::OrderRemoteReject(b) | Record::OrderCancelReject(b) => {
                encode_record(kind, timestamp, &b).to_vec()
            }
            Record::OrderDestroy(b) => encode_record(kind, timestamp, &b).to_vec(),
            Record::Position(b) => encode_record(kind, timestamp, &b).to_vec(),
            Record::ManualPositionAdj(b) => encode_record(kind, timestamp, &b).to_vec(),
            Record::NewSession(b) => encode_record(kind, timestamp, &b).to_vec(),
            Record::OrderSessionData { oid, data } => encode_session_data(timestamp, &oid, data),
            Record::NewAccount(b) => encode_record(kind, timestamp, &b).to_vec(),
            Record::Unknown { code, body } => {
                let header = RecordHeader { body_len: body.len() as u16, kind: code, subtype: 0, timestamp };
                let mut out = Vec::with_capacity(HEADER_LEN + body.len());
                out.extend_from_slice(&header.to_bytes());
                out.extend_from_slice(body);
                out
            }
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Build the record image for a fixed-size body on the stack.
///
/// The image is meant to be appended with a single
/// [`AppendLog::write`](crate::AppendLog::write) so the record lands
/// contiguously.
#[inline]
pub fn encode_record<B: WireBody>(
    kind: RecordKind,
    timestamp: u64,
    body: &B,
) -> ArrayVec<u8, MAX_RECORD_LEN> {
    debug_assert!(B::LEN <= MAX_BODY_LEN);
    debug_assert!(kind != RecordKind::Unknown);

    let len = HEADER_LEN + B::LEN;
    let mut buf = [0u8; MAX_RECORD_LEN];
    buf[..HEADER_LEN].copy_from_slice(&RecordHeader::new(kind, B::LEN as u16, timestamp).to_bytes());
    body.put(&mut FieldWriter::new(&mut buf[HEADER_LEN..len]));

    let mut image = ArrayVec::from(buf);
    image.truncate(len);
    image
}

/// Build an `OrderSessionData` record: the order identifier followed by
/// opaque venue session bytes.
///
/// `data` is cut short if the body would exceed `u16::MAX` bytes.
pub fn encode_session_data(timestamp: u64, oid: &OrderIdentifier, data: &[u8]) -> Vec<u8> {
    let data = &data[..data.len().min(u16::MAX as usize - OrderIdentifier::LEN)];
    let body_len = OrderIdentifier::LEN + data.len();

    let mut out = vec![0u8; HEADER_LEN + body_len];
    out[..HEADER_LEN].copy_from_slice(
        &RecordHeader::new(RecordKind::OrderSessionData, body_len as u16, timestamp).to_bytes(),
    );
    oid.put(&mut FieldWriter::new(&mut out[HEADER_LEN..HEADER_LEN + OrderIdentifier::LEN]));
    out[HEADER_LEN + OrderIdentifier::LEN..].copy_from_slice(data);
    out
}
