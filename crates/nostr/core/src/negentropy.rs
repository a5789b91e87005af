//! NIP-77: Negentropy Syncing
//!
//! Range-Based Set Reconciliation over `(created_at, id)` records. Both
//! parties hold a sorted [`NegentropyStorage`]; the initiator opens with a
//! message covering the whole id space and the two sides alternate, each
//! round narrowing to the sub-ranges whose fingerprints differ. The
//! initiator collects `have_ids` (only local) and `need_ids` (only remote).
//!
//! Messages are hex-encoded binary using the Negentropy Protocol V1 format.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;

/// Negentropy error types
#[derive(Debug, Error)]
pub enum NegentropyError {
    #[error("Invalid protocol version: {0:#04x}")]
    InvalidProtocolVersion(u8),

    #[error("Invalid mode: {0}")]
    InvalidMode(u64),

    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("Varint decode error: {0}")]
    VarintDecode(String),

    #[error("Invalid bound: {0}")]
    InvalidBound(String),

    #[error("Unexpected end of message: {0}")]
    UnexpectedEnd(&'static str),

    #[error("Frame size limit too small: {0}")]
    FrameSizeLimitTooSmall(usize),

    #[error("reconcile called before initiate on the initiating side")]
    NotInitiated,
}

pub type Result<T> = std::result::Result<T, NegentropyError>;

/// Negentropy Protocol Version 1
pub const PROTOCOL_VERSION_1: u8 = 0x61;

/// Special infinity timestamp value
pub const TIMESTAMP_INFINITY: u64 = u64::MAX;

pub const FINGERPRINT_SIZE: usize = 16;
pub const ID_SIZE: usize = 32;

/// Below this, a frame size limit cannot fit a single range.
const MIN_FRAME_SIZE_LIMIT: usize = 4096;

/// Room kept free for the trailing fingerprint range when a frame is cut short.
const FRAME_SIZE_SLACK: usize = 200;

/// A 256-bit event ID
pub type Id = [u8; ID_SIZE];

/// Encode a varint (variable-length unsigned integer)
///
/// Varints are represented as base-128 digits, most significant digit first.
/// Bit 7 (high bit) is set on each byte except the last.
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    if value == 0 {
        out.push(0);
        return;
    }

    let mut digits = Vec::with_capacity(10);
    while value > 0 {
        digits.push((value & 0x7F) as u8);
        value >>= 7;
    }

    let last = digits.len() - 1;
    for (i, &digit) in digits.iter().rev().enumerate() {
        out.push(if i < last { digit | 0x80 } else { digit });
    }
}

/// Decode a varint from a byte slice
///
/// Returns (value, bytes_consumed)
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize)> {
    if data.is_empty() {
        return Err(NegentropyError::VarintDecode("empty data".to_string()));
    }

    let mut value: u64 = 0;

    for (i, &byte) in data.iter().enumerate() {
        if i >= 10 {
            return Err(NegentropyError::VarintDecode(
                "varint too long (max 10 bytes for u64)".to_string(),
            ));
        }
        if value > (u64::MAX >> 7) {
            return Err(NegentropyError::VarintDecode("varint overflow".to_string()));
        }

        value = (value << 7) | u64::from(byte & 0x7F);

        if (byte & 0x80) == 0 {
            return Ok((value, i + 1));
        }
    }

    Err(NegentropyError::VarintDecode("incomplete varint".to_string()))
}

/// A record in the Negentropy protocol (timestamp + ID).
///
/// The derived ordering sorts by timestamp, then by ID lexically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Record {
    pub timestamp: u64,
    pub id: Id,
}

impl Record {
    pub fn new(timestamp: u64, id: Id) -> Self {
        Self { timestamp, id }
    }
}

/// A timestamp and ID prefix bound for ranges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    /// The timestamp (u64::MAX for infinity)
    pub timestamp: u64,
    /// The ID prefix (0-32 bytes)
    pub id_prefix: Vec<u8>,
}

impl Bound {
    pub fn new(timestamp: u64, id_prefix: Vec<u8>) -> Result<Self> {
        if id_prefix.len() > ID_SIZE {
            return Err(NegentropyError::InvalidBound(format!(
                "ID prefix too long: {} bytes (max 32)",
                id_prefix.len()
            )));
        }
        Ok(Self {
            timestamp,
            id_prefix,
        })
    }

    pub fn zero() -> Self {
        Self {
            timestamp: 0,
            id_prefix: vec![],
        }
    }

    pub fn infinity() -> Self {
        Self {
            timestamp: TIMESTAMP_INFINITY,
            id_prefix: vec![],
        }
    }

    /// The shortest bound that sorts after `prev` and at or before `curr`.
    pub fn between(prev: &Record, curr: &Record) -> Self {
        if curr.timestamp != prev.timestamp {
            return Self {
                timestamp: curr.timestamp,
                id_prefix: vec![],
            };
        }

        let shared = prev
            .id
            .iter()
            .zip(curr.id.iter())
            .take_while(|(a, b)| a == b)
            .count();
        Self {
            timestamp: curr.timestamp,
            id_prefix: curr.id[..(shared + 1).min(ID_SIZE)].to_vec(),
        }
    }

    /// Whether `record` sorts strictly before this bound. A prefix bound
    /// behaves like the full id padded with zero bytes.
    fn is_after(&self, record: &Record) -> bool {
        if record.timestamp != self.timestamp {
            return record.timestamp < self.timestamp;
        }
        let mut padded = [0u8; ID_SIZE];
        padded[..self.id_prefix.len()].copy_from_slice(&self.id_prefix);
        record.id < padded
    }
}

/// Range mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMode {
    /// Skip this range (mode 0)
    Skip,
    /// Fingerprint mode (mode 1)
    Fingerprint,
    /// ID list mode (mode 2)
    IdList,
}

impl RangeMode {
    fn from_u64(value: u64) -> Result<Self> {
        match value {
            0 => Ok(Self::Skip),
            1 => Ok(Self::Fingerprint),
            2 => Ok(Self::IdList),
            _ => Err(NegentropyError::InvalidMode(value)),
        }
    }

    fn as_u64(self) -> u64 {
        match self {
            Self::Skip => 0,
            Self::Fingerprint => 1,
            Self::IdList => 2,
        }
    }
}

/// Range payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangePayload {
    Skip,
    Fingerprint([u8; FINGERPRINT_SIZE]),
    IdList(Vec<Id>),
}

/// A range in the Negentropy protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    /// Exclusive upper bound of this range
    pub upper_bound: Bound,
    pub payload: RangePayload,
}

impl Range {
    pub fn skip(upper_bound: Bound) -> Self {
        Self {
            upper_bound,
            payload: RangePayload::Skip,
        }
    }

    pub fn fingerprint(upper_bound: Bound, fingerprint: [u8; FINGERPRINT_SIZE]) -> Self {
        Self {
            upper_bound,
            payload: RangePayload::Fingerprint(fingerprint),
        }
    }

    pub fn id_list(upper_bound: Bound, ids: Vec<Id>) -> Self {
        Self {
            upper_bound,
            payload: RangePayload::IdList(ids),
        }
    }

    fn mode(&self) -> RangeMode {
        match self.payload {
            RangePayload::Skip => RangeMode::Skip,
            RangePayload::Fingerprint(_) => RangeMode::Fingerprint,
            RangePayload::IdList(_) => RangeMode::IdList,
        }
    }
}

/// Serializes bounds with delta-encoded timestamps.
#[derive(Debug, Clone, Default)]
struct Writer {
    buf: Vec<u8>,
    last_timestamp: u64,
}

impl Writer {
    fn with_version() -> Self {
        Self {
            buf: vec![PROTOCOL_VERSION_1],
            last_timestamp: 0,
        }
    }

    fn timestamp(&mut self, timestamp: u64) {
        if timestamp == TIMESTAMP_INFINITY {
            self.last_timestamp = TIMESTAMP_INFINITY;
            encode_varint(0, &mut self.buf);
            return;
        }
        let delta = timestamp.saturating_sub(self.last_timestamp);
        self.last_timestamp = timestamp;
        encode_varint(delta + 1, &mut self.buf);
    }

    fn bound(&mut self, bound: &Bound) {
        self.timestamp(bound.timestamp);
        encode_varint(bound.id_prefix.len() as u64, &mut self.buf);
        self.buf.extend_from_slice(&bound.id_prefix);
    }

    fn range(&mut self, range: &Range) {
        self.bound(&range.upper_bound);
        encode_varint(range.mode().as_u64(), &mut self.buf);
        match &range.payload {
            RangePayload::Skip => {}
            RangePayload::Fingerprint(fp) => self.buf.extend_from_slice(fp),
            RangePayload::IdList(ids) => {
                encode_varint(ids.len() as u64, &mut self.buf);
                for id in ids {
                    self.buf.extend_from_slice(id);
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }
}

/// Parses bounds with delta-encoded timestamps.
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
    last_timestamp: u64,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            last_timestamp: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.offset)
            .ok_or(NegentropyError::UnexpectedEnd("byte"))?;
        self.offset += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        if self.offset + n > self.data.len() {
            return Err(NegentropyError::UnexpectedEnd(what));
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64> {
        let (value, len) = decode_varint(&self.data[self.offset..])?;
        self.offset += len;
        Ok(value)
    }

    fn timestamp(&mut self) -> Result<u64> {
        let encoded = self.varint()?;
        if encoded == 0 || self.last_timestamp == TIMESTAMP_INFINITY {
            self.last_timestamp = TIMESTAMP_INFINITY;
            return Ok(TIMESTAMP_INFINITY);
        }
        let timestamp = self.last_timestamp.saturating_add(encoded - 1);
        self.last_timestamp = timestamp;
        Ok(timestamp)
    }

    fn bound(&mut self) -> Result<Bound> {
        let timestamp = self.timestamp()?;
        let len = self.varint()?;
        if len > ID_SIZE as u64 {
            return Err(NegentropyError::InvalidBound(format!(
                "ID prefix length too long: {}",
                len
            )));
        }
        let prefix = self.bytes(len as usize, "id prefix")?;
        Bound::new(timestamp, prefix.to_vec())
    }

    fn fingerprint(&mut self) -> Result<[u8; FINGERPRINT_SIZE]> {
        let mut fp = [0u8; FINGERPRINT_SIZE];
        fp.copy_from_slice(self.bytes(FINGERPRINT_SIZE, "fingerprint")?);
        Ok(fp)
    }

    fn id(&mut self) -> Result<Id> {
        let mut id = [0u8; ID_SIZE];
        id.copy_from_slice(self.bytes(ID_SIZE, "id")?);
        Ok(id)
    }

    fn range(&mut self) -> Result<Range> {
        let upper_bound = self.bound()?;
        let payload = match RangeMode::from_u64(self.varint()?)? {
            RangeMode::Skip => RangePayload::Skip,
            RangeMode::Fingerprint => RangePayload::Fingerprint(self.fingerprint()?),
            RangeMode::IdList => {
                let count = self.varint()?;
                let mut ids = Vec::new();
                for _ in 0..count {
                    ids.push(self.id()?);
                }
                RangePayload::IdList(ids)
            }
        };
        Ok(Range {
            upper_bound,
            payload,
        })
    }
}

/// A decoded Negentropy protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegentropyMessage {
    /// Protocol version (0x61 for V1)
    pub version: u8,
    /// Ordered list of ranges
    pub ranges: Vec<Range>,
}

impl NegentropyMessage {
    pub fn new(ranges: Vec<Range>) -> Self {
        Self {
            version: PROTOCOL_VERSION_1,
            ranges,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = Writer {
            buf: vec![self.version],
            last_timestamp: 0,
        };
        for range in &self.ranges {
            writer.range(range);
        }
        writer.buf
    }

    pub fn encode_hex(&self) -> String {
        hex::encode(self.encode())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let version = reader.byte().map_err(|_| NegentropyError::InvalidProtocolVersion(0))?;
        if version != PROTOCOL_VERSION_1 {
            return Err(NegentropyError::InvalidProtocolVersion(version));
        }

        let mut ranges = Vec::new();
        while !reader.is_empty() {
            ranges.push(reader.range()?);
        }
        Ok(Self { version, ranges })
    }

    pub fn decode_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str).map_err(|e| NegentropyError::InvalidHex(e.to_string()))?;
        Self::decode(&bytes)
    }
}

/// Calculate the fingerprint for a set of event IDs
///
/// The fingerprint algorithm:
/// 1. Compute addition mod 2^256 of element IDs (as 32-byte little-endian unsigned integers)
/// 2. Concatenate with the number of elements, encoded as a varint
/// 3. Hash with SHA-256
/// 4. Take the first 16 bytes
pub fn calculate_fingerprint<'a>(ids: impl IntoIterator<Item = &'a Id>) -> [u8; FINGERPRINT_SIZE] {
    let mut sum = [0u8; ID_SIZE];
    let mut count: u64 = 0;

    for id in ids {
        let mut carry = 0u16;
        for i in 0..ID_SIZE {
            let s = u16::from(sum[i]) + u16::from(id[i]) + carry;
            sum[i] = s as u8;
            carry = s >> 8;
        }
        count += 1;
    }

    let mut to_hash = Vec::with_capacity(ID_SIZE + 10);
    to_hash.extend_from_slice(&sum);
    encode_varint(count, &mut to_hash);

    let hash = Sha256::digest(&to_hash);
    let mut fingerprint = [0u8; FINGERPRINT_SIZE];
    fingerprint.copy_from_slice(&hash[..FINGERPRINT_SIZE]);
    fingerprint
}

/// Sorted, de-duplicated record set one side reconciles from.
#[derive(Debug, Clone, Default)]
pub struct NegentropyStorage {
    records: Vec<Record>,
}

impl NegentropyStorage {
    pub fn new(records: impl IntoIterator<Item = Record>) -> Self {
        let mut records: Vec<Record> = records.into_iter().collect();
        records.sort_unstable();
        records.dedup();
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// First index in `[begin, end)` whose record is not below `bound`.
    fn lower_bound(&self, begin: usize, end: usize, bound: &Bound) -> usize {
        begin + self.records[begin..end].partition_point(|record| bound.is_after(record))
    }

    fn fingerprint(&self, begin: usize, end: usize) -> [u8; FINGERPRINT_SIZE] {
        calculate_fingerprint(self.records[begin..end].iter().map(|r| &r.id))
    }
}

/// Reconciliation tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegentropyConfig {
    /// Maximum encoded message size in bytes (0 = unlimited)
    pub frame_size_limit: usize,
    /// Ranges with at most this many records are sent as id lists
    pub id_list_threshold: usize,
    /// Number of fingerprint sub-ranges a differing range is split into
    pub split_count: usize,
}

impl Default for NegentropyConfig {
    fn default() -> Self {
        Self {
            frame_size_limit: 32 * 1024,
            id_list_threshold: 16,
            split_count: 4,
        }
    }
}

/// One side of a reconciliation session.
#[derive(Debug)]
pub struct Negentropy {
    storage: NegentropyStorage,
    config: NegentropyConfig,
    is_initiator: bool,
    have_ids: Vec<Id>,
    need_ids: Vec<Id>,
}

impl Negentropy {
    pub fn new(storage: NegentropyStorage, config: NegentropyConfig) -> Result<Self> {
        if config.frame_size_limit != 0 && config.frame_size_limit < MIN_FRAME_SIZE_LIMIT {
            return Err(NegentropyError::FrameSizeLimitTooSmall(config.frame_size_limit));
        }
        Ok(Self {
            storage,
            config: NegentropyConfig {
                split_count: config.split_count.max(2),
                ..config
            },
            is_initiator: false,
            have_ids: Vec::new(),
            need_ids: Vec::new(),
        })
    }

    /// Build the opening message covering the entire id space.
    pub fn initiate(&mut self) -> Vec<u8> {
        self.is_initiator = true;
        let mut writer = Writer::with_version();
        self.split_range(0, self.storage.len(), &Bound::infinity(), &mut writer);
        writer.buf
    }

    pub fn initiate_hex(&mut self) -> String {
        hex::encode(self.initiate())
    }

    /// Initiator side: process a response. `None` means reconciliation is
    /// complete and `have_ids`/`need_ids` are final.
    pub fn reconcile(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>> {
        if !self.is_initiator {
            return Err(NegentropyError::NotInitiated);
        }
        let output = self.reconcile_aux(message)?;
        if output.len() == 1 {
            Ok(None)
        } else {
            Ok(Some(output))
        }
    }

    pub fn reconcile_hex(&mut self, message: &str) -> Result<Option<String>> {
        let bytes = hex::decode(message).map_err(|e| NegentropyError::InvalidHex(e.to_string()))?;
        Ok(self.reconcile(&bytes)?.map(hex::encode))
    }

    /// Responder side: answer one query. The answer always goes back to the
    /// initiator, even when it only carries the version byte.
    pub fn respond(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        self.is_initiator = false;
        self.reconcile_aux(message)
    }

    pub fn respond_hex(&mut self, message: &str) -> Result<String> {
        let bytes = hex::decode(message).map_err(|e| NegentropyError::InvalidHex(e.to_string()))?;
        Ok(hex::encode(self.respond(&bytes)?))
    }

    /// IDs we have that the other side lacks.
    pub fn have_ids(&self) -> &[Id] {
        &self.have_ids
    }

    /// IDs the other side has that we lack.
    pub fn need_ids(&self) -> &[Id] {
        &self.need_ids
    }

    fn reconcile_aux(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let mut reader = Reader::new(message);
        let version = reader.byte().map_err(|_| NegentropyError::InvalidProtocolVersion(0))?;
        if version != PROTOCOL_VERSION_1 {
            return Err(NegentropyError::InvalidProtocolVersion(version));
        }

        let mut out = Writer::with_version();
        let mut prev_bound = Bound::zero();
        let mut prev_index = 0usize;
        let mut pending_skip = false;
        let size = self.storage.len();

        while !reader.is_empty() {
            let checkpoint = (out.buf.len(), out.last_timestamp);

            let curr_bound = reader.bound()?;
            let mode = RangeMode::from_u64(reader.varint()?)?;

            let lower = prev_index;
            let upper = self.storage.lower_bound(prev_index, size, &curr_bound);

            match mode {
                RangeMode::Skip => pending_skip = true,
                RangeMode::Fingerprint => {
                    let theirs = reader.fingerprint()?;
                    if theirs == self.storage.fingerprint(lower, upper) {
                        pending_skip = true;
                    } else {
                        flush_skip(&mut pending_skip, &prev_bound, &mut out);
                        self.split_range(lower, upper, &curr_bound, &mut out);
                    }
                }
                RangeMode::IdList => {
                    let count = reader.varint()?;
                    let mut theirs = HashSet::new();
                    for _ in 0..count {
                        theirs.insert(reader.id()?);
                    }

                    if self.is_initiator {
                        for record in &self.storage.records()[lower..upper] {
                            if !theirs.remove(&record.id) {
                                self.have_ids.push(record.id);
                            }
                        }
                        self.need_ids.extend(theirs);
                        pending_skip = true;
                    } else {
                        flush_skip(&mut pending_skip, &prev_bound, &mut out);
                        let count = upper - lower;
                        if count > self.config.id_list_threshold
                            && self.exceeds_frame_limit(out.len() + count * ID_SIZE + 64)
                        {
                            // Too many to list in one frame: narrow it down instead.
                            self.split_range(lower, upper, &curr_bound, &mut out);
                        } else {
                            let ids = self.storage.records()[lower..upper]
                                .iter()
                                .map(|r| r.id)
                                .collect();
                            out.range(&Range::id_list(curr_bound.clone(), ids));
                        }
                    }
                }
            }

            if self.exceeds_frame_limit(out.len()) {
                // Drop this range and hand the remainder back as one fingerprint.
                out.buf.truncate(checkpoint.0);
                out.last_timestamp = checkpoint.1;
                flush_skip(&mut pending_skip, &prev_bound, &mut out);
                let remaining = self.storage.fingerprint(lower, size);
                out.range(&Range::fingerprint(Bound::infinity(), remaining));
                break;
            }

            prev_index = upper;
            prev_bound = curr_bound;
        }

        Ok(out.buf)
    }

    fn split_range(&self, lower: usize, upper: usize, upper_bound: &Bound, out: &mut Writer) {
        let count = upper - lower;
        let buckets = self.config.split_count;

        if count <= self.config.id_list_threshold || count < buckets {
            let ids = self.storage.records()[lower..upper]
                .iter()
                .map(|r| r.id)
                .collect();
            out.range(&Range::id_list(upper_bound.clone(), ids));
            return;
        }

        let per_bucket = count / buckets;
        let extra = count % buckets;
        let mut curr = lower;

        for i in 0..buckets {
            let bucket_size = per_bucket + usize::from(i < extra);
            let fingerprint = self.storage.fingerprint(curr, curr + bucket_size);
            curr += bucket_size;

            let next_bound = if curr == upper {
                upper_bound.clone()
            } else {
                let records = self.storage.records();
                Bound::between(&records[curr - 1], &records[curr])
            };
            out.range(&Range::fingerprint(next_bound, fingerprint));
        }
    }

    fn exceeds_frame_limit(&self, len: usize) -> bool {
        self.config.frame_size_limit != 0 && len > self.config.frame_size_limit - FRAME_SIZE_SLACK
    }
}

fn flush_skip(pending: &mut bool, bound: &Bound, out: &mut Writer) {
    if *pending {
        *pending = false;
        out.range(&Range::skip(bound.clone()));
    }
}
