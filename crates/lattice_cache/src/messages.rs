//! Wire messages of the atomic update pipeline and their binary codec.
//!
//! ## Wire format
//!
//! All integers are fixed-width little-endian. Byte strings and arrays are
//! length-prefixed with a `u32`. Optional fields carry a one-byte presence
//! flag. A message frame is a one-byte tag followed by the message body:
//!
//! ```text
//! ┌─────────┬──────────────────────────────┐
//! │ Tag (1) │            Body              │
//! └─────────┴──────────────────────────────┘
//! ```
//!
//! A `CacheVersion` is 21 bytes: `topology_version (8) + order (8) +
//! node_order (4) + data_center_id (1)`.

use crate::config::{WriteOrder, WriteSync};
use crate::error::{CacheError, Result};
use crate::version::CacheVersion;

/// Maximum decoded body size (64 MB). Anything larger is a protocol error.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Update operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Update,
    Delete,
    Transform,
}

/// Named transform shipped to the primary and resolved there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformSpec {
    pub name: String,
    pub arg: Vec<u8>,
}

/// Entry predicate evaluated under the entry lock before an update applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryFilter {
    /// Entry must currently hold a value (replace semantics).
    HasValue,
    /// Entry must currently hold no value (put-if-absent semantics).
    NoValue,
    /// Entry value must equal the given bytes (compare-and-set semantics).
    ValueEquals(Vec<u8>),
}

/// Per-key cross-data-center conflict info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictInfo {
    /// Explicit ttl, `-1` when unset.
    pub ttl_ms: i64,
    /// Explicit absolute expiry, `-1` when unset.
    pub expire_time_ms: i64,
    pub version: CacheVersion,
}

/// Old-value/success pair returned for single-key operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheReturn {
    pub value: Option<Vec<u8>>,
    pub success: bool,
}

/// One per-key failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedKey {
    pub key: Vec<u8>,
    pub code: u8,
    pub message: String,
}

impl FailedKey {
    pub fn new(key: Vec<u8>, err: &CacheError) -> Self {
        Self {
            key,
            code: err.code(),
            message: err.wire_message(),
        }
    }

    pub fn error(&self) -> CacheError {
        CacheError::from_code(self.code, self.message.clone())
    }
}

/// Request from the originating (near) node to one primary.
#[derive(Debug, Clone, PartialEq)]
pub struct NearUpdateRequest {
    pub future_version: CacheVersion,
    pub topology_version: u64,
    pub sync_mode: WriteSync,
    pub order_mode: WriteOrder,
    pub operation: Operation,
    pub keys: Vec<Vec<u8>>,
    /// Parallel to `keys` for `Update`; empty for `Delete`/`Transform`.
    pub values: Vec<Option<Vec<u8>>>,
    /// Parallel to `keys` for `Transform`; empty otherwise.
    pub transforms: Vec<TransformSpec>,
    pub filter: Option<EntryFilter>,
    /// Entry time-to-live, `-1` when unset.
    pub ttl_ms: i64,
    pub return_value: bool,
    /// Fast-map request: receiver applies with the supplied write version and
    /// produces no backup fan-out.
    pub fast_map: bool,
    /// Externally-assigned write version (fast map / conflict replication).
    pub write_version: Option<CacheVersion>,
    /// Parallel to `keys`; empty when no conflict info is present.
    pub conflict: Vec<Option<ConflictInfo>>,
    /// Primary-side remap hop counter (FULL_ASYNC loop protection).
    pub hops: u8,
}

impl NearUpdateRequest {
    /// Whether any per-key conflict info is attached.
    pub fn has_conflict_info(&self) -> bool {
        self.conflict.iter().any(|c| c.is_some())
    }
}

/// Reply from a primary to the originating node.
#[derive(Debug, Clone, PartialEq)]
pub struct NearUpdateResponse {
    pub future_version: CacheVersion,
    pub return_value: Option<CacheReturn>,
    pub failed_keys: Vec<FailedKey>,
    /// Keys the originator must re-map at a newer topology. Not an error.
    pub remap_keys: Vec<Vec<u8>>,
}

impl NearUpdateResponse {
    pub fn new(future_version: CacheVersion) -> Self {
        Self {
            future_version,
            return_value: None,
            failed_keys: Vec::new(),
            remap_keys: Vec::new(),
        }
    }

    pub fn add_failed(&mut self, key: Vec<u8>, err: &CacheError) {
        self.failed_keys.push(FailedKey::new(key, err));
    }

    pub fn add_failed_all<I: IntoIterator<Item = Vec<u8>>>(&mut self, keys: I, err: &CacheError) {
        for key in keys {
            self.add_failed(key, err);
        }
    }
}

/// One backup write shipped from a primary to a backup owner.
#[derive(Debug, Clone, PartialEq)]
pub struct DhtUpdateEntry {
    pub key: Vec<u8>,
    /// `None` encodes a remove.
    pub value: Option<Vec<u8>>,
    pub conflict: Option<ConflictInfo>,
}

/// Backup-update request from a primary to one backup node.
#[derive(Debug, Clone, PartialEq)]
pub struct DhtUpdateRequest {
    pub future_version: CacheVersion,
    pub write_version: CacheVersion,
    pub sync_mode: WriteSync,
    pub topology_version: u64,
    pub ttl_ms: i64,
    pub entries: Vec<DhtUpdateEntry>,
}

/// Direct backup reply, sent when the request was FULL_SYNC or keys failed.
#[derive(Debug, Clone, PartialEq)]
pub struct DhtUpdateResponse {
    pub future_version: CacheVersion,
    pub failed_keys: Vec<FailedKey>,
}

/// Coalesced acknowledgment of many backup applies.
#[derive(Debug, Clone, PartialEq)]
pub struct DhtDeferredAckResponse {
    pub future_versions: Vec<CacheVersion>,
}

/// Single-key read forwarded to a current owner.
#[derive(Debug, Clone, PartialEq)]
pub struct GetRequest {
    pub future_version: CacheVersion,
    pub key: Vec<u8>,
}

/// Reply to a forwarded read.
#[derive(Debug, Clone, PartialEq)]
pub struct GetResponse {
    pub future_version: CacheVersion,
    pub value: Option<Vec<u8>>,
    pub error: Option<FailedKey>,
}

/// Envelope for everything that crosses the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    NearUpdateRequest(NearUpdateRequest),
    NearUpdateResponse(NearUpdateResponse),
    DhtUpdateRequest(DhtUpdateRequest),
    DhtUpdateResponse(DhtUpdateResponse),
    DhtDeferredAck(DhtDeferredAckResponse),
    GetRequest(GetRequest),
    GetResponse(GetResponse),
}

const TAG_NEAR_REQ: u8 = 1;
const TAG_NEAR_RES: u8 = 2;
const TAG_DHT_REQ: u8 = 3;
const TAG_DHT_RES: u8 = 4;
const TAG_DEFERRED_ACK: u8 = 5;
const TAG_GET_REQ: u8 = 6;
const TAG_GET_RES: u8 = 7;

impl Message {
    /// Encode the message with its leading tag byte.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        match self {
            Message::NearUpdateRequest(m) => {
                out.push(TAG_NEAR_REQ);
                encode_near_request(m, &mut out);
            }
            Message::NearUpdateResponse(m) => {
                out.push(TAG_NEAR_RES);
                encode_near_response(m, &mut out);
            }
            Message::DhtUpdateRequest(m) => {
                out.push(TAG_DHT_REQ);
                encode_dht_request(m, &mut out);
            }
            Message::DhtUpdateResponse(m) => {
                out.push(TAG_DHT_RES);
                encode_dht_response(m, &mut out);
            }
            Message::DhtDeferredAck(m) => {
                out.push(TAG_DEFERRED_ACK);
                write_u32(&mut out, m.future_versions.len() as u32);
                for ver in &m.future_versions {
                    write_version(&mut out, ver);
                }
            }
            Message::GetRequest(m) => {
                out.push(TAG_GET_REQ);
                write_version(&mut out, &m.future_version);
                write_bytes(&mut out, &m.key);
            }
            Message::GetResponse(m) => {
                out.push(TAG_GET_RES);
                write_version(&mut out, &m.future_version);
                write_opt_bytes(&mut out, m.value.as_deref());
                match &m.error {
                    None => out.push(0),
                    Some(f) => {
                        out.push(1);
                        write_failed_key(&mut out, f);
                    }
                }
            }
        }
        out
    }

    /// Decode a full message frame produced by [`Message::encode`].
    pub fn decode(data: &[u8]) -> Result<Message> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(CacheError::Protocol(format!(
                "message of {} bytes exceeds limit",
                data.len()
            )));
        }
        let mut off = 0usize;
        let tag = read_u8(data, &mut off)?;
        let msg = match tag {
            TAG_NEAR_REQ => Message::NearUpdateRequest(decode_near_request(data, &mut off)?),
            TAG_NEAR_RES => Message::NearUpdateResponse(decode_near_response(data, &mut off)?),
            TAG_DHT_REQ => Message::DhtUpdateRequest(decode_dht_request(data, &mut off)?),
            TAG_DHT_RES => Message::DhtUpdateResponse(decode_dht_response(data, &mut off)?),
            TAG_DEFERRED_ACK => {
                let count = read_u32(data, &mut off)? as usize;
                let mut future_versions = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    future_versions.push(read_version(data, &mut off)?);
                }
                Message::DhtDeferredAck(DhtDeferredAckResponse { future_versions })
            }
            TAG_GET_REQ => Message::GetRequest(GetRequest {
                future_version: read_version(data, &mut off)?,
                key: read_bytes(data, &mut off)?,
            }),
            TAG_GET_RES => {
                let future_version = read_version(data, &mut off)?;
                let value = read_opt_bytes(data, &mut off)?;
                let error = match read_u8(data, &mut off)? {
                    0 => None,
                    _ => Some(read_failed_key(data, &mut off)?),
                };
                Message::GetResponse(GetResponse {
                    future_version,
                    value,
                    error,
                })
            }
            other => {
                return Err(CacheError::Protocol(format!("unknown message tag {other}")));
            }
        };
        if off != data.len() {
            return Err(CacheError::Protocol(format!(
                "trailing garbage: {} of {} bytes consumed",
                off,
                data.len()
            )));
        }
        Ok(msg)
    }
}

fn encode_near_request(m: &NearUpdateRequest, out: &mut Vec<u8>) {
    write_version(out, &m.future_version);
    write_u64(out, m.topology_version);
    out.push(sync_code(m.sync_mode));
    out.push(order_code(m.order_mode));
    out.push(op_code(m.operation));
    write_u32(out, m.keys.len() as u32);
    for key in &m.keys {
        write_bytes(out, key);
    }
    write_u32(out, m.values.len() as u32);
    for value in &m.values {
        write_opt_bytes(out, value.as_deref());
    }
    write_u32(out, m.transforms.len() as u32);
    for t in &m.transforms {
        write_string(out, &t.name);
        write_bytes(out, &t.arg);
    }
    match &m.filter {
        None => out.push(0),
        Some(EntryFilter::HasValue) => out.push(1),
        Some(EntryFilter::NoValue) => out.push(2),
        Some(EntryFilter::ValueEquals(v)) => {
            out.push(3);
            write_bytes(out, v);
        }
    }
    write_i64(out, m.ttl_ms);
    out.push(m.return_value as u8);
    out.push(m.fast_map as u8);
    match &m.write_version {
        None => out.push(0),
        Some(v) => {
            out.push(1);
            write_version(out, v);
        }
    }
    write_u32(out, m.conflict.len() as u32);
    for c in &m.conflict {
        write_opt_conflict(out, c);
    }
    out.push(m.hops);
}

fn decode_near_request(data: &[u8], off: &mut usize) -> Result<NearUpdateRequest> {
    let future_version = read_version(data, off)?;
    let topology_version = read_u64(data, off)?;
    let sync_mode = sync_from_code(read_u8(data, off)?)?;
    let order_mode = order_from_code(read_u8(data, off)?)?;
    let operation = op_from_code(read_u8(data, off)?)?;
    let key_count = read_u32(data, off)? as usize;
    let mut keys = Vec::with_capacity(key_count.min(4096));
    for _ in 0..key_count {
        keys.push(read_bytes(data, off)?);
    }
    let value_count = read_u32(data, off)? as usize;
    let mut values = Vec::with_capacity(value_count.min(4096));
    for _ in 0..value_count {
        values.push(read_opt_bytes(data, off)?);
    }
    let transform_count = read_u32(data, off)? as usize;
    let mut transforms = Vec::with_capacity(transform_count.min(4096));
    for _ in 0..transform_count {
        transforms.push(TransformSpec {
            name: read_string(data, off)?,
            arg: read_bytes(data, off)?,
        });
    }
    let filter = match read_u8(data, off)? {
        0 => None,
        1 => Some(EntryFilter::HasValue),
        2 => Some(EntryFilter::NoValue),
        3 => Some(EntryFilter::ValueEquals(read_bytes(data, off)?)),
        other => {
            return Err(CacheError::Protocol(format!("unknown filter tag {other}")));
        }
    };
    let ttl_ms = read_i64(data, off)?;
    let return_value = read_u8(data, off)? != 0;
    let fast_map = read_u8(data, off)? != 0;
    let write_version = match read_u8(data, off)? {
        0 => None,
        _ => Some(read_version(data, off)?),
    };
    let conflict_count = read_u32(data, off)? as usize;
    let mut conflict = Vec::with_capacity(conflict_count.min(4096));
    for _ in 0..conflict_count {
        conflict.push(read_opt_conflict(data, off)?);
    }
    let hops = read_u8(data, off)?;
    Ok(NearUpdateRequest {
        future_version,
        topology_version,
        sync_mode,
        order_mode,
        operation,
        keys,
        values,
        transforms,
        filter,
        ttl_ms,
        return_value,
        fast_map,
        write_version,
        conflict,
        hops,
    })
}

fn encode_near_response(m: &NearUpdateResponse, out: &mut Vec<u8>) {
    write_version(out, &m.future_version);
    match &m.return_value {
        None => out.push(0),
        Some(ret) => {
            out.push(1);
            write_opt_bytes(out, ret.value.as_deref());
            out.push(ret.success as u8);
        }
    }
    write_u32(out, m.failed_keys.len() as u32);
    for f in &m.failed_keys {
        write_failed_key(out, f);
    }
    write_u32(out, m.remap_keys.len() as u32);
    for key in &m.remap_keys {
        write_bytes(out, key);
    }
}

fn decode_near_response(data: &[u8], off: &mut usize) -> Result<NearUpdateResponse> {
    let future_version = read_version(data, off)?;
    let return_value = match read_u8(data, off)? {
        0 => None,
        _ => {
            let value = read_opt_bytes(data, off)?;
            let success = read_u8(data, off)? != 0;
            Some(CacheReturn { value, success })
        }
    };
    let failed_count = read_u32(data, off)? as usize;
    let mut failed_keys = Vec::with_capacity(failed_count.min(4096));
    for _ in 0..failed_count {
        failed_keys.push(read_failed_key(data, off)?);
    }
    let remap_count = read_u32(data, off)? as usize;
    let mut remap_keys = Vec::with_capacity(remap_count.min(4096));
    for _ in 0..remap_count {
        remap_keys.push(read_bytes(data, off)?);
    }
    Ok(NearUpdateResponse {
        future_version,
        return_value,
        failed_keys,
        remap_keys,
    })
}

fn encode_dht_request(m: &DhtUpdateRequest, out: &mut Vec<u8>) {
    write_version(out, &m.future_version);
    write_version(out, &m.write_version);
    out.push(sync_code(m.sync_mode));
    write_u64(out, m.topology_version);
    write_i64(out, m.ttl_ms);
    write_u32(out, m.entries.len() as u32);
    for e in &m.entries {
        write_bytes(out, &e.key);
        write_opt_bytes(out, e.value.as_deref());
        write_opt_conflict(out, &e.conflict);
    }
}

fn decode_dht_request(data: &[u8], off: &mut usize) -> Result<DhtUpdateRequest> {
    let future_version = read_version(data, off)?;
    let write_version = read_version(data, off)?;
    let sync_mode = sync_from_code(read_u8(data, off)?)?;
    let topology_version = read_u64(data, off)?;
    let ttl_ms = read_i64(data, off)?;
    let entry_count = read_u32(data, off)? as usize;
    let mut entries = Vec::with_capacity(entry_count.min(4096));
    for _ in 0..entry_count {
        entries.push(DhtUpdateEntry {
            key: read_bytes(data, off)?,
            value: read_opt_bytes(data, off)?,
            conflict: read_opt_conflict(data, off)?,
        });
    }
    Ok(DhtUpdateRequest {
        future_version,
        write_version,
        sync_mode,
        topology_version,
        ttl_ms,
        entries,
    })
}

fn encode_dht_response(m: &DhtUpdateResponse, out: &mut Vec<u8>) {
    write_version(out, &m.future_version);
    write_u32(out, m.failed_keys.len() as u32);
    for f in &m.failed_keys {
        write_failed_key(out, f);
    }
}

fn decode_dht_response(data: &[u8], off: &mut usize) -> Result<DhtUpdateResponse> {
    let future_version = read_version(data, off)?;
    let failed_count = read_u32(data, off)? as usize;
    let mut failed_keys = Vec::with_capacity(failed_count.min(4096));
    for _ in 0..failed_count {
        failed_keys.push(read_failed_key(data, off)?);
    }
    Ok(DhtUpdateResponse {
        future_version,
        failed_keys,
    })
}

fn op_code(op: Operation) -> u8 {
    match op {
        Operation::Update => 0,
        Operation::Delete => 1,
        Operation::Transform => 2,
    }
}

fn op_from_code(code: u8) -> Result<Operation> {
    match code {
        0 => Ok(Operation::Update),
        1 => Ok(Operation::Delete),
        2 => Ok(Operation::Transform),
        other => Err(CacheError::Protocol(format!("unknown operation {other}"))),
    }
}

fn sync_code(mode: WriteSync) -> u8 {
    match mode {
        WriteSync::FullSync => 0,
        WriteSync::PrimarySync => 1,
        WriteSync::FullAsync => 2,
    }
}

fn sync_from_code(code: u8) -> Result<WriteSync> {
    match code {
        0 => Ok(WriteSync::FullSync),
        1 => Ok(WriteSync::PrimarySync),
        2 => Ok(WriteSync::FullAsync),
        other => Err(CacheError::Protocol(format!("unknown sync mode {other}"))),
    }
}

fn order_code(mode: WriteOrder) -> u8 {
    match mode {
        WriteOrder::Clock => 0,
        WriteOrder::Primary => 1,
    }
}

fn order_from_code(code: u8) -> Result<WriteOrder> {
    match code {
        0 => Ok(WriteOrder::Clock),
        1 => Ok(WriteOrder::Primary),
        other => Err(CacheError::Protocol(format!("unknown order mode {other}"))),
    }
}

fn write_failed_key(out: &mut Vec<u8>, f: &FailedKey) {
    write_bytes(out, &f.key);
    out.push(f.code);
    write_string(out, &f.message);
}

fn read_failed_key(data: &[u8], off: &mut usize) -> Result<FailedKey> {
    Ok(FailedKey {
        key: read_bytes(data, off)?,
        code: read_u8(data, off)?,
        message: read_string(data, off)?,
    })
}

fn write_opt_conflict(out: &mut Vec<u8>, c: &Option<ConflictInfo>) {
    match c {
        None => out.push(0),
        Some(c) => {
            out.push(1);
            write_i64(out, c.ttl_ms);
            write_i64(out, c.expire_time_ms);
            write_version(out, &c.version);
        }
    }
}

fn read_opt_conflict(data: &[u8], off: &mut usize) -> Result<Option<ConflictInfo>> {
    match read_u8(data, off)? {
        0 => Ok(None),
        _ => Ok(Some(ConflictInfo {
            ttl_ms: read_i64(data, off)?,
            expire_time_ms: read_i64(data, off)?,
            version: read_version(data, off)?,
        })),
    }
}

fn write_version(out: &mut Vec<u8>, ver: &CacheVersion) {
    out.extend_from_slice(&ver.topology_version.to_le_bytes());
    out.extend_from_slice(&ver.order.to_le_bytes());
    out.extend_from_slice(&ver.node_order.to_le_bytes());
    out.push(ver.data_center_id);
}

fn read_version(data: &[u8], off: &mut usize) -> Result<CacheVersion> {
    Ok(CacheVersion {
        topology_version: read_u64(data, off)?,
        order: read_u64(data, off)?,
        node_order: read_u32(data, off)?,
        data_center_id: read_u8(data, off)?,
    })
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn read_bytes(data: &[u8], off: &mut usize) -> Result<Vec<u8>> {
    let len = read_u32(data, off)? as usize;
    if *off + len > data.len() {
        return Err(CacheError::Protocol("short byte string".into()));
    }
    let out = data[*off..*off + len].to_vec();
    *off += len;
    Ok(out)
}

fn write_opt_bytes(out: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        None => out.push(0),
        Some(b) => {
            out.push(1);
            write_bytes(out, b);
        }
    }
}

fn read_opt_bytes(data: &[u8], off: &mut usize) -> Result<Option<Vec<u8>>> {
    match read_u8(data, off)? {
        0 => Ok(None),
        _ => Ok(Some(read_bytes(data, off)?)),
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    write_bytes(out, s.as_bytes());
}

fn read_string(data: &[u8], off: &mut usize) -> Result<String> {
    let bytes = read_bytes(data, off)?;
    String::from_utf8(bytes).map_err(|_| CacheError::Protocol("invalid utf-8 string".into()))
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn read_u8(data: &[u8], off: &mut usize) -> Result<u8> {
    if *off + 1 > data.len() {
        return Err(CacheError::Protocol("short u8".into()));
    }
    let out = data[*off];
    *off += 1;
    Ok(out)
}

fn read_u32(data: &[u8], off: &mut usize) -> Result<u32> {
    if *off + 4 > data.len() {
        return Err(CacheError::Protocol("short u32".into()));
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*off..*off + 4]);
    *off += 4;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(data: &[u8], off: &mut usize) -> Result<u64> {
    if *off + 8 > data.len() {
        return Err(CacheError::Protocol("short u64".into()));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*off..*off + 8]);
    *off += 8;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64(data: &[u8], off: &mut usize) -> Result<i64> {
    Ok(read_u64(data, off)? as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ver(top: u64, order: u64, node: u32) -> CacheVersion {
        CacheVersion {
            topology_version: top,
            order,
            node_order: node,
            data_center_id: 0,
        }
    }

    fn roundtrip(msg: Message) {
        let encoded = msg.encode();
        let decoded = Message::decode(&encoded).expect("decode");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn near_request_roundtrip() {
        roundtrip(Message::NearUpdateRequest(NearUpdateRequest {
            future_version: ver(3, 17, 1),
            topology_version: 3,
            sync_mode: WriteSync::FullSync,
            order_mode: WriteOrder::Clock,
            operation: Operation::Update,
            keys: vec![b"alpha".to_vec(), b"beta".to_vec()],
            values: vec![Some(b"1".to_vec()), Some(b"2".to_vec())],
            transforms: vec![],
            filter: Some(EntryFilter::ValueEquals(b"old".to_vec())),
            ttl_ms: 30_000,
            return_value: false,
            fast_map: false,
            write_version: None,
            conflict: vec![None, None],
            hops: 0,
        }));
    }

    #[test]
    fn transform_request_roundtrip() {
        roundtrip(Message::NearUpdateRequest(NearUpdateRequest {
            future_version: ver(5, 2, 0),
            topology_version: 5,
            sync_mode: WriteSync::PrimarySync,
            order_mode: WriteOrder::Primary,
            operation: Operation::Transform,
            keys: vec![b"counter".to_vec()],
            values: vec![],
            transforms: vec![TransformSpec {
                name: "incr".into(),
                arg: 7i64.to_le_bytes().to_vec(),
            }],
            filter: None,
            ttl_ms: -1,
            return_value: true,
            fast_map: false,
            write_version: Some(ver(5, 9, 2)),
            conflict: vec![Some(ConflictInfo {
                ttl_ms: -1,
                expire_time_ms: 123,
                version: ver(4, 1, 1),
            })],
            hops: 2,
        }));
    }

    #[test]
    fn near_response_roundtrip() {
        roundtrip(Message::NearUpdateResponse(NearUpdateResponse {
            future_version: ver(2, 8, 1),
            return_value: Some(CacheReturn {
                value: Some(b"prev".to_vec()),
                success: true,
            }),
            failed_keys: vec![FailedKey::new(
                b"bad".to_vec(),
                &CacheError::Store("disk full".into()),
            )],
            remap_keys: vec![b"moved".to_vec()],
        }));
    }

    #[test]
    fn dht_messages_roundtrip() {
        roundtrip(Message::DhtUpdateRequest(DhtUpdateRequest {
            future_version: ver(2, 10, 0),
            write_version: ver(2, 9, 0),
            sync_mode: WriteSync::FullSync,
            topology_version: 2,
            ttl_ms: -1,
            entries: vec![
                DhtUpdateEntry {
                    key: b"k1".to_vec(),
                    value: Some(b"v1".to_vec()),
                    conflict: None,
                },
                DhtUpdateEntry {
                    key: b"k2".to_vec(),
                    value: None,
                    conflict: None,
                },
            ],
        }));
        roundtrip(Message::DhtUpdateResponse(DhtUpdateResponse {
            future_version: ver(2, 10, 0),
            failed_keys: vec![],
        }));
        roundtrip(Message::DhtDeferredAck(DhtDeferredAckResponse {
            future_versions: (0..300).map(|i| ver(2, i, 0)).collect(),
        }));
    }

    #[test]
    fn get_messages_roundtrip() {
        roundtrip(Message::GetRequest(GetRequest {
            future_version: ver(1, 1, 0),
            key: b"k".to_vec(),
        }));
        roundtrip(Message::GetResponse(GetResponse {
            future_version: ver(1, 1, 0),
            value: None,
            error: Some(FailedKey::new(b"k".to_vec(), &CacheError::InvalidPartition(17))),
        }));
    }

    #[test]
    fn rejects_truncated_and_trailing_frames() {
        let msg = Message::GetRequest(GetRequest {
            future_version: ver(1, 1, 0),
            key: b"key".to_vec(),
        });
        let mut encoded = msg.encode();
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
        encoded.push(0);
        assert!(Message::decode(&encoded).is_err());
        assert!(Message::decode(&[99]).is_err());
    }

    #[test]
    fn failed_key_error_roundtrip() {
        let err = CacheError::InvalidPartition(42);
        let f = FailedKey::new(b"k".to_vec(), &err);
        assert_eq!(f.error(), err);
    }
}
