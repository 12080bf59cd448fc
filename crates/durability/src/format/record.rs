//! Commit log file and record format.
//!
//! A store directory holds a single `commits.log` file.
//!
//! # File Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Log Header (32 bytes)              │
//! ├────────────────────────────────────┤
//! │ Record 1                           │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────────────┬────────────────┬──────────┬──────────────┬─────────────────────┬──────────┐
//! │ Length (4 bytes)│ Format Ver (1) │ Kind (1) │ Sequence (8) │ Payload (variable)  │ CRC32 (4)│
//! └─────────────────┴────────────────┴──────────┴──────────────┴─────────────────────┴──────────┘
//! ```
//!
//! The length covers everything after itself. The CRC covers format version,
//! kind, sequence and payload.

use crc32fast::Hasher;

/// Magic bytes identifying a commit log: "MVST"
pub const LOG_MAGIC: [u8; 4] = *b"MVST";

/// Current log header format version
pub const LOG_FORMAT_VERSION: u32 = 1;

/// Size of the log header in bytes
pub const LOG_HEADER_SIZE: usize = 32;

/// Current record format version
pub const RECORD_FORMAT_VERSION: u8 = 1;

/// Bytes before the payload inside the checksummed region
const RECORD_PREFIX: usize = 1 + 1 + 8;

/// Commit log header (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    /// Magic bytes: "MVST"
    pub magic: [u8; 4],
    /// Format version for forward compatibility
    pub format_version: u32,
    /// Trunk the log belongs to
    pub trunk_id: [u8; 16],
}

impl LogHeader {
    /// Create a header for a trunk
    pub fn new(trunk_id: [u8; 16]) -> Self {
        LogHeader {
            magic: LOG_MAGIC,
            format_version: LOG_FORMAT_VERSION,
            trunk_id,
        }
    }

    /// Serialize header to bytes. The last 8 bytes are reserved.
    pub fn to_bytes(&self) -> [u8; LOG_HEADER_SIZE] {
        let mut bytes = [0u8; LOG_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..24].copy_from_slice(&self.trunk_id);
        bytes
    }

    /// Deserialize header from bytes.
    pub fn from_bytes(bytes: &[u8; LOG_HEADER_SIZE]) -> Option<Self> {
        Some(LogHeader {
            magic: bytes[0..4].try_into().ok()?,
            format_version: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            trunk_id: bytes[8..24].try_into().ok()?,
        })
    }

    /// Validate magic bytes and version.
    pub fn is_valid(&self) -> bool {
        self.magic == LOG_MAGIC && self.format_version == LOG_FORMAT_VERSION
    }
}

/// What a record holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// One acknowledged version map
    Commit,
    /// One object descriptor
    Object,
    /// Root object id
    Root,
}

impl RecordKind {
    /// Tag byte used on disk
    pub fn tag(&self) -> u8 {
        match self {
            RecordKind::Commit => 1,
            RecordKind::Object => 2,
            RecordKind::Root => 3,
        }
    }

    /// Parse a tag byte
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(RecordKind::Commit),
            2 => Some(RecordKind::Object),
            3 => Some(RecordKind::Root),
            _ => None,
        }
    }
}

/// One self-delimiting log record.
///
/// The sequence is the commit sequence for `Commit` records and the object
/// id for `Object` and `Root` records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRecord {
    /// Record kind
    pub kind: RecordKind,
    /// Commit sequence or object id
    pub sequence: u64,
    /// Opaque encoded payload
    pub payload: Vec<u8>,
}

impl StoreRecord {
    /// Create a new record.
    pub fn new(kind: RecordKind, sequence: u64, payload: Vec<u8>) -> Self {
        StoreRecord {
            kind,
            sequence,
            payload,
        }
    }

    /// Serialize the record for appending to a log.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(RECORD_PREFIX + self.payload.len());
        body.push(RECORD_FORMAT_VERSION);
        body.push(self.kind.tag());
        body.extend_from_slice(&self.sequence.to_le_bytes());
        body.extend_from_slice(&self.payload);

        let crc = compute_crc(&body);

        let total_len = body.len() + 4;
        let mut record = Vec::with_capacity(4 + total_len);
        record.extend_from_slice(&(total_len as u32).to_le_bytes());
        record.extend_from_slice(&body);
        record.extend_from_slice(&crc.to_le_bytes());
        record
    }

    /// Deserialize a record from the front of `bytes`.
    ///
    /// Returns (record, bytes_consumed) on success.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), RecordError> {
        let length = match bytes.get(0..4) {
            Some(prefix) => read_u32(prefix) as usize,
            None => return Err(RecordError::InsufficientData),
        };
        if length < RECORD_PREFIX + 4 {
            return Err(RecordError::InvalidFormat);
        }
        if bytes.len() < 4 + length {
            return Err(RecordError::InsufficientData);
        }

        let body = &bytes[4..4 + length - 4];
        let stored_crc = read_u32(&bytes[4 + length - 4..4 + length]);
        let computed_crc = compute_crc(body);
        if computed_crc != stored_crc {
            return Err(RecordError::ChecksumMismatch {
                expected: stored_crc,
                computed: computed_crc,
            });
        }

        if body[0] != RECORD_FORMAT_VERSION {
            return Err(RecordError::UnsupportedVersion(body[0]));
        }
        let kind = RecordKind::from_tag(body[1]).ok_or(RecordError::UnknownKind(body[1]))?;
        let sequence = read_u64(&body[2..10]);

        Ok((
            StoreRecord {
                kind,
                sequence,
                payload: body[RECORD_PREFIX..].to_vec(),
            },
            4 + length,
        ))
    }
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Record parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Not enough data to parse record
    #[error("Insufficient data to parse record")]
    InsufficientData,

    /// Record format is invalid
    #[error("Invalid record format")]
    InvalidFormat,

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Expected checksum from record
        expected: u32,
        /// Computed checksum
        computed: u32,
    },

    /// Unsupported format version
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u8),

    /// Unknown record kind tag
    #[error("Unknown record kind: {0}")]
    UnknownKind(u8),
}
