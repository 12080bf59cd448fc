//! Binary on-disk formats

pub mod record;

pub use record::{
    LogHeader, RecordError, RecordKind, StoreRecord, LOG_FORMAT_VERSION, LOG_HEADER_SIZE,
    LOG_MAGIC, RECORD_FORMAT_VERSION,
};
