//! Durability layer for mvstm
//!
//! This crate handles everything that touches disk:
//!
//! - Store: Append log of encoded version maps, replayed in order on open
//! - Durability modes: Cache, Standard (default), Always
//! - Binary on-disk format (CRC-checked, length-prefixed records)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format;
pub mod mode;
pub mod store;

pub use format::{RecordError, RecordKind, StoreRecord};
pub use mode::DurabilityMode;
pub use store::{FileStore, MemoryStore, Store, LOG_FILE_NAME};
