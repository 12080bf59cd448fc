//! Core types for mvstm
//!
//! This crate defines the foundational types used throughout the system:
//! - Bits: Sparse dirty-slot bitset
//! - Value: What a transactional slot holds
//! - TrunkId / ObjectId / Source / InterceptionId: Identifiers
//! - Granularity: Notification cadence of a trunk
//! - ObjectKind / ObjectDescriptor: Object shapes and read-only fields
//! - StmError: Error type shared by every crate

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bits;
pub mod error;
pub mod types;
pub mod value;

pub use bits::{Bits, BitsIter};
pub use error::{StmError, StmResult};
pub use types::{
    FieldIndex, Granularity, InterceptionId, ObjectDescriptor, ObjectId, ObjectKind, Source,
    TrunkId,
};
pub use value::Value;
