//! Thread-local pool of savepoint buffers
//!
//! Nested transactions copy the parent's private state into a buffer before
//! running and restore it if the nested body fails. Each thread keeps up to
//! MAX_POOL_SIZE buffers so that repeated nesting does not allocate.
//!
//! `Vec::clear()` preserves capacity, so a reused buffer that has held a large
//! access set keeps its allocation.

use crate::transaction::Access;
use mvstm_core::ObjectId;
use std::cell::RefCell;

/// Maximum buffers per thread
pub const MAX_POOL_SIZE: usize = 8;

/// One saved access set
pub(crate) type SavepointBuffer = Vec<(ObjectId, Access)>;

thread_local! {
    static SAVEPOINT_POOL: RefCell<Vec<SavepointBuffer>> =
        RefCell::new(Vec::with_capacity(MAX_POOL_SIZE));
}

/// Savepoint pool operations
///
/// The pool is implicitly created per thread on first access.
pub struct SavepointPool;

impl SavepointPool {
    /// Take an empty buffer from the pool, or allocate one
    pub(crate) fn acquire() -> SavepointBuffer {
        SAVEPOINT_POOL.with(|pool| pool.borrow_mut().pop().unwrap_or_default())
    }

    /// Return a buffer to the pool; dropped if the pool is full
    pub(crate) fn release(mut buffer: SavepointBuffer) {
        buffer.clear();
        SAVEPOINT_POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            if pool.len() < MAX_POOL_SIZE {
                pool.push(buffer);
            }
        });
    }

    /// Number of buffers pooled on this thread
    pub fn pool_size() -> usize {
        SAVEPOINT_POOL.with(|pool| pool.borrow().len())
    }

    /// Pre-allocate `count` buffers (capped at MAX_POOL_SIZE)
    pub fn warmup(count: usize) {
        let count = count.min(MAX_POOL_SIZE);
        SAVEPOINT_POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            let current = pool.len();
            for _ in current..count {
                pool.push(Vec::with_capacity(4));
            }
        });
    }

    /// Drop every pooled buffer on this thread
    #[cfg(test)]
    pub fn clear() {
        SAVEPOINT_POOL.with(|pool| pool.borrow_mut().clear());
    }
}
