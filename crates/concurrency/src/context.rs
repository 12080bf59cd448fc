//! Ambient current transaction
//!
//! Code that does not receive a transaction explicitly can pick up the one the
//! caller entered with [`TransactionScope::enter`]. Scopes nest: each thread
//! keeps a stack of slots, and dropping the guard pops the slot it pushed.

use crate::transaction::Transaction;
use mvstm_core::{StmError, StmResult};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

/// Transaction shared between a scope and its owner
pub type SharedTransaction = Arc<Mutex<Transaction>>;

thread_local! {
    static CURRENT: RefCell<Vec<Option<SharedTransaction>>> = const { RefCell::new(Vec::new()) };
}

/// Pops its slot from the current-transaction stack on drop
#[must_use = "the transaction is current only while the guard lives"]
#[derive(Debug)]
pub struct ScopeGuard {
    depth: usize,
    // tied to the thread whose stack it pushed on
    _not_send: PhantomData<*const ()>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        CURRENT.with(|stack| stack.borrow_mut().truncate(self.depth - 1));
    }
}

/// Thread-local stack of current transactions
pub struct TransactionScope;

impl TransactionScope {
    /// Make `transaction` current until the guard is dropped
    pub fn enter(transaction: SharedTransaction) -> ScopeGuard {
        Self::push(Some(transaction))
    }

    /// Open a scope with no current transaction, hiding outer ones
    pub fn enter_empty() -> ScopeGuard {
        Self::push(None)
    }

    fn push(slot: Option<SharedTransaction>) -> ScopeGuard {
        let depth = CURRENT.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(slot);
            stack.len()
        });
        ScopeGuard {
            depth,
            _not_send: PhantomData,
        }
    }

    /// Current transaction of the innermost scope
    pub fn current() -> Option<SharedTransaction> {
        CURRENT.with(|stack| stack.borrow().last().cloned().flatten())
    }

    /// Replace the current transaction of the innermost scope.
    ///
    /// Returns the previous one. Fails if no scope is entered on this thread.
    pub fn set_current(
        transaction: Option<SharedTransaction>,
    ) -> StmResult<Option<SharedTransaction>> {
        CURRENT.with(|stack| match stack.borrow_mut().last_mut() {
            Some(slot) => Ok(std::mem::replace(slot, transaction)),
            None => Err(StmError::invalid_state("no transaction scope entered")),
        })
    }

    /// Run `f` with the current transaction locked
    pub fn with_current<T, F>(f: F) -> StmResult<T>
    where
        F: FnOnce(&mut Transaction) -> StmResult<T>,
    {
        let current =
            Self::current().ok_or_else(|| StmError::invalid_state("no current transaction"))?;
        let mut guard = current.lock();
        f(&mut guard)
    }

    /// Number of scopes entered on this thread
    pub fn depth() -> usize {
        CURRENT.with(|stack| stack.borrow().len())
    }
}
