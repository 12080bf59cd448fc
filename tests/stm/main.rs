//! End-to-end tests through the `mvstm` facade
//!
//! Organized by area:
//! - isolation: snapshot reads, conflicts, nesting, current-transaction scope
//! - persistence: durable trunks across reopen
//! - notification: ALL and COALESCE listeners through `Stm`
//! - replication: an authority and three peers

mod isolation;
mod notification;
mod persistence;
mod replication;

use mvstm::{Stm, StmConfig, TObject, Trunk, Value};
use std::sync::Arc;

/// Route engine logs to the test harness; `cargo test -- --nocapture` shows them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn memory_stm() -> Stm {
    Stm::new(StmConfig::in_memory()).unwrap()
}

pub fn read_field(stm: &Stm, trunk: &Arc<Trunk>, object: &TObject, field: u32) -> Value {
    let mut txn = stm.start(trunk);
    txn.get(object, field).unwrap()
}
