//! Process-wide registry of durable trunks
//!
//! Opening the same trunk directory twice returns the same `Trunk`, so two
//! persisters never append to one commit log. Entries are weak: a trunk
//! nobody holds is dropped, and the next open recovers it from disk.

use mvstm_concurrency::Trunk;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Weak;

/// Open durable trunks (canonical directory -> weak reference)
pub static OPEN_TRUNKS: Lazy<Mutex<HashMap<PathBuf, Weak<Trunk>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
