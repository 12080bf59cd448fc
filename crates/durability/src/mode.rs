//! Durability mode configuration
//!
//! Controls when a file store fsyncs (Cache, Standard, Always).

use std::str::FromStr;
use std::time::Duration;

/// Durability mode for store appends
///
/// # Modes
///
/// | Mode | fsync | Data Loss Window |
/// |------|-------|-----------------|
/// | Cache | Never | Everything since the OS last flushed |
/// | Always | Every record | Zero |
/// | Standard | Periodic | Up to interval/batch |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Nothing is persisted by the engine; file stores never fsync
    Cache,

    /// fsync after every appended record
    Always,

    /// fsync every N records OR every T milliseconds (the default)
    Standard {
        /// Maximum time between fsyncs in milliseconds
        interval_ms: u64,
        /// Maximum records between fsyncs
        batch_size: usize,
    },
}

impl DurabilityMode {
    /// Whether acknowledged commits are written to a store at all
    pub fn requires_store(&self) -> bool {
        !matches!(self, DurabilityMode::Cache)
    }

    /// Check if this mode requires fsync on every record
    pub fn requires_immediate_fsync(&self) -> bool {
        matches!(self, DurabilityMode::Always)
    }

    /// Whether a store with `unsynced` pending records, last synced
    /// `since_sync` ago, should fsync now
    pub fn should_sync(&self, unsynced: usize, since_sync: Duration) -> bool {
        match self {
            DurabilityMode::Cache => false,
            DurabilityMode::Always => unsynced > 0,
            DurabilityMode::Standard {
                interval_ms,
                batch_size,
            } => {
                unsynced > 0
                    && (unsynced >= *batch_size
                        || since_sync >= Duration::from_millis(*interval_ms))
            }
        }
    }

    /// Lowercase name used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            DurabilityMode::Cache => "cache",
            DurabilityMode::Always => "always",
            DurabilityMode::Standard { .. } => "standard",
        }
    }

    /// Create a standard mode with recommended defaults
    ///
    /// Returns `Standard { interval_ms: 100, batch_size: 1000 }`.
    pub fn standard_default() -> Self {
        DurabilityMode::Standard {
            interval_ms: 100,
            batch_size: 1000,
        }
    }
}

impl Default for DurabilityMode {
    fn default() -> Self {
        DurabilityMode::standard_default()
    }
}

impl FromStr for DurabilityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache" => Ok(DurabilityMode::Cache),
            "always" => Ok(DurabilityMode::Always),
            "standard" => Ok(DurabilityMode::standard_default()),
            other => Err(format!(
                "unknown durability mode '{}', expected \"cache\", \"always\" or \"standard\"",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_standard() {
        assert_eq!(DurabilityMode::default(), DurabilityMode::standard_default());
        assert!(DurabilityMode::default().requires_store());
        assert!(!DurabilityMode::Cache.requires_store());
    }

    #[test]
    fn test_should_sync() {
        let standard = DurabilityMode::Standard {
            interval_ms: 50,
            batch_size: 3,
        };
        assert!(!standard.should_sync(0, Duration::from_secs(10)));
        assert!(!standard.should_sync(2, Duration::from_millis(1)));
        assert!(standard.should_sync(3, Duration::from_millis(1)));
        assert!(standard.should_sync(1, Duration::from_millis(50)));

        assert!(DurabilityMode::Always.should_sync(1, Duration::ZERO));
        assert!(!DurabilityMode::Cache.should_sync(1000, Duration::from_secs(10)));
    }

    #[test]
    fn test_parse() {
        assert_eq!("cache".parse::<DurabilityMode>(), Ok(DurabilityMode::Cache));
        assert_eq!("always".parse::<DurabilityMode>(), Ok(DurabilityMode::Always));
        assert_eq!(
            "standard".parse::<DurabilityMode>(),
            Ok(DurabilityMode::standard_default())
        );
        assert!("strict".parse::<DurabilityMode>().is_err());
    }
}
