//! Speculative commit protocol
//!
//! An [`Interceptor`] switches a trunk into intercepted mode: commits still
//! publish immediately, so local reads see them, but their maps stay above the
//! acknowledged boundary until confirmed. Confirmation comes from
//! [`Interceptor::ack`], usually driven by a remote authority, or from a
//! pluggable [`Acknowledger`] policy consulted after every speculative publish.
//!
//! `reject` discards speculative maps the authority refused; `reset` leaves
//! intercepted mode and accepts everything still pending.

use crate::trunk::{Trunk, TrunkObserver};
use crate::version_map::VersionMap;
use mvstm_core::{InterceptionId, StmResult};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Speculative state handed to an [`Acknowledger`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAcks {
    /// Current interception id
    pub interception: InterceptionId,
    /// Sequences of the pending maps, in position order
    pub sequences: Vec<u64>,
}

impl PendingAcks {
    /// Number of pending maps
    pub fn depth(&self) -> usize {
        self.sequences.len()
    }
}

/// What an acknowledger wants done with the pending maps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Leave everything pending
    Wait,
    /// Acknowledge up to and including this sequence
    AckThrough(u64),
    /// Acknowledge everything pending
    AckAll,
}

/// Policy deciding when speculative maps get acknowledged
pub trait Acknowledger: Send + Sync {
    /// Called after each speculative publish and on `Interceptor::request_run`
    fn request_run(&self, pending: &PendingAcks) -> AckDecision;
}

/// Acknowledge everything once `depth` maps are pending
#[derive(Debug, Clone, Copy)]
pub struct ThresholdAcknowledger {
    depth: usize,
}

impl ThresholdAcknowledger {
    /// Create with the pending depth that triggers an ack
    pub fn new(depth: usize) -> Self {
        ThresholdAcknowledger {
            depth: depth.max(1),
        }
    }
}

impl Acknowledger for ThresholdAcknowledger {
    fn request_run(&self, pending: &PendingAcks) -> AckDecision {
        if pending.depth() >= self.depth {
            AckDecision::AckAll
        } else {
            AckDecision::Wait
        }
    }
}

/// Acknowledge a random prefix of the pending maps with some probability.
///
/// Seeded, so a failing run can be replayed.
#[derive(Debug)]
pub struct RandomAcknowledger {
    probability: f64,
    rng: Mutex<StdRng>,
}

impl RandomAcknowledger {
    /// Create with the probability of acknowledging on each run
    pub fn new(probability: f64, seed: u64) -> Self {
        RandomAcknowledger {
            probability: probability.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Acknowledger for RandomAcknowledger {
    fn request_run(&self, pending: &PendingAcks) -> AckDecision {
        if pending.sequences.is_empty() {
            return AckDecision::Wait;
        }
        let mut rng = self.rng.lock();
        if !rng.gen_bool(self.probability) {
            return AckDecision::Wait;
        }
        let through = rng.gen_range(0..pending.sequences.len());
        AckDecision::AckThrough(pending.sequences[through])
    }
}

/// Never acknowledges on its own; acks come from explicit `ack` calls
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualAcknowledger;

impl Acknowledger for ManualAcknowledger {
    fn request_run(&self, _pending: &PendingAcks) -> AckDecision {
        AckDecision::Wait
    }
}

/// Runs the acknowledger after speculative publishes
struct AckTrigger {
    interceptor: Weak<Interceptor>,
}

impl TrunkObserver for AckTrigger {
    fn on_published(&self, _trunk: &Trunk, map: &Arc<VersionMap>) {
        if map.interception().is_none() {
            return;
        }
        if let Some(interceptor) = self.interceptor.upgrade() {
            if let Err(e) = interceptor.request_run() {
                debug!(target: "mvstm::intercept", error = %e, "Acknowledger run failed");
            }
        }
    }
}

/// Drives speculative mode on one trunk
pub struct Interceptor {
    trunk: Arc<Trunk>,
    acknowledger: Option<Arc<dyn Acknowledger>>,
    trigger: Mutex<Option<Arc<dyn TrunkObserver>>>,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("trunk", &self.trunk.id())
            .field("acknowledger", &self.acknowledger.is_some())
            .finish()
    }
}

impl Interceptor {
    /// Interceptor without a policy; maps wait for explicit acks
    pub fn new(trunk: &Arc<Trunk>) -> Arc<Interceptor> {
        Arc::new(Interceptor {
            trunk: trunk.clone(),
            acknowledger: None,
            trigger: Mutex::new(None),
        })
    }

    /// Interceptor consulting `acknowledger` after every speculative publish
    pub fn with_acknowledger(trunk: &Arc<Trunk>, acknowledger: Arc<dyn Acknowledger>) -> Arc<Interceptor> {
        let interceptor = Arc::new(Interceptor {
            trunk: trunk.clone(),
            acknowledger: Some(acknowledger),
            trigger: Mutex::new(None),
        });
        let trigger: Arc<dyn TrunkObserver> = Arc::new(AckTrigger {
            interceptor: Arc::downgrade(&interceptor),
        });
        trunk.add_observer(trigger.clone());
        *interceptor.trigger.lock() = Some(trigger);
        interceptor
    }

    /// Trunk under control
    pub fn trunk(&self) -> &Arc<Trunk> {
        &self.trunk
    }

    /// True while the trunk publishes speculatively
    pub fn is_intercepted(&self) -> bool {
        self.trunk.is_intercepted()
    }

    /// Switch the trunk into speculative mode.
    ///
    /// Calling it while already intercepted starts a new interception id.
    pub fn intercept(&self) -> InterceptionId {
        self.trunk.begin_interception()
    }

    /// Current interception id
    pub fn interception(&self) -> InterceptionId {
        self.trunk.snapshot().interception()
    }

    /// Speculative maps pending acknowledgement
    pub fn pending(&self) -> PendingAcks {
        let snapshot = self.trunk.snapshot();
        PendingAcks {
            interception: snapshot.interception(),
            sequences: snapshot
                .speculative_maps()
                .iter()
                .map(|m| m.sequence())
                .collect(),
        }
    }

    /// Acknowledge maps up to and including `through`.
    ///
    /// Returns the number of maps that became durable.
    pub fn ack(&self, interception: InterceptionId, through: u64) -> StmResult<usize> {
        Ok(self.trunk.acknowledge(interception, through)?.len())
    }

    /// Acknowledge every pending map
    pub fn ack_all(&self) -> usize {
        self.trunk.acknowledge_all().len()
    }

    /// Roll back pending maps from `from_sequence` onward
    pub fn reject(&self, from_sequence: u64) -> StmResult<usize> {
        Ok(self.trunk.reject_from(from_sequence)?.len())
    }

    /// Leave speculative mode, accepting every pending map
    pub fn reset(&self) -> usize {
        self.trunk.end_interception().len()
    }

    /// Ask the acknowledger what to do now and do it.
    ///
    /// Returns the number of maps acknowledged.
    pub fn request_run(&self) -> StmResult<usize> {
        let Some(acknowledger) = &self.acknowledger else {
            return Ok(0);
        };
        let pending = self.pending();
        if pending.sequences.is_empty() {
            return Ok(0);
        }
        match acknowledger.request_run(&pending) {
            AckDecision::Wait => Ok(0),
            AckDecision::AckAll => Ok(self.ack_all()),
            AckDecision::AckThrough(through) => self.ack(pending.interception, through),
        }
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        if let Some(trigger) = self.trigger.lock().take() {
            self.trunk.remove_observer(&trigger);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use crate::trunk::TrunkConfig;
    use crate::TObject;
    use mvstm_core::{ObjectKind, StmError, Value};

    fn setup() -> (Arc<Trunk>, TObject) {
        let trunk = Trunk::new(TrunkConfig::default());
        let obj = trunk.create_object(ObjectKind::Fields { count: 4 });
        (trunk, obj)
    }

    fn commit(trunk: &Arc<Trunk>, obj: &TObject, value: i64) -> u64 {
        let mut txn = Transaction::start(trunk);
        txn.set(obj, 0, value).unwrap();
        txn.commit().unwrap();
        txn.committed_sequence().unwrap()
    }

    #[test]
    fn test_manual_ack_moves_boundary() {
        let (trunk, obj) = setup();
        let interceptor = Interceptor::new(&trunk);
        let id = interceptor.intercept();
        assert!(interceptor.is_intercepted());

        let s1 = commit(&trunk, &obj, 1);
        let s2 = commit(&trunk, &obj, 2);
        assert_eq!(interceptor.pending().sequences, vec![s1, s2]);

        assert_eq!(interceptor.ack(id, s1).unwrap(), 1);
        assert_eq!(trunk.snapshot().acknowledged_count(), 1);
        assert_eq!(interceptor.ack(id, s2).unwrap(), 1);
        assert_eq!(interceptor.pending().depth(), 0);
    }

    #[test]
    fn test_ack_after_reintercept_needs_matching_id() {
        let (trunk, obj) = setup();
        let interceptor = Interceptor::new(&trunk);
        let first = interceptor.intercept();
        let s1 = commit(&trunk, &obj, 1);
        let second = interceptor.intercept();
        assert!(second > first);
        assert!(matches!(
            interceptor.ack(second, s1),
            Err(StmError::StaleInterception { .. })
        ));
        assert_eq!(interceptor.ack(first, s1).unwrap(), 1);
    }

    #[test]
    fn test_threshold_acknowledger() {
        let (trunk, obj) = setup();
        let interceptor =
            Interceptor::with_acknowledger(&trunk, Arc::new(ThresholdAcknowledger::new(3)));
        interceptor.intercept();
        commit(&trunk, &obj, 1);
        commit(&trunk, &obj, 2);
        assert_eq!(interceptor.pending().depth(), 2);
        commit(&trunk, &obj, 3);
        assert_eq!(interceptor.pending().depth(), 0);
        assert_eq!(trunk.snapshot().acknowledged_count(), 3);
    }

    #[test]
    fn test_random_acknowledger_is_monotonic() {
        let (trunk, obj) = setup();
        let interceptor =
            Interceptor::with_acknowledger(&trunk, Arc::new(RandomAcknowledger::new(0.5, 7)));
        interceptor.intercept();
        let mut last = 0;
        for i in 0..50 {
            commit(&trunk, &obj, i);
            let count = trunk.snapshot().acknowledged_count();
            assert!(count >= last);
            last = count;
        }
        interceptor.reset();
        assert_eq!(trunk.snapshot().acknowledged_count(), 50);
    }

    #[test]
    fn test_reject_rolls_back_values() {
        let (trunk, obj) = setup();
        let interceptor = Interceptor::new(&trunk);
        commit(&trunk, &obj, 1);
        interceptor.intercept();
        let s2 = commit(&trunk, &obj, 2);
        commit(&trunk, &obj, 3);
        assert_eq!(interceptor.reject(s2).unwrap(), 2);
        assert_eq!(
            trunk.snapshot().read_field(obj.id(), 0),
            Some(&Value::Int(1))
        );
    }

    #[test]
    fn test_reset_accepts_pending() {
        let (trunk, obj) = setup();
        let interceptor = Interceptor::new(&trunk);
        interceptor.intercept();
        commit(&trunk, &obj, 1);
        commit(&trunk, &obj, 2);
        assert_eq!(interceptor.reset(), 2);
        assert!(!interceptor.is_intercepted());
        let snapshot = trunk.snapshot();
        assert!(!snapshot.has_speculative());
        // later commits are acknowledged immediately
        commit(&trunk, &obj, 3);
        assert_eq!(trunk.snapshot().acknowledged_count(), 3);
    }

    #[test]
    fn test_drop_unregisters_trigger() {
        let (trunk, obj) = setup();
        let interceptor =
            Interceptor::with_acknowledger(&trunk, Arc::new(ThresholdAcknowledger::new(1)));
        interceptor.intercept();
        drop(interceptor);
        commit(&trunk, &obj, 1);
        assert!(trunk.snapshot().has_speculative());
    }
}
