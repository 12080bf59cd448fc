//! Listener registration
//!
//! Listeners are attached to one object and receive the changes committed to
//! it. The registry is read on every notifier walk and written only when
//! listeners come and go, so it sits behind a `RwLock` and walks work on a
//! cloned list of registrations. A listener removed mid-walk is skipped when
//! its pending callbacks run.

use crate::dispatcher::{Dispatcher, SerialQueue};
use mvstm_concurrency::TObject;
use mvstm_core::{FieldIndex, ObjectId, ObjectKind, StmError, StmResult, Value};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Callbacks for objects with indexed fields
pub trait FieldListener: Send + Sync {
    /// `field` now holds `value`
    fn on_field_changed(&self, object: &TObject, field: FieldIndex, value: &Value);
}

/// Callbacks for keyed objects
pub trait KeyListener: Send + Sync {
    /// `key` now maps to `value`
    fn on_put(&self, object: &TObject, key: &str, value: &Value);
    /// `key` was removed
    fn on_removed(&self, object: &TObject, key: &str);
    /// Every entry was removed
    fn on_cleared(&self, object: &TObject);
}

/// Callbacks for indexed (list-like) objects
pub trait ListListener: Send + Sync {
    /// `value` was inserted at `index`
    fn on_added(&self, object: &TObject, index: u32, value: &Value);
    /// The element at `index` was removed
    fn on_removed(&self, object: &TObject, index: u32);
    /// The element at `index` was replaced by `value`
    fn on_set(&self, _object: &TObject, _index: u32, _value: &Value) {}
    /// Every element was removed
    fn on_cleared(&self, object: &TObject);
}

/// A listener of any shape
#[derive(Clone)]
pub enum Listener {
    /// Listens to a `Fields` object
    Fields(Arc<dyn FieldListener>),
    /// Listens to a `Keyed` object
    Keyed(Arc<dyn KeyListener>),
    /// Listens to an `Indexed` object
    Indexed(Arc<dyn ListListener>),
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Listener::Fields(_) => "Listener::Fields",
            Listener::Keyed(_) => "Listener::Keyed",
            Listener::Indexed(_) => "Listener::Indexed",
        })
    }
}

impl Listener {
    fn accepts(&self, kind: ObjectKind) -> bool {
        matches!(
            (self, kind),
            (Listener::Fields(_), ObjectKind::Fields { .. })
                | (Listener::Keyed(_), ObjectKind::Keyed)
                | (Listener::Indexed(_), ObjectKind::Indexed)
        )
    }

    fn shape(&self) -> &'static str {
        match self {
            Listener::Fields(_) => "fields",
            Listener::Keyed(_) => "keyed",
            Listener::Indexed(_) => "indexed",
        }
    }

    fn deliver(&self, object: &TObject, change: &Change) {
        match (self, change) {
            (Listener::Fields(l), Change::Field { field, value }) => {
                l.on_field_changed(object, *field, value)
            }
            (Listener::Keyed(l), Change::Put { key, value }) => l.on_put(object, key, value),
            (Listener::Keyed(l), Change::KeyRemoved { key }) => l.on_removed(object, key),
            (Listener::Keyed(l), Change::KeysCleared) => l.on_cleared(object),
            (Listener::Indexed(l), Change::Added { index, value }) => {
                l.on_added(object, *index, value)
            }
            (Listener::Indexed(l), Change::ElementRemoved { index }) => l.on_removed(object, *index),
            (Listener::Indexed(l), Change::ElementSet { index, value }) => {
                l.on_set(object, *index, value)
            }
            (Listener::Indexed(l), Change::ElementsCleared) => l.on_cleared(object),
            _ => {}
        }
    }
}

/// One change delivered to a listener
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Field written
    Field {
        /// Field index
        field: FieldIndex,
        /// New value
        value: Value,
    },
    /// Key put
    Put {
        /// Key
        key: String,
        /// New value
        value: Value,
    },
    /// Key removed
    KeyRemoved {
        /// Key
        key: String,
    },
    /// Keyed object cleared
    KeysCleared,
    /// List element inserted
    Added {
        /// Position
        index: u32,
        /// Inserted value
        value: Value,
    },
    /// List element removed
    ElementRemoved {
        /// Position
        index: u32,
    },
    /// List element replaced
    ElementSet {
        /// Position
        index: u32,
        /// New value
        value: Value,
    },
    /// List cleared
    ElementsCleared,
}

/// Handle returned by `add_listener`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// A listener attached to an object, with its delivery lane
pub struct Registration {
    id: ListenerId,
    object: TObject,
    listener: Listener,
    lane: SerialQueue,
    removed: AtomicBool,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("object", &self.object)
            .field("listener", &self.listener)
            .finish()
    }
}

impl Registration {
    /// Listener id
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Object listened to
    pub fn object(&self) -> &TObject {
        &self.object
    }

    /// True once removed from the registry
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Queue `changes` for delivery on the listener's dispatcher, in order.
    pub fn dispatch(self: &Arc<Self>, changes: Vec<Change>) {
        if changes.is_empty() || self.is_removed() {
            return;
        }
        let registration = Arc::clone(self);
        self.lane.push(Box::new(move || {
            for change in &changes {
                // removal takes effect between callbacks
                if registration.is_removed() {
                    return;
                }
                registration.listener.deliver(&registration.object, change);
            }
        }));
    }
}

/// Listeners of one trunk, by object
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    by_object: RwLock<FxHashMap<ObjectId, Vec<Arc<Registration>>>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `listener` to `object`; callbacks run on `dispatcher`.
    ///
    /// # Errors
    /// `StmError::KindMismatch` if the listener shape does not match the object.
    pub fn add_listener(
        &self,
        object: &TObject,
        listener: Listener,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> StmResult<ListenerId> {
        if !listener.accepts(object.kind()) {
            return Err(StmError::KindMismatch {
                object: object.id(),
                expected: listener.shape(),
                actual: object.kind().name(),
            });
        }
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let registration = Arc::new(Registration {
            id,
            object: *object,
            listener,
            lane: SerialQueue::new(dispatcher),
            removed: AtomicBool::new(false),
        });
        self.by_object
            .write()
            .entry(object.id())
            .or_default()
            .push(registration);
        Ok(id)
    }

    /// Detach a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut by_object = self.by_object.write();
        let mut found = None;
        for (object, registrations) in by_object.iter_mut() {
            if let Some(pos) = registrations.iter().position(|r| r.id == id) {
                let registration = registrations.remove(pos);
                registration.removed.store(true, Ordering::Release);
                found = Some((*object, registrations.is_empty()));
                break;
            }
        }
        match found {
            Some((object, true)) => {
                by_object.remove(&object);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Registrations for `object`, cloned out of the lock
    pub fn listeners_of(&self, object: ObjectId) -> Vec<Arc<Registration>> {
        self.by_object
            .read()
            .get(&object)
            .cloned()
            .unwrap_or_default()
    }

    /// True if nobody listens to anything
    pub fn is_empty(&self) -> bool {
        self.by_object.read().is_empty()
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.by_object.read().values().map(Vec::len).sum()
    }
}
