//! Byte transports between peers
//!
//! A [`Transport`] moves opaque message blobs to the other side and hands
//! inbound blobs to the [`Receiver`] bound to it, one at a time and in send
//! order. [`LoopbackTransport`] connects two endpoints in the same process.

use crate::dispatcher::{Dispatcher, SerialQueue};
use mvstm_core::{StmError, StmResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Consumer of inbound messages
pub trait Receiver: Send + Sync {
    /// One inbound message
    fn receive(&self, bytes: &[u8]);
    /// The connection is gone; called once, after every inbound message
    fn on_disconnect(&self);
}

/// Outbound side of a connection
pub trait Transport: Send + Sync {
    /// Queue `bytes` for the other side.
    ///
    /// # Errors
    /// `StmError::ConnectionClosed` once the transport is closed.
    fn send(&self, bytes: Vec<u8>) -> StmResult<()>;

    /// Route inbound messages to `receiver`. Messages that arrived earlier
    /// are delivered now.
    fn bind(&self, receiver: Weak<dyn Receiver>);

    /// Close both directions
    fn close(&self);

    /// True until closed
    fn is_open(&self) -> bool;
}

enum Inbound {
    Message(Vec<u8>),
    Disconnect,
}

struct Endpoint {
    lane: SerialQueue,
    receiver: Mutex<Option<Weak<dyn Receiver>>>,
    backlog: Mutex<Vec<Inbound>>,
}

impl Endpoint {
    /// Queue `inbound` on the lane; `None` only flushes the backlog
    fn deliver(self: &Arc<Self>, inbound: Option<Inbound>) {
        let endpoint = Arc::clone(self);
        self.lane.push(Box::new(move || endpoint.handle(inbound)));
    }

    // runs on the lane, so the backlog drains in arrival order
    fn handle(&self, inbound: Option<Inbound>) {
        let (receiver, ready) = {
            let mut backlog = self.backlog.lock();
            backlog.extend(inbound);
            let receiver = self.receiver.lock().as_ref().and_then(Weak::upgrade);
            match receiver {
                Some(receiver) => (receiver, std::mem::take(&mut *backlog)),
                None => return,
            }
        };
        for inbound in ready {
            match inbound {
                Inbound::Message(bytes) => receiver.receive(&bytes),
                Inbound::Disconnect => receiver.on_disconnect(),
            }
        }
    }
}

struct Link {
    open: AtomicBool,
}

/// One end of an in-process connection
pub struct LoopbackTransport {
    link: Arc<Link>,
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("open", &self.is_open())
            .finish()
    }
}

impl LoopbackTransport {
    /// Two connected ends. Inbound messages of each end run on `dispatcher`.
    pub fn pair(dispatcher: Arc<dyn Dispatcher>) -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
        let link = Arc::new(Link {
            open: AtomicBool::new(true),
        });
        let endpoint = || {
            Arc::new(Endpoint {
                lane: SerialQueue::new(Arc::clone(&dispatcher)),
                receiver: Mutex::new(None),
                backlog: Mutex::new(Vec::new()),
            })
        };
        let a = endpoint();
        let b = endpoint();
        (
            Arc::new(LoopbackTransport {
                link: Arc::clone(&link),
                local: Arc::clone(&a),
                remote: Arc::clone(&b),
            }),
            Arc::new(LoopbackTransport {
                link,
                local: b,
                remote: a,
            }),
        )
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, bytes: Vec<u8>) -> StmResult<()> {
        if !self.is_open() {
            return Err(StmError::ConnectionClosed);
        }
        trace!(target: "mvstm::replication", bytes = bytes.len(), "Loopback send");
        self.remote.deliver(Some(Inbound::Message(bytes)));
        Ok(())
    }

    fn bind(&self, receiver: Weak<dyn Receiver>) {
        *self.local.receiver.lock() = Some(receiver);
        self.local.deliver(None);
    }

    fn close(&self) {
        if self.link.open.swap(false, Ordering::SeqCst) {
            self.local.deliver(Some(Inbound::Disconnect));
            self.remote.deliver(Some(Inbound::Disconnect));
        }
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }
}
