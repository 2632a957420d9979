use std::sync::Weak;
use std::time::Duration;

use bytes::Bytes;

use crate::service::{SendCompletion, ServiceShared};

/// Identifies one connection: which loop owns it, which table slot it
/// occupies, and the instance tag assigned when the slot was claimed.
///
/// The instance tag detects slot reuse: an id is valid only while the slot's
/// current occupant carries the same tag. Ids are plain values, freely
/// copyable across threads, and never alias memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    loop_index: u16,
    slot: u16,
    instance: u32,
}

impl SessionId {
    pub(crate) fn new(loop_index: u16, slot: u16, instance: u32) -> Self {
        SessionId {
            loop_index,
            slot,
            instance,
        }
    }

    /// The index of the owning event loop within the pool.
    pub fn loop_index(&self) -> u16 {
        self.loop_index
    }

    /// The connection-table slot on the owning loop.
    pub fn slot(&self) -> u16 {
        self.slot
    }

    /// The reuse-detecting instance tag.
    pub fn instance(&self) -> u32 {
        self.instance
    }

    /// Pack into a single integer. Lossless: `from_u64(as_u64())` yields the
    /// same three fields.
    pub fn as_u64(&self) -> u64 {
        ((self.loop_index as u64) << 48) | ((self.slot as u64) << 32) | (self.instance as u64)
    }

    /// Unpack an id previously produced by [`as_u64`](Self::as_u64).
    pub fn from_u64(v: u64) -> Self {
        SessionId {
            loop_index: (v >> 48) as u16,
            slot: (v >> 32) as u16,
            instance: v as u32,
        }
    }
}

/// Cheap-clone handle to one session, safe to retain on any thread even past
/// the connection's death.
///
/// Every operation routes to the owning loop and re-validates the id there;
/// operations on a stale handle (slot reused or connection gone) are silent
/// no-ops. Nothing here blocks the caller.
#[derive(Clone)]
pub struct Session {
    pub(crate) svc: Weak<ServiceShared>,
    pub(crate) id: SessionId,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue bytes for ordered delivery. Payloads from repeated calls are
    /// delivered back-to-back in call order.
    pub fn send(&self, data: impl Into<Bytes>) {
        if let Some(svc) = self.svc.upgrade() {
            svc.send(self.id, data.into(), None);
        }
    }

    /// Like [`send`](Self::send), with a completion callback invoked on the
    /// owning loop thread once the payload has been fully written.
    pub fn send_with(&self, data: impl Into<Bytes>, on_sent: impl FnOnce() + Send + 'static) {
        if let Some(svc) = self.svc.upgrade() {
            svc.send(self.id, data.into(), Some(Box::new(on_sent) as SendCompletion));
        }
    }

    /// Half-close: stop accepting new sends, flush queued data, then close.
    /// The disconnect callback fires only after the outbound queue is empty.
    pub fn shutdown(&self) {
        if let Some(svc) = self.svc.upgrade() {
            svc.shutdown(self.id);
        }
    }

    /// Immediate close, discarding any queued outbound data.
    pub fn disconnect(&self) {
        if let Some(svc) = self.svc.upgrade() {
            svc.disconnect(self.id);
        }
    }

    /// Configure the idle check: the connection is closed if no bytes arrive
    /// within the interval. `None` disables the check.
    pub fn set_liveness_timeout(&self, timeout: Option<Duration>) {
        if let Some(svc) = self.svc.upgrade() {
            svc.set_liveness_timeout(self.id, timeout);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}
