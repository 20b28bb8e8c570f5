//! Exclusive ownership of one native protocol handle.

use std::fmt;

use crate::options::ConnectionKey;
use crate::protocol::ProtocolHandle;

/// Sole owner of a native protocol handle and the key it was opened with.
///
/// A holder belongs to exactly one entity at a time: the connection it was
/// assembled into, an operation that took that connection over, or the
/// recycle callback it is finally handed to. Dropping a holder closes the
/// native handle.
pub struct ConnectionHolder {
    handle: Box<dyn ProtocolHandle>,
    key: ConnectionKey,
    reusable: bool,
    needs_reset_before_reuse: bool,
}

impl ConnectionHolder {
    pub(crate) fn new(handle: Box<dyn ProtocolHandle>, key: ConnectionKey) -> Self {
        Self {
            handle,
            key,
            reusable: true,
            needs_reset_before_reuse: false,
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Rewrites the key after a successful change-user.
    pub(crate) fn set_key(&mut self, key: ConnectionKey) {
        self.key = key;
    }

    pub(crate) fn handle(&self) -> &dyn ProtocolHandle {
        self.handle.as_ref()
    }

    pub(crate) fn handle_mut(&mut self) -> &mut dyn ProtocolHandle {
        self.handle.as_mut()
    }

    /// Whether the native session is still usable at all.
    pub fn ok(&self) -> bool {
        self.handle.ok()
    }

    pub fn in_transaction(&self) -> bool {
        self.handle.server_status().in_transaction
    }

    /// Whether the server session is in a state suitable for reuse by a
    /// pool. Cleared when an operation fails or is torn down mid-flight.
    pub fn is_reusable(&self) -> bool {
        self.reusable && self.ok()
    }

    pub(crate) fn mark_not_reusable(&mut self) {
        self.reusable = false;
    }

    pub(crate) fn mark_reusable(&mut self) {
        self.reusable = true;
    }

    /// Deferred hygiene marker: the session was recycled without a reset and
    /// the pool must issue one before handing it out again.
    pub fn needs_reset_before_reuse(&self) -> bool {
        self.needs_reset_before_reuse
    }

    pub(crate) fn mark_needs_reset(&mut self) {
        self.needs_reset_before_reuse = true;
    }

    pub(crate) fn clear_needs_reset(&mut self) {
        self.needs_reset_before_reuse = false;
    }
}

impl fmt::Debug for ConnectionHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHolder")
            .field("key", &self.key)
            .field("reusable", &self.reusable)
            .field("needs_reset_before_reuse", &self.needs_reset_before_reuse)
            .finish_non_exhaustive()
    }
}
