//! Cancellation shared between a running session and its callers.
//!
//! A request and the session's move past `staged` are decided under one
//! lock: either the request lands first and the session stops at its next
//! checkpoint, or the session has already closed the gate and the request
//! is refused. A caller told `true` is never overtaken by the apply.

use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Gate {
    requested: bool,
    closed: bool,
}

/// Cancel requests for one agent.
#[derive(Debug, Default)]
pub struct CancelGate {
    gate: Mutex<Gate>,
}

impl CancelGate {
    /// A gate that starts closed, for a session already past `staged`.
    #[must_use]
    pub fn closed() -> Self {
        Self {
            gate: Mutex::new(Gate {
                requested: false,
                closed: true,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Gate> {
        // The state is two flags; a panic elsewhere cannot leave it torn.
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the session to stop. Returns false if it can no longer stop.
    pub fn request(&self) -> bool {
        let mut gate = self.lock();
        if gate.closed {
            return false;
        }
        gate.requested = true;
        true
    }

    /// Consume a pending request.
    pub(crate) fn take(&self) -> bool {
        std::mem::take(&mut self.lock().requested)
    }

    /// Accept requests for a cycle that starts before `staged` is left.
    pub(crate) fn open(&self) {
        self.lock().closed = false;
    }

    /// Refuse requests before leaving `staged`. Returns false, and stays
    /// open, if a request is already pending; the caller must then cancel
    /// instead.
    pub(crate) fn close(&self) -> bool {
        let mut gate = self.lock();
        if std::mem::take(&mut gate.requested) {
            return false;
        }
        gate.closed = true;
        true
    }

    /// Refuse requests between cycles. Returns whether one was still
    /// pending when the cycle ended.
    pub(crate) fn shut(&self) -> bool {
        let mut gate = self.lock();
        gate.closed = true;
        std::mem::take(&mut gate.requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_before_close_wins() {
        let gate = CancelGate::default();
        assert!(gate.request());
        assert!(!gate.close());
        // The request was consumed by the failed close.
        assert!(!gate.take());
        assert!(gate.close());
        assert!(!gate.request());
    }

    #[test]
    fn test_shut_between_cycles() {
        let gate = CancelGate::default();
        assert!(gate.request());
        assert!(gate.shut());
        assert!(!gate.request());
        assert!(!gate.shut());

        gate.open();
        assert!(gate.request());
        assert!(gate.take());
        assert!(!gate.take());
    }

    #[test]
    fn test_starts_closed_for_recovered_apply() {
        let gate = CancelGate::closed();
        assert!(!gate.request());
    }
}
