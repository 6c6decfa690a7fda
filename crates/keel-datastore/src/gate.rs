//! Initialization gate.
//!
//! `Pending ──open──► Ready ──close──► Closed`. The gate never goes back to
//! `Pending`. Callers that arrive while it is `Pending` wait instead of
//! failing.

use tokio::sync::watch;

use crate::error::{DataStoreError, DataStoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateState {
    Pending,
    Ready,
    Closed,
}

#[derive(Debug)]
pub(crate) struct InitGate {
    tx: watch::Sender<GateState>,
}

impl InitGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(GateState::Pending);
        InitGate { tx }
    }

    pub fn state(&self) -> GateState {
        *self.tx.borrow()
    }

    /// Pending → Ready. Returns false if the gate was not pending.
    pub fn open(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == GateState::Pending {
                *state = GateState::Ready;
                true
            } else {
                false
            }
        })
    }

    /// Closes the gate for good; waiters get `NotInitialized`.
    pub fn close(&self) {
        self.tx.send_replace(GateState::Closed);
    }

    /// Waits until the gate leaves `Pending`.
    pub async fn ready(&self) -> DataStoreResult<()> {
        let mut rx = self.tx.subscribe();
        let state = match rx.wait_for(|state| *state != GateState::Pending).await {
            Ok(state) => *state,
            Err(_) => GateState::Closed,
        };
        match state {
            GateState::Ready => Ok(()),
            _ => Err(DataStoreError::NotInitialized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waiters_released_on_open() {
        let gate = Arc::new(InitGate::new());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ready().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(gate.open());
        assert!(waiter.await.unwrap().is_ok());
        assert!(!gate.open());
    }

    #[tokio::test]
    async fn test_closed_gate_rejects() {
        let gate = InitGate::new();
        gate.open();
        gate.close();
        assert!(matches!(gate.ready().await, Err(DataStoreError::NotInitialized)));
        assert!(!gate.open());
        assert_eq!(gate.state(), GateState::Closed);
    }
}
