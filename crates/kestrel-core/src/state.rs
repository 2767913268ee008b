//! VM lifecycle states and the watch cell that publishes them.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Current state of a VM handle.
///
/// ```text
/// Initializing ──prepare──▶ Ready ──start──▶ Changing ──▶ Alive
///                             ▲                  │          │
///                             └──────────────────┴──stop────┘
///                        Changing ──retry budget exhausted──▶ Broken
///                        any ──close──▶ Deleted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Handle allocated, resources not yet prepared.
    Initializing,
    /// Prepared and powered off.
    Ready,
    /// Start or stop in progress.
    Changing,
    /// Guest is running.
    Alive,
    /// A start or stop did not complete; needs a forced stop.
    Broken,
    /// Closed and released. Terminal.
    Deleted,
}

impl VmState {
    /// Lowercase name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Changing => "changing",
            Self::Alive => "alive",
            Self::Broken => "broken",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable VM state.
///
/// Every update is a compare-and-set on the watch channel, so concurrent
/// writers (the exit watcher and an explicit stop, for example) never
/// overwrite a transition they did not expect.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<VmState>,
}

impl StateCell {
    pub(crate) fn new(initial: VmState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub(crate) fn get(&self) -> VmState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<VmState> {
        self.tx.subscribe()
    }

    /// Move to `to` if the current state is one of `from`.
    ///
    /// Returns the previous state on success and the actual state on failure.
    pub(crate) fn transition(&self, from: &[VmState], to: VmState) -> Result<VmState, VmState> {
        let mut outcome = Err(to);
        self.tx.send_if_modified(|current| {
            if from.contains(current) {
                outcome = Ok(*current);
                *current = to;
                true
            } else {
                outcome = Err(*current);
                false
            }
        });
        outcome
    }

    /// Unconditionally move to `to`, unless the handle is already deleted.
    pub(crate) fn force(&self, to: VmState) -> VmState {
        let mut previous = to;
        self.tx.send_if_modified(|current| {
            previous = *current;
            if *current == VmState::Deleted || *current == to {
                return false;
            }
            *current = to;
            true
        });
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_lowercase() {
        assert_eq!(VmState::Initializing.to_string(), "initializing");
        assert_eq!(VmState::Alive.to_string(), "alive");
        assert_eq!(
            serde_json::to_string(&VmState::Broken).unwrap(),
            "\"broken\""
        );
    }

    #[test]
    fn test_transition_checks_source_state() {
        let cell = StateCell::new(VmState::Ready);
        assert_eq!(
            cell.transition(&[VmState::Alive], VmState::Changing),
            Err(VmState::Ready)
        );
        assert_eq!(cell.get(), VmState::Ready);

        assert_eq!(
            cell.transition(&[VmState::Ready], VmState::Changing),
            Ok(VmState::Ready)
        );
        assert_eq!(cell.get(), VmState::Changing);
    }

    #[test]
    fn test_deleted_is_terminal() {
        let cell = StateCell::new(VmState::Alive);
        cell.force(VmState::Deleted);
        assert_eq!(cell.force(VmState::Ready), VmState::Deleted);
        assert_eq!(cell.get(), VmState::Deleted);
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let cell = StateCell::new(VmState::Initializing);
        let mut rx = cell.subscribe();
        cell.transition(&[VmState::Initializing], VmState::Ready)
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), VmState::Ready);
    }
}
