//! # Diagnostics Channel
//!
//! Problems the world recovers from on its own (inert modules, dropped
//! messages, unresolved update dependencies) are reported here once, in
//! addition to the log.
//!
//! The channel is bounded; when nobody drains it, new events are dropped
//! instead of growing memory.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

use crate::ecs::{ComponentHandle, GameObjectHandle};

/// A recoverable problem observed by the world.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Diagnostic {
    /// A module's `startup` or `reinit` failed; it is now inert.
    ModuleStartupFailed {
        /// Module type name.
        module: &'static str,
        /// Reported reason.
        reason: String,
    },
    /// A component's `initialize` failed; it is now inert.
    ComponentInitFailed {
        /// Component handle.
        component: ComponentHandle,
        /// Component type name.
        type_name: &'static str,
        /// Reported reason.
        reason: String,
    },
    /// A queued message was dropped before delivery.
    MessageDropped {
        /// Message type name.
        message: &'static str,
        /// Why it was dropped.
        reason: DropReason,
    },
    /// A post exceeded the configured re-post depth.
    RepostLimitExceeded {
        /// Message type name.
        message: &'static str,
        /// Depth the post would have had.
        depth: u32,
    },
    /// An update function depends on a name that never got scheduled.
    UnresolvedDependency {
        /// Function that was not scheduled.
        function: &'static str,
        /// Missing dependency.
        missing: &'static str,
    },
    /// A serialized component named a type this registry does not know.
    UnknownComponentType {
        /// Type name found in the stream.
        type_name: String,
        /// Object the component would have been attached to.
        owner: GameObjectHandle,
    },
    /// The async task graph could not be executed.
    AsyncPhaseFailed {
        /// Reported reason.
        reason: String,
    },
}

/// Why a message never reached its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The message type was never registered.
    Unregistered,
    /// The target handle no longer resolves.
    StaleTarget,
}

/// Sending side, owned by the world.
#[derive(Clone, Debug)]
pub struct DiagnosticSender {
    sender: Sender<Diagnostic>,
}

impl DiagnosticSender {
    /// Reports a diagnostic.
    ///
    /// Returns `false` if the channel is full or closed.
    pub fn report(&self, diagnostic: Diagnostic) -> bool {
        match self.sender.try_send(diagnostic) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                tracing::trace!(?dropped, "diagnostics channel full");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Receiving side, handed out by [`crate::World::diagnostics`].
#[derive(Clone, Debug)]
pub struct DiagnosticReceiver {
    receiver: Receiver<Diagnostic>,
}

impl DiagnosticReceiver {
    /// Takes one diagnostic if available.
    pub fn try_recv(&self) -> Option<Diagnostic> {
        match self.receiver.try_recv() {
            Ok(diagnostic) => Some(diagnostic),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Takes every pending diagnostic.
    pub fn drain(&self) -> Vec<Diagnostic> {
        self.receiver.try_iter().collect()
    }

    /// Number of diagnostics waiting.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }
}

/// Creates a connected sender/receiver pair.
#[must_use]
pub fn channel(capacity: usize) -> (DiagnosticSender, DiagnosticReceiver) {
    let (sender, receiver) = bounded(capacity.max(1));
    (DiagnosticSender { sender }, DiagnosticReceiver { receiver })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_and_drain() {
        let (tx, rx) = channel(4);
        assert!(tx.report(Diagnostic::AsyncPhaseFailed { reason: "x".into() }));
        assert_eq!(rx.pending_count(), 1);
        assert_eq!(rx.drain().len(), 1);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_full_channel_drops() {
        let (tx, rx) = channel(1);
        let event = Diagnostic::MessageDropped {
            message: "Ping",
            reason: DropReason::StaleTarget,
        };
        assert!(tx.report(event.clone()));
        assert!(!tx.report(event.clone()));
        assert_eq!(rx.try_recv(), Some(event));
    }
}
