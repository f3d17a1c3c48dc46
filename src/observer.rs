//! Observer hooks for net state changes.

use crate::action::Action;

/// Callbacks fired by the scheduler as actions are enabled and disabled.
///
/// All methods default to no-ops, so implementations override only what
/// they need. A net without an observer pays a single branch per hook.
///
/// `state_enabled` and `state_disabled` are invoked with the activation lock
/// held; implementations must not call back into the net and must not
/// block. [`enable_checkpoint`](Self::enable_checkpoint) runs on the worker
/// thread at the start of an activation, before the action's handler, and
/// is the one hook that may block (it is how the debug session pauses a
/// net).
pub trait NetObserver: Send + Sync {
    /// An action was promoted to active and its runner is about to be
    /// submitted to the pool.
    fn state_enabled(&self, _action: &Action) {}

    /// An action's activation has finished.
    fn state_disabled(&self, _action: &Action) {}

    /// Checkpoint executed by the runner before the action's handler.
    fn enable_checkpoint(&self, _action: &Action) {}

    /// The net has stopped.
    fn net_stopped(&self) {}
}
