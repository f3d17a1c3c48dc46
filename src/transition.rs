//! Transitions (edges) between the actions of a net.

use crate::action::{ActionId, ActionResult};
use std::{fmt, time::Duration};

/// Unique ID identifying a [`Transition`] within a net.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransitionId(u64);

/// The default minimum delay between two evaluations of a transition's
/// predicate within one activation of its source action.
pub const DEFAULT_EVALUATION_DELAY: Duration = Duration::from_millis(10);

/// User code deciding whether a transition can be crossed.
///
/// Any `Fn(ActionResult) -> bool + Send + Sync` closure is a predicate. The
/// [`will_test`](Self::will_test) and [`did_test`](Self::did_test) hooks
/// bracket the polling phase of one activation of the source action and
/// default to no-ops.
pub trait TransitionPredicate: Send + Sync {
    /// Whether the transition is fulfilled, given the result of its source
    /// action.
    fn test(&self, result: ActionResult) -> bool;

    /// Invoked once per activation of the source action, before the first
    /// evaluation of the predicate.
    fn will_test(&self) {}

    /// Invoked once per activation of the source action, after the last
    /// evaluation of the predicate.
    fn did_test(&self) {}
}

/// A directed edge from a `previous` to a `next` action.
///
/// Owned by the net node of its source action; endpoints are referenced by
/// stable id, which both outlive the transition.
pub struct Transition {
    id: TransitionId,
    name: String,
    previous: ActionId,
    next: ActionId,
    predicate: Box<dyn TransitionPredicate>,
    delay_between_evaluation: Duration,
}

impl TransitionId {
    #[inline]
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u64())
    }
}

impl<F> TransitionPredicate for F
where
    F: Fn(ActionResult) -> bool + Send + Sync,
{
    fn test(&self, result: ActionResult) -> bool {
        self(result)
    }
}

impl Transition {
    pub(crate) fn new(
        id: TransitionId,
        name: String,
        previous: ActionId,
        next: ActionId,
        predicate: Box<dyn TransitionPredicate>,
        delay_between_evaluation: Duration,
    ) -> Self {
        Self {
            id,
            name,
            previous,
            next,
            predicate,
            delay_between_evaluation,
        }
    }

    pub fn id(&self) -> TransitionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The starting point of the transition.
    pub fn previous(&self) -> ActionId {
        self.previous
    }

    /// The arrival point of the transition.
    pub fn next(&self) -> ActionId {
        self.next
    }

    /// The minimum delay between two evaluations of the predicate within one
    /// activation of the source action. This is a rate limit, not a
    /// deadline.
    pub fn delay_between_evaluation(&self) -> Duration {
        self.delay_between_evaluation
    }

    pub(crate) fn test(&self, result: ActionResult) -> bool {
        self.predicate.test(result)
    }

    pub(crate) fn will_test(&self) {
        self.predicate.will_test();
    }

    pub(crate) fn did_test(&self) {
        self.predicate.did_test();
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("previous", &self.previous)
            .field("next", &self.next)
            .field("delay_between_evaluation", &self.delay_between_evaluation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_transition_predicates() {
        let predicate = |result: ActionResult| result == ActionResult::OK;
        assert!(predicate.test(ActionResult::OK));
        assert!(!predicate.test(ActionResult::NOK));
    }

    #[test]
    fn transition_defaults_to_the_standard_evaluation_delay() {
        let transition = Transition::new(
            TransitionId::from_u64(0),
            "t".to_string(),
            ActionId::from_u64(1),
            ActionId::from_u64(2),
            Box::new(|_| true),
            DEFAULT_EVALUATION_DELAY,
        );
        assert_eq!(
            transition.delay_between_evaluation(),
            Duration::from_millis(10)
        );
    }
}
