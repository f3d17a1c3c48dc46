//! The per-activation action runner.

use crate::{
    action::{Action, ActionResult},
    net::NetInner,
    transition::Transition,
};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// Upper bound on one poll-loop sleep. Bounds the latency with which a
/// runner observes `stop()`.
const POLL_SLEEP_QUANTUM: Duration = Duration::from_millis(1);

/// Executes one activation of the given action: runs the handler, polls the
/// outgoing transitions until at least one is fulfilled (or the net stops),
/// delivers tokens to the fulfilled successors, and deactivates itself.
pub(crate) fn execute_state(inner: &Arc<NetInner>, action: &Arc<Action>) {
    if let Some(observer) = inner.observer() {
        observer.enable_checkpoint(action);
    }

    let result = invoke_handler(action);

    let transitions = inner.outgoing_transitions(action.id());
    for transition in &transitions {
        notify_will_test(transition);
    }

    let mut last_test: Option<Instant> = None;
    let mut deactivate = false;
    let mut fulfilled = Vec::with_capacity(transitions.len());

    loop {
        // An action without outgoing transitions runs once and deactivates
        if !inner.running() || transitions.is_empty() {
            break;
        }

        let now = Instant::now();
        let mut min_delay = Duration::MAX;
        fulfilled.clear();

        for transition in &transitions {
            // Rate-limit evaluation per transition; the first iteration
            // evaluates everything
            let elapsed = last_test.map_or(Duration::MAX, |last_test| now - last_test);
            if elapsed >= transition.delay_between_evaluation() {
                if evaluate(transition, result) {
                    fulfilled.push(Arc::clone(transition));
                }
                min_delay = min_delay.min(transition.delay_between_evaluation());
            } else {
                min_delay = min_delay.min(transition.delay_between_evaluation() - elapsed);
            }
        }
        last_test = Some(now);

        if inner.deliver_tokens(&fulfilled) {
            deactivate = true;
        }

        // Sleep out the remaining interval in quanta so that a stop is
        // observed promptly
        while inner.running() && now.elapsed() <= min_delay {
            thread::sleep(POLL_SLEEP_QUANTUM.min(min_delay));
        }

        if deactivate {
            break;
        }
    }

    for transition in &transitions {
        notify_did_test(transition);
    }

    inner.deactivate(action.id());
}

/// Invokes the action's handler, containing any panic. A panicking handler
/// is logged and yields the default result.
fn invoke_handler(action: &Arc<Action>) -> ActionResult {
    panic::catch_unwind(AssertUnwindSafe(|| action.invoke_handler())).unwrap_or_else(|_| {
        cascade_log::error!(
            "Handler of action {} ({}) panicked; substituting the default result",
            action.name(),
            action.id()
        );
        ActionResult::default()
    })
}

/// Evaluates the transition's predicate, containing any panic. A panicking
/// predicate is logged and treated as not fulfilled for this iteration.
fn evaluate(transition: &Arc<Transition>, result: ActionResult) -> bool {
    panic::catch_unwind(AssertUnwindSafe(|| transition.test(result))).unwrap_or_else(|_| {
        cascade_log::error!(
            "Condition of transition {} ({}) panicked; treating it as not fulfilled",
            transition.name(),
            transition.id()
        );
        false
    })
}

fn notify_will_test(transition: &Arc<Transition>) {
    if panic::catch_unwind(AssertUnwindSafe(|| transition.will_test())).is_err() {
        cascade_log::error!("willTest hook of transition {} panicked", transition.id());
    }
}

fn notify_did_test(transition: &Arc<Transition>) {
    if panic::catch_unwind(AssertUnwindSafe(|| transition.did_test())).is_err() {
        cascade_log::error!("didTest hook of transition {} panicked", transition.id());
    }
}
