//! Integration tests for net execution.

use cascade::{ActionResult, Net};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::{
    thread,
    time::{Duration, Instant},
};

fn wait_until_stopped(net: &Net, timeout: Duration) {
    let _ = env_logger::builder().is_test(true).try_init();
    let deadline = Instant::now() + timeout;
    while net.running() {
        assert!(
            Instant::now() < deadline,
            "Net {} did not terminate in time",
            net.name()
        );
        thread::sleep(Duration::from_millis(5));
    }
}

fn recording_handler(
    events: Sender<&'static str>,
    tag: &'static str,
) -> impl Fn() -> ActionResult + Send + Sync {
    move || {
        events.send(tag).unwrap();
        ActionResult::OK
    }
}

fn drain(events: &Receiver<&'static str>) -> Vec<&'static str> {
    events.try_iter().collect()
}

#[test]
fn linear_chain_runs_each_action_once_and_terminates() {
    let net = Net::new("chain");
    let (tx, rx) = unbounded();

    net.add_action(1, "a", recording_handler(tx.clone(), "a"), 1, true)
        .unwrap();
    net.add_action(2, "b", recording_handler(tx.clone(), "b"), 1, false)
        .unwrap();
    net.add_action(3, "c", recording_handler(tx.clone(), "c"), 1, false)
        .unwrap();
    net.connect(1, 2, |_| true).unwrap();
    net.connect(2, 3, |_| true).unwrap();

    net.run().unwrap();
    wait_until_stopped(&net, Duration::from_secs(5));

    assert_eq!(drain(&rx), ["a", "b", "c"]);
    assert!(!net.running());
}

#[test]
fn join_runs_once_after_both_predecessors_fired() {
    let net = Net::new("join");
    let (tx, rx) = unbounded();

    net.add_action(1, "a", recording_handler(tx.clone(), "a"), 1, true)
        .unwrap();
    net.add_action(2, "b", recording_handler(tx.clone(), "b"), 1, true)
        .unwrap();
    net.add_action(3, "j", recording_handler(tx.clone(), "j"), 2, false)
        .unwrap();
    net.connect(1, 3, |_| true).unwrap();
    net.connect(2, 3, |_| true).unwrap();

    net.run().unwrap();
    wait_until_stopped(&net, Duration::from_secs(5));

    let executed = drain(&rx);
    assert_eq!(executed.len(), 3);
    assert_eq!(executed.iter().filter(|&&tag| tag == "j").count(), 1);
    assert_eq!(executed[2], "j", "The join must run after both predecessors");
}

#[test]
fn earlier_transition_wins_a_choice() {
    let net = Net::new("choice");
    let (tx, rx) = unbounded();
    let start = Instant::now();

    net.add_action(1, "a", recording_handler(tx.clone(), "a"), 1, true)
        .unwrap();
    net.add_action(2, "b", recording_handler(tx.clone(), "b"), 1, false)
        .unwrap();
    net.add_action(3, "c", recording_handler(tx.clone(), "c"), 1, false)
        .unwrap();
    net.connect_with_delay(
        1,
        2,
        move |_| start.elapsed() >= Duration::from_millis(50),
        Duration::from_millis(10),
    )
    .unwrap();
    net.connect_with_delay(
        1,
        3,
        move |_| start.elapsed() >= Duration::from_millis(200),
        Duration::from_millis(10),
    )
    .unwrap();

    net.run().unwrap();
    wait_until_stopped(&net, Duration::from_secs(5));

    assert_eq!(drain(&rx), ["a", "b"]);
}

#[test]
fn starved_successor_is_discarded_with_a_warning() {
    let net = Net::new("orphan");
    let (tx, rx) = unbounded();

    net.add_action(1, "a", recording_handler(tx.clone(), "a"), 1, true)
        .unwrap();
    net.add_action(2, "b", recording_handler(tx.clone(), "b"), 2, false)
        .unwrap();
    net.connect(1, 2, |_| true).unwrap();

    net.run().unwrap();
    // The single token delivered to `b` can never reach its threshold of
    // two, so the net must detect the starvation and stop by itself
    wait_until_stopped(&net, Duration::from_secs(5));

    assert_eq!(drain(&rx), ["a"]);
}

#[test]
fn zero_delay_transition_fires() {
    let net = Net::new("eager");
    let (tx, rx) = unbounded();

    net.add_action(1, "a", recording_handler(tx.clone(), "a"), 1, true)
        .unwrap();
    net.add_action(2, "b", recording_handler(tx.clone(), "b"), 1, false)
        .unwrap();
    net.connect_with_delay(1, 2, |_| true, Duration::ZERO).unwrap();

    net.run().unwrap();
    wait_until_stopped(&net, Duration::from_secs(5));

    assert_eq!(drain(&rx), ["a", "b"]);
}

#[test]
fn wide_fanout_grows_the_pool_and_completes() {
    let net = Net::new("fanout");
    let (tx, rx) = unbounded();

    net.add_action(1, "source", recording_handler(tx.clone(), "source"), 1, true)
        .unwrap();
    for id in 10..18_u64 {
        let events = tx.clone();
        net.add_action(
            id,
            format!("sink {id}"),
            move || {
                thread::sleep(Duration::from_millis(30));
                events.send("sink").unwrap();
                ActionResult::OK
            },
            1,
            false,
        )
        .unwrap();
        net.connect(1, id, |_| true).unwrap();
    }

    net.run().unwrap();
    wait_until_stopped(&net, Duration::from_secs(10));

    let executed = drain(&rx);
    assert_eq!(executed.iter().filter(|&&tag| tag == "source").count(), 1);
    assert_eq!(executed.iter().filter(|&&tag| tag == "sink").count(), 8);
}

#[test]
fn panicking_user_code_is_contained() {
    let net = Net::new("faulty");
    let (tx, rx) = unbounded();

    net.add_action(
        1,
        "a",
        || -> ActionResult { panic!("Intentional handler panic") },
        1,
        true,
    )
    .unwrap();
    net.add_action(2, "b", recording_handler(tx.clone(), "b"), 1, false)
        .unwrap();
    // First predicate panics every time and must read as "not fulfilled";
    // the second one carries the token
    net.connect(1, 2, |_| -> bool { panic!("Intentional condition panic") })
        .unwrap();
    net.connect(1, 2, |result| result == ActionResult::default())
        .unwrap();

    net.run().unwrap();
    wait_until_stopped(&net, Duration::from_secs(5));

    assert_eq!(drain(&rx), ["b"]);
}

#[test]
fn running_twice_fails() {
    let net = Net::new("rerun");
    net.add_default_action(1, "a", 1, true).unwrap();
    net.add_default_action(2, "b", 1, false).unwrap();
    // Never fulfilled, so the net keeps polling until stopped
    net.connect(1, 2, |_| false).unwrap();

    net.run().unwrap();
    assert!(net.run().is_err());
    net.stop();
    assert!(!net.running());
}

#[test]
fn stopping_twice_behaves_as_one_stop() {
    let net = Net::new("stop twice");
    net.add_default_action(1, "a", 1, true).unwrap();
    net.add_default_action(2, "b", 1, false).unwrap();
    net.connect(1, 2, |_| false).unwrap();

    net.run().unwrap();
    net.stop();
    net.stop();
    assert!(!net.running());
}

#[test]
fn empty_initial_marking_refuses_to_run() {
    let net = Net::new("idle");
    net.add_default_action(1, "a", 1, false).unwrap();
    assert!(net.run().is_err());
    assert!(!net.running());
}

#[test]
fn zero_token_threshold_is_rejected() {
    let net = Net::new("invalid");
    assert!(net.add_default_action(1, "a", 0, false).is_err());
}

#[test]
fn duplicate_action_ids_are_rejected() {
    let net = Net::new("duplicate");
    net.add_default_action(1, "a", 1, false).unwrap();
    assert!(net.add_default_action(1, "again", 1, false).is_err());
}

#[test]
fn connecting_unknown_actions_fails() {
    let net = Net::new("unknown");
    net.add_default_action(1, "a", 1, false).unwrap();
    assert!(net.connect(1, 99, |_| true).is_err());
    assert!(net.connect(99, 1, |_| true).is_err());
}

#[test]
fn modifying_a_running_net_fails() {
    let net = Net::new("frozen");
    net.add_default_action(1, "a", 1, true).unwrap();
    net.add_default_action(2, "b", 1, false).unwrap();
    net.connect(1, 2, |_| false).unwrap();

    net.run().unwrap();
    assert!(net.add_default_action(3, "c", 1, false).is_err());
    assert!(net.connect(1, 2, |_| true).is_err());
    net.stop();
}

#[test]
fn actions_are_reachable_by_id() {
    let net = Net::new("lookup");
    net.add_default_action(7, "lucky", 3, false).unwrap();

    let action = net.action(7).unwrap();
    assert_eq!(action.name(), "lucky");
    assert_eq!(action.required_tokens().get(), 3);
    assert!(net.action(8).is_none());
}

#[test]
fn transition_hooks_bracket_the_polling_phase() {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    struct CountingPredicate {
        will: Arc<AtomicUsize>,
        did: Arc<AtomicUsize>,
    }

    impl cascade::TransitionPredicate for CountingPredicate {
        fn test(&self, _result: ActionResult) -> bool {
            // Both hooks must already have fired in the right order
            assert_eq!(self.will.load(Ordering::SeqCst), 1);
            assert_eq!(self.did.load(Ordering::SeqCst), 0);
            true
        }

        fn will_test(&self) {
            self.will.fetch_add(1, Ordering::SeqCst);
        }

        fn did_test(&self) {
            self.did.fetch_add(1, Ordering::SeqCst);
        }
    }

    let will = Arc::new(AtomicUsize::new(0));
    let did = Arc::new(AtomicUsize::new(0));

    let net = Net::new("hooks");
    net.add_default_action(1, "a", 1, true).unwrap();
    net.add_default_action(2, "b", 1, false).unwrap();
    net.connect(
        1,
        2,
        CountingPredicate {
            will: Arc::clone(&will),
            did: Arc::clone(&did),
        },
    )
    .unwrap();

    net.run().unwrap();
    wait_until_stopped(&net, Duration::from_secs(5));

    assert_eq!(will.load(Ordering::SeqCst), 1);
    assert_eq!(did.load(Ordering::SeqCst), 1);
}
