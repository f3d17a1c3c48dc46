//! Integration tests for the debug session, driven through a real TCP
//! client.

use anyhow::Result;
use cascade::{
    ActionResult, Net,
    debug::{
        DebugSession, NetFactory,
        protocol::{self, Command, Event, PROTOCOL_VERSION},
        structural_hash,
    },
};
use crossbeam_channel::{Sender, unbounded};
use std::{
    net::TcpStream,
    thread,
    time::{Duration, Instant},
};

/// A factory building a two-action chain `a -> b` whose executions are
/// reported on a channel.
struct ChainFactory {
    events: Sender<&'static str>,
}

impl ChainFactory {
    fn build_chain(&self) -> Result<Net> {
        let net = Net::new("debug chain");
        let events = self.events.clone();
        net.add_action(
            1,
            "a",
            move || {
                events.send("a").unwrap();
                ActionResult::OK
            },
            1,
            true,
        )?;
        let events = self.events.clone();
        net.add_action(
            2,
            "b",
            move || {
                events.send("b").unwrap();
                ActionResult::OK
            },
            1,
            false,
        )?;
        net.connect_with_delay(1, 2, |_| true, Duration::from_millis(1))?;
        Ok(net)
    }
}

impl NetFactory for ChainFactory {
    fn name(&self) -> &str {
        "debug chain"
    }

    fn hash(&self) -> String {
        structural_hash(&self.build_chain().unwrap())
    }

    fn build(&self) -> Result<Net> {
        self.build_chain()
    }
}

struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    fn connect(port: u16) -> Self {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => return Self { stream },
                Err(err) => {
                    assert!(Instant::now() < deadline, "Could not connect: {err}");
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    fn send(&mut self, command: &Command) {
        protocol::write_frame(&mut self.stream, command).unwrap();
    }

    fn recv(&mut self) -> Result<Event> {
        protocol::read_frame(&mut self.stream)
    }

    /// Receives events until one matches the predicate, skipping heartbeats
    /// and state reports along the way.
    fn recv_until(&mut self, what: &str, matches: impl Fn(&Event) -> bool) -> Event {
        for _ in 0..100 {
            let event = self
                .recv()
                .unwrap_or_else(|err| panic!("Connection ended while waiting for {what}: {err:#}"));
            if matches(&event) {
                return event;
            }
        }
        panic!("Gave up waiting for {what}");
    }

    fn recv_ack(&mut self, what: &str) -> Event {
        self.recv_until(what, |event| {
            matches!(event, Event::Ack(payload) if payload["what"] == what)
        })
    }
}

fn ack_payload(event: &Event) -> &serde_json::Value {
    match event {
        Event::Ack(payload) => payload,
        other => panic!("Expected an ack, got {other:?}"),
    }
}

fn session_with_client(factory: impl NetFactory + 'static) -> (DebugSession, TestClient) {
    let _ = env_logger::builder().is_test(true).try_init();
    let session = DebugSession::new(factory, 0);
    session.start().unwrap();
    let client = TestClient::connect(session.local_port().unwrap());
    (session, client)
}

fn handshake(client: &mut TestClient, hash: String) {
    client.send(&Command::Hello {
        version: PROTOCOL_VERSION.to_string(),
        hash,
    });
    let ack = client.recv().unwrap();
    assert_eq!(ack_payload(&ack)["version"], PROTOCOL_VERSION);
}

#[test]
fn hash_mismatch_is_rejected_and_the_connection_closed() {
    let (session, mut client) = session_with_client(ChainFactory {
        events: unbounded().0,
    });

    client.send(&Command::Hello {
        version: PROTOCOL_VERSION.to_string(),
        hash: "deadbeef".to_string(),
    });

    let event = client.recv().unwrap();
    assert!(
        matches!(event, Event::Error { ref message } if message.contains("hash")),
        "Expected a hash mismatch error, got {event:?}"
    );

    // The session closes the connection but keeps serving
    assert!(client.recv().is_err());
    assert!(session.running());
    session.stop();
}

#[test]
fn version_mismatch_is_rejected() {
    let (session, mut client) = session_with_client(ChainFactory {
        events: unbounded().0,
    });

    client.send(&Command::Hello {
        version: "0.0.0-nope".to_string(),
        hash: "irrelevant".to_string(),
    });

    let event = client.recv().unwrap();
    assert!(matches!(event, Event::Error { ref message } if message.contains("Version")));
    session.stop();
}

#[test]
fn breakpoint_pauses_the_activation_until_resumed() {
    let (events, executed) = unbounded();
    let factory = ChainFactory { events };
    let hash = factory.hash();
    let (session, mut client) = session_with_client(factory);

    handshake(&mut client, hash);

    client.send(&Command::Breakpoints { ids: vec![2] });
    client.recv_ack("breakpoints");

    client.send(&Command::Start {});
    client.recv_ack("start");

    // `a` runs immediately; `b` hits the breakpoint and must block at the
    // enable checkpoint
    assert_eq!(executed.recv_timeout(Duration::from_secs(2)), Ok("a"));
    assert!(
        executed.recv_timeout(Duration::from_millis(300)).is_err(),
        "b ran although it is breakpointed"
    );

    client.send(&Command::Pause { pause: false });
    client.recv_ack("pause");

    assert_eq!(executed.recv_timeout(Duration::from_secs(2)), Ok("b"));

    // With nothing active anymore the net stops autonomously
    client.recv_ack("stopped");
    session.stop();
}

#[test]
fn pausing_before_start_defers_the_first_activation() {
    let (events, executed) = unbounded();
    let factory = ChainFactory { events };
    let hash = factory.hash();
    let (session, mut client) = session_with_client(factory);

    handshake(&mut client, hash);

    client.send(&Command::Pause { pause: true });
    client.recv_ack("pause");

    client.send(&Command::Start {});
    client.recv_ack("start");

    assert!(
        executed.recv_timeout(Duration::from_millis(300)).is_err(),
        "The net ran although it is paused"
    );

    client.send(&Command::Pause { pause: false });
    client.recv_ack("pause");

    assert_eq!(executed.recv_timeout(Duration::from_secs(2)), Ok("a"));
    assert_eq!(executed.recv_timeout(Duration::from_secs(2)), Ok("b"));
    client.recv_ack("stopped");
    session.stop();
}

#[test]
fn states_events_report_the_active_set_and_are_suppressed_when_unchanged() {
    let (events, _executed) = unbounded();

    struct SlowFactory {
        events: Sender<&'static str>,
    }

    impl NetFactory for SlowFactory {
        fn name(&self) -> &str {
            "slow"
        }

        fn hash(&self) -> String {
            structural_hash(&self.build().unwrap())
        }

        fn build(&self) -> Result<Net> {
            let net = Net::new("slow");
            let events = self.events.clone();
            net.add_action(
                1,
                "slow",
                move || {
                    thread::sleep(Duration::from_millis(400));
                    events.send("slow").unwrap();
                    ActionResult::OK
                },
                1,
                true,
            )?;
            Ok(net)
        }
    }

    let factory = SlowFactory { events };
    let hash = factory.hash();
    let (session, mut client) = session_with_client(factory);

    handshake(&mut client, hash);
    client.send(&Command::Start {});
    client.recv_ack("start");

    // While the action runs, a states event must report it as active
    let states = client.recv_until("a states report", |event| {
        matches!(event, Event::States { states } if !states.is_empty())
    });
    if let Event::States { states } = states {
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].id, 1);
        assert_eq!(states[0].count, 1);
    }

    client.recv_ack("stopped");

    // With no further change, only heartbeats may arrive
    assert_no_states_for(&mut client, Duration::from_millis(1500));
    session.stop();
}

fn assert_no_states_for(client: &mut TestClient, window: Duration) {
    client.stream.set_read_timeout(Some(window)).unwrap();
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        match client.recv() {
            Ok(Event::States { states }) => {
                panic!("Unexpected states event without a state change: {states:?}")
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    client.stream.set_read_timeout(None).unwrap();
}

#[test]
fn exit_ends_the_session() {
    let factory = ChainFactory {
        events: unbounded().0,
    };
    let hash = factory.hash();
    let (session, mut client) = session_with_client(factory);

    handshake(&mut client, hash);
    client.send(&Command::Exit {});

    let event = client.recv_until("the exit event", |event| matches!(event, Event::Exit { .. }));
    assert!(matches!(event, Event::Exit { .. }));

    let deadline = Instant::now() + Duration::from_secs(2);
    while session.running() {
        assert!(Instant::now() < deadline, "Session did not end on exit");
        thread::sleep(Duration::from_millis(10));
    }
    session.stop();
}

#[test]
fn reload_rebuilds_the_net_for_another_run() {
    let (events, executed) = unbounded();
    let factory = ChainFactory { events };
    let hash = factory.hash();
    let (session, mut client) = session_with_client(factory);

    handshake(&mut client, hash);

    client.send(&Command::Start {});
    client.recv_ack("start");
    assert_eq!(executed.recv_timeout(Duration::from_secs(2)), Ok("a"));
    assert_eq!(executed.recv_timeout(Duration::from_secs(2)), Ok("b"));
    client.recv_ack("stopped");

    client.send(&Command::Reload {});
    client.recv_ack("reload");

    client.send(&Command::Start {});
    client.recv_ack("start");
    assert_eq!(executed.recv_timeout(Duration::from_secs(2)), Ok("a"));
    assert_eq!(executed.recv_timeout(Duration::from_secs(2)), Ok("b"));
    client.recv_ack("stopped");

    session.stop();
}
