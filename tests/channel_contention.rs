//! Sessions sharing one physical channel.

use daq_comm::transport::{MockBackend, MockCall, MockReply};
use daq_comm::{Address, ChannelMediator, CommError, RetryPolicy, Session, TransportSettings};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const POLL: Duration = Duration::from_millis(1);

fn settings() -> TransportSettings {
    TransportSettings::default().with_inter_command_delay(Duration::ZERO)
}

fn session(mock: &MockBackend, mediator: &Arc<ChannelMediator>, raw: &str) -> Session {
    Session::new(
        Address::parse(raw).unwrap(),
        Arc::new(mock.clone()),
        settings(),
        RetryPolicy::immediate(),
        mediator.clone(),
    )
}

#[tokio::test]
async fn scenario_d_waiter_issues_nothing_until_release() {
    let mediator = Arc::new(ChannelMediator::new());
    let mock = MockBackend::new();
    let a = session(&mock, &mediator, "COM5::1");
    let b = session(&mock, &mediator, "COM5::2");
    a.open().await.unwrap();
    b.open().await.unwrap();
    assert_eq!(mock.open_count(), 1);

    // Session A takes the channel and keeps it
    let channel = a.channel().unwrap();
    let guard = channel.acquire(a.id(), POLL).await.unwrap();
    assert!(mediator.is_busy("COM5"));
    let calls_before = mock.calls().len();

    let waiter = tokio::spawn({
        let b = b.clone();
        async move { b.query("MEAS?", None).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    assert_eq!(mock.calls().len(), calls_before);
    assert_eq!(mock.write_count(), 0);

    drop(guard);
    let response = waiter.await.unwrap().unwrap();
    assert_eq!(response.text(), "1.0");
    assert_eq!(mock.write_count(), 1);
    assert!(!mediator.is_busy("COM5"));
}

#[tokio::test]
async fn different_ports_do_not_block_each_other() {
    let mediator = Arc::new(ChannelMediator::new());
    let mock = MockBackend::new();
    let a = session(&mock, &mediator, "COM5");
    let b = session(&mock, &mediator, "COM6");
    a.open().await.unwrap();
    b.open().await.unwrap();

    let _held = a.channel().unwrap().acquire(a.id(), POLL).await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(1), b.query("X?", None))
        .await
        .expect("session on another port must not wait");
    assert!(response.is_ok());
    assert_eq!(mediator.channel_count(), 2);
}

#[tokio::test]
async fn channel_torn_down_and_rebuilt() {
    let mediator = Arc::new(ChannelMediator::new());
    let mock = MockBackend::new();
    let a = session(&mock, &mediator, "COM5::1");
    let b = session(&mock, &mediator, "COM5::2");
    a.open().await.unwrap();
    b.open().await.unwrap();
    let first = a.channel().unwrap().generation();

    a.close().await.unwrap();
    assert_eq!(mock.close_count(), 0);
    b.close().await.unwrap();
    assert_eq!(mock.close_count(), 1);
    assert_eq!(mediator.channel_count(), 0);

    a.open().await.unwrap();
    assert_eq!(mock.open_count(), 2);
    assert_ne!(a.channel().unwrap().generation(), first);
}

#[tokio::test]
async fn giving_up_leaves_other_occupants_working() {
    let mediator = Arc::new(ChannelMediator::new());
    // Address 1 never answers, address 2 always does
    let mock = MockBackend::new().with_responder(|written| {
        if written.starts_with(b"DEAD") {
            MockReply::fail("no reply")
        } else {
            MockReply::data("7")
        }
    });
    let dead = session(&mock, &mediator, "COM5::1");
    let alive = session(&mock, &mediator, "COM5::2");
    dead.open().await.unwrap();
    alive.open().await.unwrap();

    let err = dead.query("DEAD?", None).await.unwrap_err();
    assert!(matches!(err, CommError::CommunicationLost { .. }));

    // The reconnect re-attached both occupants
    let attaches = mock
        .calls()
        .iter()
        .filter(|c| matches!(c, MockCall::Attach(_)))
        .count();
    assert_eq!(attaches, 4);

    let channel = alive.channel().unwrap();
    assert_eq!(channel.occupant_count(), 1);
    assert_eq!(alive.query("LIVE?", None).await.unwrap().text(), "7");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_never_overlap_on_the_wire() {
    const SESSIONS: usize = 4;
    const QUERIES: usize = 25;

    // Queries numbered ...3 and ...7 fail once; no call ever escalates
    let faulted = Arc::new(Mutex::new(HashSet::new()));
    let mock = MockBackend::new()
        .with_latency(Duration::from_millis(1))
        .with_responder({
            let faulted = faulted.clone();
            move |written| {
                let text = String::from_utf8_lossy(written).into_owned();
                let unlucky = text.ends_with('3') || text.ends_with('7');
                if unlucky && faulted.lock().unwrap().insert(text) {
                    MockReply::fail("injected fault")
                } else {
                    MockReply::Data(written.to_vec().into())
                }
            }
        });
    let mediator = Arc::new(ChannelMediator::new());

    let mut sessions = Vec::new();
    for n in 1..=SESSIONS {
        let s = session(&mock, &mediator, &format!("COM9::{n}"));
        s.open().await.unwrap();
        sessions.push(s);
    }

    let mut tasks = Vec::new();
    for (n, s) in sessions.iter().enumerate() {
        let s = s.clone();
        tasks.push(tokio::spawn(async move {
            for q in 0..QUERIES {
                let payload = format!("S{n}Q{q}");
                let response = s.query(&payload, None).await?;
                // Echo proves no other session's bytes were read
                assert_eq!(response.text(), payload);
            }
            Ok::<_, CommError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(mock.max_in_flight(), 1);
    assert_eq!(mock.open_count(), 1);

    // Every write is immediately followed by the read from the same address
    let calls = mock.calls();
    for (i, call) in calls.iter().enumerate() {
        if let MockCall::Write(address, _) = call {
            assert_eq!(calls.get(i + 1), Some(&MockCall::Read(address.clone())));
        }
    }

    let failed: u64 = sessions.iter().map(|s| s.stats().failed_attempts).sum();
    assert_eq!(failed as usize, faulted.lock().unwrap().len());
    assert!(failed > 0);
    let exchanges: u64 = sessions.iter().map(|s| s.stats().exchanges).sum();
    assert_eq!(exchanges, (SESSIONS * QUERIES) as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnect_under_contention_keeps_exchanges_serialized() {
    const SESSIONS: usize = 4;
    const QUERIES: usize = 25;
    const STUBBORN: &str = "S0Q5";

    // One query fails every attempt on the first link, forcing a reconnect
    let failures = Arc::new(Mutex::new(HashMap::<String, u32>::new()));
    let mock = MockBackend::new()
        .with_latency(Duration::from_millis(1))
        .with_responder({
            let failures = failures.clone();
            move |written| {
                let text = String::from_utf8_lossy(written).into_owned();
                if text == STUBBORN {
                    let mut failures = failures.lock().unwrap();
                    let count = failures.entry(text).or_default();
                    if *count < RetryPolicy::immediate().max_attempts {
                        *count += 1;
                        return MockReply::fail("injected fault");
                    }
                }
                MockReply::Data(written.to_vec().into())
            }
        });
    let mediator = Arc::new(ChannelMediator::new());

    let mut sessions = Vec::new();
    for n in 1..=SESSIONS {
        let s = session(&mock, &mediator, &format!("COM9::{n}"));
        s.open().await.unwrap();
        sessions.push(s);
    }

    let mut tasks = Vec::new();
    for (n, s) in sessions.iter().enumerate() {
        let s = s.clone();
        tasks.push(tokio::spawn(async move {
            for q in 0..QUERIES {
                let payload = format!("S{n}Q{q}");
                let response = s.query(&payload, None).await?;
                assert_eq!(response.text(), payload);
            }
            Ok::<_, CommError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(mock.max_in_flight(), 1);
    assert_eq!(mock.open_count(), 2);
    assert_eq!(mock.close_count(), 1);
    let reconnects: u64 = sessions.iter().map(|s| s.stats().reconnects).sum();
    assert_eq!(reconnects, 1);
    assert_eq!(sessions[0].stats().reconnects, 1);

    let calls = mock.calls();
    for (i, call) in calls.iter().enumerate() {
        if let MockCall::Write(address, _) = call {
            assert_eq!(calls.get(i + 1), Some(&MockCall::Read(address.clone())));
        }
    }
    // The replacement link knows every session before anyone writes to it
    let reopened = calls.iter().rposition(|c| matches!(c, MockCall::Open(_))).unwrap();
    let attaches = calls[reopened + 1..]
        .iter()
        .take(SESSIONS)
        .filter(|c| matches!(c, MockCall::Attach(_)))
        .count();
    assert_eq!(attaches, SESSIONS);

    let exchanges: u64 = sessions.iter().map(|s| s.stats().exchanges).sum();
    assert_eq!(exchanges, (SESSIONS * QUERIES) as u64);
}
