use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use datacollection_ipc::sender::{SenderError, TestCaseEventSender};
use datacollection_ipc::socket::channel::ChannelError;
use datacollection_ipc::socket::connection::{
    Connection, ConnectionError, ConnectionOptions, ConnectionState, LifecycleEvent,
    LifecycleListener, ReleaseStep,
};
use datacollection_ipc::socket::proto::{
    AttachmentSet, Message, MessageKind, SessionEndEvent, TestCaseEndEvent, TestCaseStartEvent,
    TestOutcome, UriDataAttachment,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

const WAIT: Duration = Duration::from_secs(2);
const ORDERED_RELEASE: [ReleaseStep; 4] = [
    ReleaseStep::Channel,
    ReleaseStep::Stream,
    ReleaseStep::Transport,
    ReleaseStep::Cancellation,
];

/// Accepts one connection, answers frames with `reply`, and returns every
/// message it received once the client closes the socket.
async fn spawn_collector<F>(mut reply: F) -> (SocketAddr, JoinHandle<Vec<Message>>)
where
    F: FnMut(&Message) -> Option<Message> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock collector listener");
    let addr = listener
        .local_addr()
        .expect("read mock collector listener address");

    let task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.expect("accept test host");
        let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
        let mut received = Vec::new();
        while let Some(Ok(frame)) = framed.next().await {
            let text = std::str::from_utf8(&frame).expect("utf-8 frame");
            let message = Message::from_text(text).expect("decode frame");
            if let Some(response) = reply(&message) {
                let text = response.to_text().expect("encode reply");
                framed
                    .send(Bytes::from(text))
                    .await
                    .expect("send reply");
            }
            received.push(message);
        }
        received
    });
    (addr, task)
}

fn start_event(id: &str) -> TestCaseStartEvent {
    TestCaseStartEvent {
        test_case_id: id.to_string(),
        test_case_name: format!("suite::{id}"),
        is_child_test_case: false,
    }
}

fn end_event(id: &str) -> TestCaseEndEvent {
    TestCaseEndEvent {
        test_case_id: id.to_string(),
        test_case_name: format!("suite::{id}"),
        is_child_test_case: false,
        test_outcome: TestOutcome::Passed,
    }
}

fn attachment_set(name: &str) -> AttachmentSet {
    AttachmentSet {
        uri: format!("datacollector://{name}"),
        display_name: name.to_string(),
        attachments: vec![UriDataAttachment {
            uri: format!("file:///tmp/{name}.dat"),
            description: name.to_string(),
        }],
    }
}

async fn connected_sender(addr: SocketAddr) -> TestCaseEventSender {
    let sender = TestCaseEventSender::new(Connection::default());
    sender
        .initialize_communication(addr.port())
        .expect("start connection");
    assert!(
        sender.wait_for_connection(WAIT).await,
        "expected connection to mock collector"
    );
    sender
}

async fn next_event(listener: &mut LifecycleListener) -> LifecycleEvent {
    timeout(WAIT, listener.recv())
        .await
        .expect("timed out waiting for lifecycle event")
        .expect("lifecycle listener closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_case_events_round_trip_through_mock_collector() {
    let expected = vec![attachment_set("A1"), attachment_set("A2")];
    let reply_sets = expected.clone();
    let (addr, collector) = spawn_collector(move |message| {
        (message.kind() == MessageKind::TestEnd).then(|| {
            Message::with_payload(MessageKind::TestEndResult, &reply_sets).expect("reply")
        })
    })
    .await;

    let sender = connected_sender(addr).await;
    sender
        .send_test_case_start(&start_event("t1"))
        .await
        .expect("send start");
    let attachments = sender
        .send_test_case_end(&end_event("t1"))
        .await
        .expect("send end");
    assert_eq!(attachments, expected);
    sender
        .send_test_session_end(&SessionEndEvent::default())
        .await
        .expect("send session end");
    sender.close().await;

    let received = timeout(WAIT, collector)
        .await
        .expect("timed out waiting for collector")
        .expect("collector task should join");
    let kinds: Vec<_> = received.iter().map(Message::kind).collect();
    assert_eq!(
        kinds,
        [
            MessageKind::TestStart,
            MessageKind::TestEnd,
            MessageKind::SessionEnd
        ]
    );
    let start: TestCaseStartEvent = received[0].payload_as().expect("start payload");
    assert_eq!(start, start_event("t1"));
    assert_eq!(sender.connection().release_log(), ORDERED_RELEASE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unexpected_reply_kind_yields_empty_attachments() {
    let (addr, _collector) = spawn_collector(|message| {
        (message.kind() == MessageKind::TestEnd).then(|| Message::new(MessageKind::TestStart))
    })
    .await;

    let sender = connected_sender(addr).await;
    let attachments = sender
        .send_test_case_end(&end_event("t2"))
        .await
        .expect("mismatched reply is not an error");
    assert!(attachments.is_empty());
    assert_eq!(sender.connection().state(), ConnectionState::Connected);
    sender.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_reply_kind_yields_empty_attachments() {
    let (addr, _collector) = spawn_collector(|message| {
        (message.kind() == MessageKind::TestEnd).then(|| {
            Message::from_text(r#"{"MessageType":"TestExecution.StatsChange"}"#)
                .expect("unknown kind")
        })
    })
    .await;

    let sender = connected_sender(addr).await;
    let attachments = sender
        .send_test_case_end(&end_event("t3"))
        .await
        .expect("unknown reply is not an error");
    assert!(attachments.is_empty());
    sender.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_test_case_end_calls_are_answered_in_turn() {
    let (addr, _collector) = spawn_collector(|message| {
        if message.kind() != MessageKind::TestEnd {
            return None;
        }
        let event: TestCaseEndEvent = message.payload_as().expect("end payload");
        Some(
            Message::with_payload(
                MessageKind::TestEndResult,
                &vec![attachment_set(&event.test_case_id)],
            )
            .expect("reply"),
        )
    })
    .await;

    let sender = Arc::new(connected_sender(addr).await);
    let calls: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|id| {
            let sender = Arc::clone(&sender);
            tokio::spawn(async move {
                let sets = sender.send_test_case_end(&end_event(id)).await;
                (id, sets)
            })
        })
        .collect();

    for call in calls {
        let (id, sets) = timeout(WAIT, call)
            .await
            .expect("timed out waiting for correlated call")
            .expect("join");
        let sets = sets.expect("attachments");
        assert_eq!(sets, vec![attachment_set(id)]);
    }
    sender.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn collector_hangup_disconnects_with_channel_fault() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let connection = Connection::default();
    let mut events = connection.subscribe();
    connection.start(addr.to_string()).expect("start");
    let (socket, _) = listener.accept().await.expect("accept");

    let channel = match next_event(&mut events).await {
        LifecycleEvent::Connected { channel } => channel,
        other => panic!("unexpected event: {other:?}"),
    };
    drop(socket);

    match next_event(&mut events).await {
        LifecycleEvent::Disconnected { cause: Some(cause) } => {
            assert!(
                matches!(cause.as_ref(), ConnectionError::Channel(_)),
                "unexpected cause: {cause}"
            );
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(connection.release_log(), ORDERED_RELEASE);

    let sender = TestCaseEventSender::new(connection.clone());
    sender.attach(channel);
    let result = sender.send_test_case_start(&start_event("late")).await;
    assert!(matches!(
        result,
        Err(SenderError::Channel(ChannelError::Closed))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_stops_release_once_and_disconnect_once() {
    let (addr, collector) = spawn_collector(|_| None).await;
    let sender = Arc::new(connected_sender(addr).await);
    let mut events = sender.connection().subscribe();
    assert!(matches!(
        next_event(&mut events).await,
        LifecycleEvent::Connected { .. }
    ));

    let stops: Vec<_> = (0..8)
        .map(|_| {
            let sender = Arc::clone(&sender);
            tokio::spawn(async move { sender.close().await })
        })
        .collect();
    for stop in stops {
        stop.await.expect("stop task");
    }

    assert!(matches!(
        next_event(&mut events).await,
        LifecycleEvent::Disconnected { cause: None }
    ));
    assert!(events.try_recv().is_err());
    assert_eq!(sender.connection().release_log(), ORDERED_RELEASE);

    let received = timeout(WAIT, collector)
        .await
        .expect("collector should observe EOF")
        .expect("collector task should join");
    assert!(received.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_right_after_start_ends_in_stopped_state() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let connection = Connection::default();
    let mut events = connection.subscribe();
    connection.start(addr.to_string()).expect("start");
    connection.stop().await;

    assert_eq!(connection.state(), ConnectionState::Stopped);
    assert_eq!(connection.release_log(), ORDERED_RELEASE);

    let mut saw_disconnect = false;
    while let Ok(event) = events.try_recv() {
        match event {
            LifecycleEvent::Connected { .. } => {
                assert!(!saw_disconnect, "connected after disconnected");
            }
            LifecycleEvent::Disconnected { cause } => {
                assert!(!saw_disconnect, "disconnected twice");
                assert!(cause.is_none());
                saw_disconnect = true;
            }
        }
    }
    assert!(saw_disconnect);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsolicited_messages_reach_inbound_queue() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let connection = Connection::default();
    let mut inbound = connection.take_messages().expect("inbound queue");
    connection.start(addr.to_string()).expect("start");

    let (socket, _) = listener.accept().await.expect("accept");
    let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
    let text = Message::new(MessageKind::SessionEnd)
        .to_text()
        .expect("encode");
    framed.send(Bytes::from(text)).await.expect("send");

    let message = timeout(WAIT, inbound.recv())
        .await
        .expect("timed out waiting for inbound message")
        .expect("inbound queue closed");
    assert_eq!(message.kind(), MessageKind::SessionEnd);
    connection.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_completes_while_collector_stops_reading() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let options = ConnectionOptions::default()
        .with_release_flush_timeout(Duration::from_millis(200));
    let sender = Arc::new(TestCaseEventSender::with_options(options));
    let mut events = sender.connection().subscribe();
    sender
        .initialize_communication(addr.port())
        .expect("start connection");
    let (_stalled, _) = listener.accept().await.expect("accept");
    assert!(sender.wait_for_connection(WAIT).await);

    let flood = {
        let sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let event = TestCaseStartEvent {
                test_case_id: "bulk".to_string(),
                test_case_name: "x".repeat(1024 * 1024),
                is_child_test_case: false,
            };
            loop {
                if let Err(err) = sender.send_test_case_start(&event).await {
                    return err;
                }
            }
        })
    };
    // Let the socket buffers fill so the flood blocks inside a write.
    tokio::time::sleep(Duration::from_millis(300)).await;

    timeout(Duration::from_secs(3), sender.close())
        .await
        .expect("stop should not wait on a collector that stopped reading");
    assert_eq!(sender.connection().state(), ConnectionState::Stopped);
    assert_eq!(sender.connection().release_log(), ORDERED_RELEASE);

    assert!(matches!(
        next_event(&mut events).await,
        LifecycleEvent::Connected { .. }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        LifecycleEvent::Disconnected { cause: None }
    ));

    let err = timeout(WAIT, flood)
        .await
        .expect("flood should end after stop")
        .expect("join");
    assert!(
        matches!(
            err,
            SenderError::Channel(ChannelError::Cancelled | ChannelError::Closed)
        ),
        "unexpected error: {err}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn collector_reset_during_sends_disconnects_with_channel_fault() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let sender = TestCaseEventSender::new(Connection::default());
    let mut events = sender.connection().subscribe();
    sender
        .initialize_communication(addr.port())
        .expect("start connection");
    let (socket, _) = listener.accept().await.expect("accept");
    assert!(sender.wait_for_connection(WAIT).await);
    assert!(matches!(
        next_event(&mut events).await,
        LifecycleEvent::Connected { .. }
    ));

    // Zero linger turns the close into a reset.
    #[allow(deprecated)]
    let linger = socket.set_linger(Some(Duration::ZERO));
    linger.expect("set linger");
    drop(socket);

    let mut failure = None;
    for attempt in 0..200 {
        let event = start_event(&format!("after-reset-{attempt}"));
        if let Err(err) = sender.send_test_case_start(&event).await {
            failure = Some(err);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let failure = failure.expect("sends should fail once the collector resets");
    assert!(
        matches!(failure, SenderError::Channel(_)),
        "unexpected error: {failure}"
    );

    match next_event(&mut events).await {
        LifecycleEvent::Disconnected { cause: Some(cause) } => {
            assert!(
                matches!(cause.as_ref(), ConnectionError::Channel(_)),
                "unexpected cause: {cause}"
            );
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(events.try_recv().is_err());
    assert_eq!(sender.connection().state(), ConnectionState::Stopped);
    assert_eq!(sender.connection().release_log(), ORDERED_RELEASE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_event_leaves_connection_usable() {
    let (addr, collector) = spawn_collector(|_| None).await;

    let options = ConnectionOptions::default().with_max_frame_length(256);
    let sender = TestCaseEventSender::with_options(options);
    sender
        .initialize_communication(addr.port())
        .expect("start connection");
    assert!(sender.wait_for_connection(WAIT).await);

    let oversized = TestCaseStartEvent {
        test_case_id: "huge".to_string(),
        test_case_name: "x".repeat(1024),
        is_child_test_case: false,
    };
    let result = sender.send_test_case_start(&oversized).await;
    assert!(matches!(
        result,
        Err(SenderError::Channel(ChannelError::FrameTooLarge { max: 256, .. }))
    ));

    sender
        .send_test_case_start(&start_event("t4"))
        .await
        .expect("send after rejected frame");
    assert_eq!(sender.connection().state(), ConnectionState::Connected);
    sender.close().await;

    let received = timeout(WAIT, collector)
        .await
        .expect("timed out waiting for collector")
        .expect("collector task should join");
    let ids: Vec<String> = received
        .iter()
        .map(|message| {
            message
                .payload_as::<TestCaseStartEvent>()
                .expect("start payload")
                .test_case_id
        })
        .collect();
    assert_eq!(ids, ["t4"]);
}
