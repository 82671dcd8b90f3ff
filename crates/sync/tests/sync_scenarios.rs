//! End-to-end flows through the coordinator against scripted fakes:
//! send/confirm/echo reconciliation, list reordering, typing expiry, and
//! disconnect recovery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use towline_core::config::SyncConfig;
use towline_core::event::{BroadcastEventBus, EventBus, EventPayload};
use towline_sync::{Intent, Session, SyncCoordinator};
use towline_test_support::{FakeChatApi, FakePushTransport, FakeTransportHandle, fake_transport, sample};
use towline_transport::{ClientEvent, ServerEvent};

struct Harness {
    coordinator: SyncCoordinator<FakeChatApi, FakePushTransport>,
    api: Arc<FakeChatApi>,
    transport: FakeTransportHandle,
    bus: Arc<BroadcastEventBus>,
}

fn harness() -> Harness {
    let api = Arc::new(FakeChatApi::new());
    let (transport, handle) = fake_transport();
    let config = SyncConfig::default();
    let bus = Arc::new(BroadcastEventBus::new(config.event_bus.channel_capacity));
    let bus_handle: Arc<dyn EventBus> = bus.clone();
    let coordinator = SyncCoordinator::new(
        Session::new(sample::avery()),
        api.clone(),
        transport,
        bus_handle,
        config,
    );
    Harness {
        coordinator,
        api,
        transport: handle,
        bus,
    }
}

fn seed_two_conversations(api: &FakeChatApi) {
    let c1 = sample::conversation_between("c1", &sample::avery(), &sample::blake(), 10);
    let c2 = sample::conversation_between("c2", &sample::avery(), &sample::carla(), 20);
    api.set_conversations(vec![c1, c2]);
}

#[tokio::test]
async fn confirmed_send_plus_broadcast_echo_yields_one_message() {
    let mut h = harness();
    seed_two_conversations(&h.api);
    h.coordinator.start().await.unwrap();
    h.coordinator.select_conversation("c1").await.unwrap();

    h.api.queue_send_result(Ok(sample::message_with(
        "m-42",
        "c1",
        &sample::avery(),
        "hello",
        40,
    )));
    let confirmed = h.coordinator.send_message("hello").await.unwrap();
    assert_eq!(confirmed.id, "m-42");

    // The broadcast echo of our own send arrives afterwards.
    h.coordinator
        .handle_server_event(ServerEvent::MessageReceived {
            message: sample::message_with("m-42", "c1", &sample::avery(), "hello", 40),
        })
        .await;

    let entries = h.coordinator.channel().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message.id, "m-42");
    assert_eq!(entries[0].message.content, "hello");
}

#[tokio::test]
async fn push_message_reorders_the_conversation_list() {
    let mut h = harness();
    seed_two_conversations(&h.api);
    h.coordinator.start().await.unwrap();

    let before: Vec<&str> = h
        .coordinator
        .directory()
        .ordered()
        .iter()
        .map(|c| c.id.as_str())
        .collect();
    assert_eq!(before, ["c2", "c1"]);

    h.coordinator
        .handle_server_event(ServerEvent::MessageReceived {
            message: sample::message("m-7", "c1", &sample::blake(), 30),
        })
        .await;

    let after: Vec<&str> = h
        .coordinator
        .directory()
        .ordered()
        .iter()
        .map(|c| c.id.as_str())
        .collect();
    assert_eq!(after, ["c1", "c2"]);
    assert_eq!(h.coordinator.directory().get("c1").unwrap().updated_at, sample::at(30));
}

#[tokio::test]
async fn push_arrival_order_never_breaks_timeline_order() {
    let mut h = harness();
    seed_two_conversations(&h.api);
    h.coordinator.start().await.unwrap();
    h.coordinator.select_conversation("c1").await.unwrap();

    for (id, secs) in [("m-5", 50), ("m-2", 20), ("m-4", 40), ("m-3", 30)] {
        h.coordinator
            .handle_server_event(ServerEvent::MessageReceived {
                message: sample::message(id, "c1", &sample::blake(), secs),
            })
            .await;
    }

    let ids: Vec<&str> = h
        .coordinator
        .channel()
        .entries()
        .iter()
        .map(|e| e.message.id.as_str())
        .collect();
    assert_eq!(ids, ["m-2", "m-3", "m-4", "m-5"]);
}

#[tokio::test]
async fn duplicate_and_reordered_receipts_never_regress() {
    let mut h = harness();
    seed_two_conversations(&h.api);
    h.api
        .set_history("c1", vec![sample::message("m-1", "c1", &sample::avery(), 10)]);
    h.coordinator.start().await.unwrap();
    h.coordinator.select_conversation("c1").await.unwrap();

    let chat_read = ServerEvent::ChatRead {
        chat_id: "c1".into(),
        user_id: "u2".into(),
    };
    h.coordinator.handle_server_event(chat_read.clone()).await;

    // An older single-message confirmation replays afterwards, without u2.
    let mut stale = sample::message("m-1", "c1", &sample::avery(), 10);
    stale.mark_read_by("u3");
    h.coordinator
        .handle_server_event(ServerEvent::MessageRead { message: stale })
        .await;
    h.coordinator.handle_server_event(chat_read).await;

    let read_by = h.coordinator.channel().get("m-1").unwrap().message.read_by();
    assert!(read_by.contains("u2"));
    assert!(read_by.contains("u3"));
}

#[tokio::test(start_paused = true)]
async fn stuck_typing_indicator_expires_without_a_stop_event() {
    let mut h = harness();
    seed_two_conversations(&h.api);
    h.coordinator.start().await.unwrap();

    h.coordinator
        .handle_server_event(ServerEvent::TypingStarted {
            chat_id: "c1".into(),
            user_id: "u2".into(),
        })
        .await;
    assert_eq!(h.coordinator.typing().typist("c1"), Some("u2"));

    // The stop event is lost; only time passes.
    tokio::time::advance(Duration::from_millis(4_999)).await;
    h.coordinator.poll_typing().await;
    assert_eq!(h.coordinator.typing().typist("c1"), Some("u2"));

    tokio::time::advance(Duration::from_millis(1)).await;
    h.coordinator.poll_typing().await;
    assert_eq!(h.coordinator.typing().typist("c1"), None);
}

#[tokio::test(start_paused = true)]
async fn disconnect_recovery_rebuilds_state_without_duplicates() {
    let mut h = harness();
    seed_two_conversations(&h.api);
    h.api
        .set_history("c1", vec![sample::message("m-1", "c1", &sample::blake(), 10)]);
    h.coordinator.start().await.unwrap();
    h.coordinator.select_conversation("c1").await.unwrap();

    let mut system_events = h.bus.subscribe("system.**").unwrap();

    // Three messages land server-side while we are disconnected; the push
    // channel offers no replay, only the pull API has them.
    h.api.push_history("c1", sample::message("m-2", "c1", &sample::blake(), 20));
    h.api.push_history("c1", sample::message("m-3", "c1", &sample::blake(), 30));
    h.api.push_history("c1", sample::message("m-4", "c1", &sample::blake(), 40));

    let (intent_tx, intent_rx) = mpsc::unbounded_channel::<Intent>();
    let task = tokio::spawn(h.coordinator.run(intent_rx));

    h.transport.drop_connection("network blip");

    // The run loop backs off, reconnects, and resyncs.
    let mut completed = None;
    for _ in 0..10 {
        let event = tokio::time::timeout(Duration::from_secs(120), system_events.recv())
            .await
            .expect("timed out waiting for resync")
            .unwrap();
        if let EventPayload::SyncCompleted { messages, .. } = event.payload {
            completed = Some(messages);
            break;
        }
    }
    assert_eq!(
        completed,
        Some(4),
        "history is rebuilt once, fully, without duplicates"
    );

    assert_eq!(h.transport.connect_count(), 2);
    let message_pulls = h
        .api
        .calls()
        .iter()
        .filter(|c| c.as_str() == "fetch_messages(c1)")
        .count();
    assert_eq!(message_pulls, 2, "initial open plus resync");

    let joins = h
        .transport
        .emitted()
        .iter()
        .filter(|e| matches!(e, ClientEvent::JoinChannel { chat_id } if chat_id == "c1"))
        .count();
    assert_eq!(joins, 2, "channel is rejoined after reconnect");

    drop(intent_tx);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn run_loop_dispatches_ui_intents() {
    let mut h = harness();
    seed_two_conversations(&h.api);
    h.api
        .set_history("c1", vec![sample::message("m-1", "c1", &sample::blake(), 10)]);
    h.coordinator.start().await.unwrap();

    let mut ui_events = h.bus.subscribe("ui.**").unwrap();
    h.api.queue_send_result(Ok(sample::message_with(
        "m-42",
        "c1",
        &sample::avery(),
        "see you saturday",
        40,
    )));

    let (intent_tx, intent_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(h.coordinator.run(intent_rx));

    intent_tx
        .send(Intent::SelectConversation {
            chat_id: "c1".into(),
        })
        .unwrap();
    intent_tx
        .send(Intent::SendMessage {
            content: "see you saturday".into(),
        })
        .unwrap();

    let mut confirmed = false;
    for _ in 0..20 {
        let event = tokio::time::timeout(Duration::from_secs(1), ui_events.recv())
            .await
            .expect("timed out waiting for confirmation")
            .unwrap();
        if let EventPayload::MessageConfirmed { message, .. } = event.payload {
            assert_eq!(message.id, "m-42");
            confirmed = true;
            break;
        }
    }
    assert!(confirmed);

    assert!(
        h.transport
            .emitted()
            .iter()
            .any(|e| matches!(e, ClientEvent::BroadcastMessage { message } if message.id == "m-42"))
    );

    drop(intent_tx);
    task.await.unwrap().unwrap();
}
