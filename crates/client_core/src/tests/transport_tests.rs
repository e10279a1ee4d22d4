use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{FutureExt, StreamExt};
use serde::Deserialize;
use shared::{domain::UserId, protocol::TypingState};
use tokio::sync::Notify;

use super::*;
use crate::test_support::{channel_listener, FakeDialer};

fn config() -> TransportConfig {
    TransportConfig::new("http://chat.test", "token-1")
}

fn transport(dialer: &Arc<FakeDialer>) -> RealtimeTransport {
    RealtimeTransport::with_dialer(config(), Arc::clone(dialer) as Arc<dyn Dialer>)
}

async fn wait_for_state(
    transport: &RealtimeTransport,
    predicate: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    let mut states = transport.subscribe_state();
    let state = *states.wait_for(predicate).await.expect("transport alive");
    state
}

fn typing_event(chat_id: i64) -> ChatEvent {
    ChatEvent::Typing {
        chat_id: ChatId(chat_id),
        user_id: UserId(2),
        data: TypingState { is_typing: true },
    }
}

#[test]
fn delays_double_per_attempt_and_stop_after_budget() {
    let policy = config().reconnect_policy();
    let delays: Vec<_> = (1..=5)
        .map(|attempt| policy.delay_for(attempt).map(|d| d.as_millis()))
        .collect();
    assert_eq!(
        delays,
        vec![Some(1000), Some(2000), Some(4000), Some(8000), Some(16000)]
    );
    assert_eq!(policy.delay_for(0), None);
    assert_eq!(policy.delay_for(6), None);
}

#[test]
fn websocket_url_follows_server_scheme_and_path() {
    let url = websocket_url("http://localhost:8443", "abc").expect("url");
    assert_eq!(url.as_str(), "ws://localhost:8443/ws?token=abc");

    let url = websocket_url("https://chat.example.com/api/", "a b&c").expect("url");
    assert_eq!(url.as_str(), "wss://chat.example.com/api/ws?token=a+b%26c");

    assert!(matches!(
        websocket_url("ftp://chat.example.com", "abc"),
        Err(TransportError::InvalidUrl(_))
    ));
    assert!(matches!(
        websocket_url("not a url", "abc"),
        Err(TransportError::InvalidUrl(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_connects_back_off_then_abandon() {
    let dialer = Arc::new(FakeDialer::failing(usize::MAX));
    let transport = transport(&dialer);
    let (errors, mut error_rx) = channel_listener();
    transport.on(EventType::Error, errors);

    let result = transport.connect().await;
    assert!(matches!(result, Err(TransportError::Connect(_))));
    assert_eq!(
        transport.state(),
        ConnectionState::ReconnectWait {
            attempt: 1,
            delay: Duration::from_millis(1000)
        }
    );

    wait_for_state(&transport, |state| *state == ConnectionState::Abandoned).await;

    let times = dialer.dial_times();
    let gaps: Vec<u128> = times
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).as_millis())
        .collect();
    assert_eq!(gaps, vec![1000, 2000, 4000, 8000, 16000]);
    assert!(!transport.is_connected());

    let mut error_events = 0;
    while error_rx.try_recv().is_ok() {
        error_events += 1;
    }
    assert_eq!(error_events, 6);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(dialer.dial_count(), 6);
    assert_eq!(transport.state(), ConnectionState::Abandoned);
}

#[tokio::test(start_paused = true)]
async fn explicit_connect_after_abandonment_tries_again() {
    let dialer = Arc::new(FakeDialer::failing(6));
    let transport = transport(&dialer);

    let _ = transport.connect().await;
    wait_for_state(&transport, |state| *state == ConnectionState::Abandoned).await;

    transport.connect().await.expect("connect");
    assert!(transport.is_connected());
    assert_eq!(dialer.dial_count(), 7);
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_attempt() {
    let gate = Arc::new(Notify::new());
    let dialer = Arc::new(FakeDialer::gated(Arc::clone(&gate)));
    let transport = Arc::new(transport(&dialer));

    let first = tokio::spawn({
        let transport = Arc::clone(&transport);
        async move { transport.connect().await }
    });
    let second = tokio::spawn({
        let transport = Arc::clone(&transport);
        async move { transport.connect().await }
    });
    while dialer.dial_count() == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(transport.state(), ConnectionState::Connecting);

    gate.notify_one();
    first.await.expect("join").expect("first connect");
    second.await.expect("join").expect("second connect");

    assert_eq!(dialer.dial_count(), 1);
    assert!(transport.is_connected());
    transport.connect().await.expect("already open");
    assert_eq!(dialer.dial_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_connect_still_finishes_the_attempt() {
    let gate = Arc::new(Notify::new());
    let dialer = Arc::new(FakeDialer::gated(Arc::clone(&gate)));
    let transport = transport(&dialer);

    let timed_out = tokio::time::timeout(Duration::from_millis(100), transport.connect()).await;
    assert!(timed_out.is_err());
    assert_eq!(transport.state(), ConnectionState::Connecting);

    gate.notify_one();
    let state = wait_for_state(&transport, |state| *state != ConnectionState::Connecting).await;
    assert_eq!(state, ConnectionState::Open);
    assert_eq!(dialer.dial_count(), 1);
    assert!(transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn cancelled_connect_during_backoff_keeps_retrying() {
    let dialer = Arc::new(FakeDialer::failing(usize::MAX));
    let transport = transport(&dialer);

    let _ = transport.connect().await;
    assert!(matches!(
        transport.state(),
        ConnectionState::ReconnectWait { attempt: 1, .. }
    ));

    // Polled once, then dropped before the dial resolves.
    assert!(transport.connect().now_or_never().is_none());

    wait_for_state(&transport, |state| *state == ConnectionState::Abandoned).await;
    assert_eq!(dialer.dial_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn open_resets_attempts_and_close_restarts_backoff() {
    let dialer = Arc::new(FakeDialer::failing(2));
    let transport = transport(&dialer);

    let _ = transport.connect().await;
    wait_for_state(&transport, |state| *state == ConnectionState::Open).await;
    assert_eq!(dialer.dial_count(), 3);

    drop(dialer.take_peer());
    let state = wait_for_state(&transport, |state| {
        matches!(state, ConnectionState::ReconnectWait { .. })
    })
    .await;
    assert_eq!(
        state,
        ConnectionState::ReconnectWait {
            attempt: 1,
            delay: Duration::from_millis(1000)
        }
    );

    wait_for_state(&transport, |state| *state == ConnectionState::Open).await;
    assert_eq!(dialer.dial_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn catch_all_listener_sees_every_event() {
    let dialer = Arc::new(FakeDialer::default());
    let transport = transport(&dialer);
    let (typed, mut typed_rx) = channel_listener();
    let (all, mut all_rx) = channel_listener();
    transport.on(EventType::Typing, typed);
    transport.on(EventType::Message, all);

    transport.connect().await.expect("connect");
    let peer = dialer.take_peer();
    peer.push(&typing_event(4));
    peer.push(&ChatEvent::UserJoined {
        chat_id: ChatId(4),
        user_id: UserId(9),
    });

    assert_eq!(typed_rx.recv().await, Some(typing_event(4)));
    assert_eq!(all_rx.recv().await, Some(typing_event(4)));
    assert_eq!(
        all_rx.recv().await.map(|event| event.event_type()),
        Some(EventType::UserJoined)
    );
    assert!(typed_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn unparseable_frames_surface_as_error_events() {
    let dialer = Arc::new(FakeDialer::default());
    let transport = transport(&dialer);
    let (errors, mut error_rx) = channel_listener();
    transport.on(EventType::Error, errors);

    transport.connect().await.expect("connect");
    let peer = dialer.take_peer();
    peer.to_client
        .unbounded_send(Ok("{\"type\":\"bogus\"}".into()))
        .expect("send");

    match error_rx.recv().await {
        Some(ChatEvent::Error { chat_id, error }) => {
            assert_eq!(chat_id, None);
            assert!(error.starts_with("invalid server event"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn outbound_signals_are_dropped_unless_open() {
    let dialer = Arc::new(FakeDialer::default());
    let transport = transport(&dialer);

    assert!(!transport.join_chat(ChatId(1)));
    assert!(!transport.send_typing(ChatId(1), true));

    transport.connect().await.expect("connect");
    let mut peer = dialer.take_peer();
    assert!(transport.join_chat(ChatId(1)));
    assert!(transport.send_typing(ChatId(1), true));
    assert!(transport.leave_chat(ChatId(1)));

    assert_eq!(
        peer.next_frame().await,
        serde_json::json!({"type": "join_chat", "chatId": 1})
    );
    assert_eq!(
        peer.next_frame().await,
        serde_json::json!({"type": "typing", "chatId": 1, "isTyping": true})
    );
    assert_eq!(
        peer.next_frame().await,
        serde_json::json!({"type": "leave_chat", "chatId": 1})
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_clears_listeners_and_never_reconnects() {
    let dialer = Arc::new(FakeDialer::default());
    let transport = transport(&dialer);
    let (listener, _rx) = channel_listener();
    transport.on(EventType::Message, listener);

    transport.connect().await.expect("connect");
    let mut peer = dialer.take_peer();
    transport.disconnect();

    assert_eq!(transport.listener_count(), 0);
    assert_eq!(transport.state(), ConnectionState::Idle);
    assert!(!transport.join_chat(ChatId(1)));
    // The writer closes the socket on its way out.
    assert!(peer.from_client.next().await.is_none());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(dialer.dial_count(), 1);
    assert_eq!(transport.state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn instances_keep_independent_backoff() {
    let failing = Arc::new(FakeDialer::failing(usize::MAX));
    let healthy = Arc::new(FakeDialer::default());
    let broken = transport(&failing);
    let working = transport(&healthy);

    let _ = broken.connect().await;
    working.connect().await.expect("connect");

    assert!(matches!(
        broken.state(),
        ConnectionState::ReconnectWait { attempt: 1, .. }
    ));
    assert!(working.is_connected());
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

async fn spawn_socket_server() -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let (seen_tx, seen_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let handler = move |ws: WebSocketUpgrade, Query(query): Query<TokenQuery>| {
        let seen_tx = seen_tx.clone();
        async move {
            assert_eq!(query.token, "token-1");
            ws.on_upgrade(move |mut socket: WebSocket| async move {
                let hello = serde_json::to_string(&typing_event(3)).expect("encode");
                if socket.send(WsMessage::Text(hello)).await.is_err() {
                    return;
                }
                while let Some(Ok(frame)) = socket.next().await {
                    if let WsMessage::Text(text) = frame {
                        let _ = seen_tx.send(text);
                    }
                }
            })
            .into_response()
        }
    };

    let app = Router::new().route("/ws", get(handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}"), seen_rx)
}

#[tokio::test]
async fn talks_to_a_real_websocket_server() {
    let (server_url, mut seen) = spawn_socket_server().await;
    let transport = RealtimeTransport::new(TransportConfig::new(server_url, "token-1"));
    let (listener, mut events) = channel_listener();
    transport.on(EventType::Typing, listener);

    transport.connect().await.expect("connect");
    assert_eq!(events.recv().await, Some(typing_event(3)));

    assert!(transport.join_chat(ChatId(3)));
    let frame = seen.recv().await.expect("frame");
    let command: ClientCommand = serde_json::from_str(&frame).expect("command");
    assert_eq!(command, ClientCommand::JoinChat { chat_id: ChatId(3) });

    transport.disconnect();
}

#[tokio::test]
async fn unreachable_server_reports_connect_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let transport = RealtimeTransport::new(TransportConfig::new(format!("http://{addr}"), "t"));
    let result = transport.connect().await;
    assert!(matches!(result, Err(TransportError::Connect(_))));
    transport.disconnect();
}
