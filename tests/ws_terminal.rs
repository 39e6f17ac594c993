//! Interactive terminal sockets: login handshake, replay, relay and close
//! reasons.

mod common;

use std::time::Duration;

use common::{read_to_close, read_until, TestServer, TIMEOUT};
use futures::{SinkExt, StreamExt};
use termgate::auth::Credential;
use termgate::client::ClientError;
use termgate::target::{InitTerminal, Target};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async, tungstenite::Message};

fn shell() -> InitTerminal {
    InitTerminal {
        command: Some("sh".into()),
        ..Default::default()
    }
}

/// Next frame from a raw socket, skipping pings.
async fn next_frame<S>(ws: &mut S) -> Option<Message>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(msg)) => return Some(msg),
                _ => return None,
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

fn close_code(msg: Option<Message>) -> Option<CloseCode> {
    match msg {
        Some(Message::Close(Some(frame))) => Some(frame.code),
        _ => None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn login_then_logged_in_then_replay() {
    let server = TestServer::start().await;
    let (mut ws, _) = connect_async(server.ws_url(
        "/ws/server/local/terminal?terminal=raw&init%5Bcommand%5D=cat",
    ))
    .await
    .unwrap();

    ws.send(Message::text(r#"{"type":"Jwt","params":{"jwt":"ops-jwt"}}"#))
        .await
        .unwrap();
    match next_frame(&mut ws).await {
        Some(Message::Text(text)) => assert_eq!(text.as_str(), "LOGGED_IN"),
        other => panic!("expected LOGGED_IN, got {other:?}"),
    }
    // The replay frame always comes first, even when empty.
    assert!(matches!(next_frame(&mut ws).await, Some(Message::Binary(_))));
    assert_eq!(server.state.registry().len(), 1);
}

#[tokio::test]
async fn garbage_login_closes_with_policy_violation() {
    let server = TestServer::start().await;
    let (mut ws, _) = connect_async(server.ws_url("/ws/server/local/terminal"))
        .await
        .unwrap();
    ws.send(Message::text("let me in")).await.unwrap();
    assert_eq!(close_code(next_frame(&mut ws).await), Some(CloseCode::Policy));
}

#[tokio::test]
async fn binary_login_is_rejected() {
    let server = TestServer::start().await;
    let (mut ws, _) = connect_async(server.ws_url("/ws/server/local/terminal"))
        .await
        .unwrap();
    ws.send(Message::binary(b"{}".to_vec())).await.unwrap();
    assert_eq!(close_code(next_frame(&mut ws).await), Some(CloseCode::Policy));
}

#[tokio::test]
async fn silent_client_is_closed_after_login_timeout() {
    let server = TestServer::start().await;
    let (mut ws, _) = connect_async(server.ws_url("/ws/server/local/terminal"))
        .await
        .unwrap();
    // login_timeout_secs = 2 in the test config
    assert_eq!(close_code(next_frame(&mut ws).await), Some(CloseCode::Policy));
}

#[tokio::test]
async fn wrong_credentials_fail_login() {
    let server = TestServer::start().await;
    let client = server.client(Credential::api_keys("ops-key", "wrong"));
    let err = client
        .connect_terminal(&Target::server("local"), None, Some(&shell()))
        .await
        .err()
        .expect("login should fail");
    assert!(matches!(err, ClientError::Login(reason) if reason == "invalid credentials"));
}

#[tokio::test]
async fn users_without_terminal_permission_are_refused() {
    let server = TestServer::start().await;
    let client = server.client(Credential::jwt("viewer-jwt"));
    let err = client
        .connect_terminal(&Target::server("local"), None, Some(&shell()))
        .await
        .err()
        .expect("login should fail");
    assert!(matches!(err, ClientError::Login(reason) if reason == "permission denied"));
    assert!(server.state.registry().is_empty());
}

#[tokio::test]
async fn missing_terminal_without_init_closes_after_login() {
    let server = TestServer::start().await;
    let mut conn = server
        .ops()
        .connect_terminal(&Target::server("local"), Some("nope"), None)
        .await
        .unwrap();
    read_to_close(&mut conn).await;
    let reason = conn.close_reason().unwrap_or_default();
    assert!(reason.contains("not found"), "{reason}");
}

#[tokio::test]
async fn unknown_server_closes_after_login() {
    let server = TestServer::start().await;
    let mut conn = server
        .ops()
        .connect_terminal(&Target::server("ghost"), None, Some(&shell()))
        .await
        .unwrap();
    read_to_close(&mut conn).await;
    assert_eq!(conn.close_reason(), Some("server 'ghost' not found"));
}

#[tokio::test(flavor = "multi_thread")]
async fn keystrokes_reach_the_shell_and_history_is_replayed() {
    let server = TestServer::start().await;
    let client = server.ops();
    let target = Target::server("local");

    let mut conn = client
        .connect_terminal(&target, Some("main"), Some(&shell()))
        .await
        .unwrap();
    conn.send_stdin("echo marker-$((6*7))\n").await.unwrap();
    read_until(&mut conn, "marker-42").await;
    conn.close().await.unwrap();

    // Closing the socket leaves the terminal running.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.state.registry().len(), 1);

    let mut again = client
        .connect_terminal(&target, Some("main"), None)
        .await
        .unwrap();
    let replay = again.receive_stdout().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&replay).contains("marker-42"));
    again.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn second_viewer_is_refused() {
    let server = TestServer::start().await;
    let client = server.ops();
    let target = Target::server("local");

    let _first = client
        .connect_terminal(&target, Some("solo"), Some(&shell()))
        .await
        .unwrap();
    let mut second = client
        .connect_terminal(&target, Some("solo"), None)
        .await
        .unwrap();
    read_to_close(&mut second).await;
    assert_eq!(second.close_reason(), Some("terminal already attached"));
}

#[tokio::test(flavor = "multi_thread")]
async fn resize_reaches_the_pty() {
    let server = TestServer::start().await;
    let mut conn = server
        .ops()
        .connect_terminal(&Target::server("local"), Some("sized"), Some(&shell()))
        .await
        .unwrap();
    conn.resize(40, 132).await.unwrap();
    conn.send_stdin("stty size\n").await.unwrap();
    read_until(&mut conn, "40 132").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exiting_shell_closes_socket_with_reason() {
    let server = TestServer::start().await;
    let mut conn = server
        .ops()
        .connect_terminal(&Target::server("local"), Some("brief"), Some(&shell()))
        .await
        .unwrap();
    conn.send_stdin("exit\n").await.unwrap();
    read_to_close(&mut conn).await;
    assert_eq!(conn.close_reason(), Some("terminal exited"));
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_terminal_closes_its_viewer() {
    let server = TestServer::start().await;
    let client = server.ops();
    let target = Target::server("local");
    let mut conn = client
        .connect_terminal(&target, Some("doomed"), Some(&shell()))
        .await
        .unwrap();
    assert!(client.delete_terminal(&target, "doomed").await.unwrap());
    read_to_close(&mut conn).await;
    assert_eq!(conn.close_reason(), Some("terminal exited"));
}

#[tokio::test(flavor = "multi_thread")]
async fn server_shutdown_closes_normally() {
    let server = TestServer::start().await;
    let (mut ws, _) = connect_async(server.ws_url(
        "/ws/server/local/terminal?terminal=s&init%5Bcommand%5D=cat",
    ))
    .await
    .unwrap();
    ws.send(Message::text(r#"{"type":"Jwt","params":{"jwt":"ops-jwt"}}"#))
        .await
        .unwrap();
    assert!(matches!(next_frame(&mut ws).await, Some(Message::Text(_))));
    assert!(matches!(next_frame(&mut ws).await, Some(Message::Binary(_))));

    server.state.shutdown.shutdown();
    loop {
        match next_frame(&mut ws).await {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, CloseCode::Normal);
                assert_eq!(frame.reason.as_str(), "server shutting down");
                break;
            }
            Some(Message::Binary(_)) => continue,
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
