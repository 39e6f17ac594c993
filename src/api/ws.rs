//! Interactive terminal sockets.
//!
//! The path names the target. After the upgrade the client logs in with a
//! credential message, receives `LOGGED_IN`, then gets the terminal's
//! history as one binary frame followed by live output. Binary frames from
//! the client are keystrokes; text frames are control messages.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::auth::{Action, Principal, WsLoginMessage};
use crate::client::TerminalClient;
use crate::dispatch::Route;
use crate::protocol::{ControlMessage, LOGGED_IN};
use crate::resolver::ResolvedTarget;
use crate::session::Session;
use crate::target::{InitTerminal, Target};

use super::error::ApiError;
use super::AppState;

/// Query string of the terminal routes.
#[derive(Debug, Default, Deserialize)]
pub(super) struct TerminalQuery {
    terminal: Option<String>,
    #[serde(rename = "init[command]")]
    init_command: Option<String>,
    #[serde(rename = "init[recreate]")]
    init_recreate: Option<String>,
    #[serde(rename = "init[mode]")]
    init_mode: Option<String>,
}

impl TerminalQuery {
    /// Init options, present when any `init[...]` key was given.
    fn init(&self) -> Result<Option<InitTerminal>, String> {
        if self.init_command.is_none() && self.init_recreate.is_none() && self.init_mode.is_none() {
            return Ok(None);
        }
        Ok(Some(InitTerminal {
            command: self.init_command.clone().filter(|c| !c.trim().is_empty()),
            recreate: self
                .init_recreate
                .as_deref()
                .map(str::parse)
                .transpose()?
                .unwrap_or_default(),
            mode: self.init_mode.as_deref().map(str::parse).transpose()?,
        }))
    }
}

pub(super) async fn ws_server_terminal(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(server): Path<String>,
    Query(query): Query<TerminalQuery>,
) -> Result<Response, ApiError> {
    upgrade(ws, state, Target::server(server), query)
}

pub(super) async fn ws_container_terminal(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((server, container)): Path<(String, String)>,
    Query(query): Query<TerminalQuery>,
) -> Result<Response, ApiError> {
    upgrade(ws, state, Target::container(server, container), query)
}

pub(super) async fn ws_stack_terminal(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((stack, service)): Path<(String, String)>,
    Query(query): Query<TerminalQuery>,
) -> Result<Response, ApiError> {
    upgrade(ws, state, Target::stack_service(stack, service), query)
}

pub(super) async fn ws_deployment_terminal(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(deployment): Path<String>,
    Query(query): Query<TerminalQuery>,
) -> Result<Response, ApiError> {
    upgrade(ws, state, Target::deployment(deployment), query)
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    target: Target,
    query: TerminalQuery,
) -> Result<Response, ApiError> {
    let init = query.init().map_err(ApiError::InvalidRequest)?;
    let terminal = query.terminal;
    Ok(ws.on_upgrade(move |socket| handle_terminal_socket(socket, state, target, terminal, init)))
}

fn close_frame(code: u16, reason: impl Into<String>) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into().into(),
    }))
}

async fn handle_terminal_socket(
    mut socket: WebSocket,
    state: AppState,
    target: Target,
    terminal: Option<String>,
    init: Option<InitTerminal>,
) {
    // Register this connection for graceful shutdown tracking
    let (_guard, shutdown_rx) = state.shutdown.register();

    let principal = match login(&mut socket, &state, &target).await {
        Ok(principal) => principal,
        Err(reason) => {
            tracing::debug!(%target, reason, "terminal login rejected");
            let _ = socket.send(close_frame(close_code::POLICY, reason)).await;
            return;
        }
    };
    if socket.send(Message::Text(LOGGED_IN.into())).await.is_err() {
        return;
    }
    tracing::info!(user = %principal.name, %target, ?terminal, "terminal socket logged in");

    match state.dispatcher.route(&target) {
        Ok(Route::Local(resolved)) => {
            relay_local(socket, &state, &target, &resolved, terminal, init, shutdown_rx).await
        }
        Ok(Route::Remote(client)) => {
            relay_remote(socket, client, &target, terminal, init, shutdown_rx).await
        }
        Err(e) => {
            tracing::warn!(%target, %e, "terminal setup failed");
            let _ = socket.send(close_frame(close_code::ERROR, e.to_string())).await;
        }
    }
}

/// Wait for the credential message and check it.
async fn login(socket: &mut WebSocket, state: &AppState, target: &Target) -> Result<Principal, &'static str> {
    let first = tokio::time::timeout(state.login_timeout, async {
        loop {
            match socket.recv().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => return other,
            }
        }
    })
    .await;
    let text = match first {
        Err(_) => return Err("login timed out"),
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(_))) => return Err("expected login message"),
        Ok(Some(Err(_)) | None) => return Err("connection closed before login"),
    };
    let credential: WsLoginMessage =
        serde_json::from_str(text.as_str()).map_err(|_| "invalid login message")?;
    let principal = state
        .auth
        .validate(&credential)
        .map_err(|_| "invalid credentials")?;
    if !state.permissions.check(&principal, Some(target), Action::Terminal) {
        return Err("permission denied");
    }
    Ok(principal)
}

fn parse_control(text: &str) -> Option<ControlMessage> {
    match serde_json::from_str(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::warn!(%e, "ignoring malformed control frame");
            None
        }
    }
}

fn apply_control(session: &Session, msg: ControlMessage) {
    match msg {
        ControlMessage::Resize { rows, cols } => {
            if let Err(e) = session.resize(rows, cols) {
                tracing::warn!(terminal = %session.name, %e, "resize failed");
            }
        }
    }
}

async fn relay_local(
    mut socket: WebSocket,
    state: &AppState,
    target: &Target,
    resolved: &ResolvedTarget,
    terminal: Option<String>,
    init: Option<InitTerminal>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let session = match state
        .dispatcher
        .open_local(target, resolved, terminal.as_deref(), init.as_ref())
        .await
    {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(%target, %e, "terminal setup failed");
            let _ = socket.send(close_frame(close_code::ERROR, e.to_string())).await;
            return;
        }
    };
    let Some(attachment) = session.attach() else {
        let _ = socket
            .send(close_frame(close_code::ERROR, "terminal already attached"))
            .await;
        return;
    };
    let mut output = attachment.output;
    let _attached = attachment.guard;

    let (mut ws_tx, mut ws_rx) = socket.split();
    if ws_tx.send(Message::Binary(attachment.replay)).await.is_err() {
        return;
    }
    tracing::debug!(terminal = %session.name, "viewer attached");

    let cancel = CancellationToken::new();

    let outbound = async {
        let close = loop {
            if *shutdown_rx.borrow() {
                break Some((close_code::NORMAL, "server shutting down"));
            }
            tokio::select! {
                biased;
                chunk = output.recv() => match chunk {
                    Ok(bytes) => {
                        if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                            break None;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(terminal = %session.name, skipped = n, "viewer lagged, output dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break Some((close_code::NORMAL, "terminal exited"));
                    }
                },
                _ = session.cancelled.cancelled() => {
                    break Some((close_code::NORMAL, "terminal exited"));
                }
                _ = shutdown_rx.changed() => {
                    break Some((close_code::NORMAL, "server shutting down"));
                }
                _ = cancel.cancelled() => break None,
            }
        };
        if let Some((code, reason)) = close {
            let _ = ws_tx.send(close_frame(code, reason)).await;
        }
        cancel.cancel();
    };

    let inbound = async {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = ws_rx.next() => msg,
            };
            match msg {
                Some(Ok(Message::Binary(data))) => {
                    if session.write(data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if let Some(msg) = parse_control(text.as_str()) {
                        apply_control(&session, msg);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
        cancel.cancel();
    };

    tokio::join!(outbound, inbound);
    tracing::debug!(terminal = %session.name, "viewer detached");
}

/// Pipe a client socket to the same terminal on a remote agent.
async fn relay_remote(
    mut socket: WebSocket,
    client: TerminalClient,
    target: &Target,
    terminal: Option<String>,
    init: Option<InitTerminal>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let connection = match client
        .connect_terminal(target, terminal.as_deref(), init.as_ref())
        .await
    {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(%target, agent = %client.address(), %e, "remote terminal setup failed");
            let _ = socket.send(close_frame(close_code::ERROR, e.to_string())).await;
            return;
        }
    };
    let (mut remote_tx, mut remote_rx) = connection.split();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let cancel = CancellationToken::new();

    let outbound = async {
        let close = loop {
            if *shutdown_rx.borrow() {
                break Some((close_code::NORMAL, "server shutting down".to_string()));
            }
            let next = tokio::select! {
                biased;
                next = remote_rx.receive_stdout() => next,
                _ = shutdown_rx.changed() => {
                    break Some((close_code::NORMAL, "server shutting down".to_string()));
                }
                _ = cancel.cancelled() => break None,
            };
            match next {
                Ok(Some(bytes)) => {
                    if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                        break None;
                    }
                }
                Ok(None) => {
                    let reason = remote_rx.close_reason().unwrap_or("terminal exited").to_string();
                    break Some((close_code::NORMAL, reason));
                }
                Err(e) => break Some((close_code::ERROR, e.to_string())),
            }
        };
        if let Some((code, reason)) = close {
            let _ = ws_tx.send(close_frame(code, reason)).await;
        }
        cancel.cancel();
    };

    let inbound = async {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = ws_rx.next() => msg,
            };
            let sent = match msg {
                Some(Ok(Message::Binary(data))) => remote_tx.send_stdin(data).await,
                Some(Ok(Message::Text(text))) => match parse_control(text.as_str()) {
                    Some(control) => remote_tx.send_control(&control).await,
                    None => Ok(()),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => Ok(()),
            };
            if let Err(e) = sent {
                tracing::debug!(%e, "remote terminal write failed");
                break;
            }
        }
        cancel.cancel();
    };

    tokio::join!(outbound, inbound);
    let _ = remote_tx.close().await;
    tracing::debug!(%target, "remote viewer detached");
}
