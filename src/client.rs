//! Client for a termgate server: interactive terminals over WebSocket,
//! streamed command execution and terminal management over HTTP.

use bytes::Bytes;
use futures::stream::{BoxStream, SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::auth::Credential;
use crate::lines::{parse_sentinel, Finish, LineSplitter};
use crate::protocol::{
    BatchDeleteAllTerminals, ControlMessage, CreateTerminal, DeleteAllResponse, DeleteAllTerminals,
    DeleteTerminal, DeleteTerminalResponse, ErrorBody, ExecuteTerminal, ListTerminals,
    TerminalSummary, LOGGED_IN,
};
use crate::target::{InitTerminal, Target, TargetError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on management requests. Exec streams are not bounded.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] TargetError),

    #[error("invalid server address '{0}'")]
    Address(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("server returned {status}: {error}")]
    Api {
        status: u16,
        error: String,
        trace: Vec<String>,
    },

    #[error("login failed: {0}")]
    Login(String),

    #[error("invalid message: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    /// HTTP status for errors the server returned.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct TerminalClient {
    address: String,
    credential: Credential,
    http: reqwest::Client,
}

impl std::fmt::Debug for TerminalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalClient")
            .field("address", &self.address)
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}

/// Builds the HTTP client, falling back to reqwest's defaults with a warning.
fn http_client(builder: reqwest::ClientBuilder) -> reqwest::Client {
    builder.build().unwrap_or_else(|e| {
        tracing::warn!(%e, "failed to build http client, using defaults without connect timeout");
        reqwest::Client::new()
    })
}

impl TerminalClient {
    /// `address` is the server's base URL, e.g. `http://10.0.0.5:8120`.
    pub fn new(address: impl Into<String>, credential: Credential) -> Self {
        let http = http_client(reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT));
        Self {
            address: address.into().trim_end_matches('/').to_string(),
            credential,
            http,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        Url::parse(&format!("{}{}", self.address, path))
            .map_err(|_| ClientError::Address(self.address.clone()))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credential {
            Credential::Jwt { jwt } => req.bearer_auth(jwt),
            Credential::ApiKeys { key, secret } => {
                req.header("x-api-key", key).header("x-api-secret", secret)
            }
        }
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R, ClientError> {
        let req = self
            .authorize(self.http.post(self.url(path)?))
            .timeout(REQUEST_TIMEOUT)
            .json(body);
        let resp = check_status(req.send().await?).await?;
        Ok(resp.json().await?)
    }

    // ── WebSocket ──────────────────────────────────────────────────

    fn terminal_ws_url(
        &self,
        target: &Target,
        terminal: Option<&str>,
        init: Option<&InitTerminal>,
    ) -> Result<Url, ClientError> {
        let mut url = self.url("")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Address(self.address.clone()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ClientError::Address(self.address.clone()))?;
            segments.pop_if_empty().push("ws").push(target.kind());
            match target {
                Target::Server { server } => {
                    segments.push(server);
                }
                Target::Container { server, container } => {
                    segments.push(server).push(container);
                }
                Target::Stack { stack, service } => {
                    segments.push(stack).push(service.as_deref().unwrap_or_default());
                }
                Target::Deployment { deployment } => {
                    segments.push(deployment);
                }
            }
            segments.push("terminal");
        }
        {
            let mut query = url.query_pairs_mut();
            if let Some(terminal) = terminal {
                query.append_pair("terminal", terminal);
            }
            if let Some(init) = init {
                if let Some(command) = &init.command {
                    query.append_pair("init[command]", command);
                }
                query.append_pair("init[recreate]", init.recreate.as_str());
                if let Some(mode) = init.mode {
                    query.append_pair("init[mode]", mode.as_str());
                }
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    /// Open an interactive terminal.
    ///
    /// Without `terminal` the server picks the default name for the target.
    /// With `init` the terminal is created if it does not exist.
    pub async fn connect_terminal(
        &self,
        target: &Target,
        terminal: Option<&str>,
        init: Option<&InitTerminal>,
    ) -> Result<TerminalConnection, ClientError> {
        target.validate()?;
        let url = self.terminal_ws_url(target, terminal, init)?;
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        ws.send(Message::text(serde_json::to_string(&self.credential)?))
            .await?;

        let login = async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) if text.as_str() == LOGGED_IN => return Ok(()),
                    Some(Ok(Message::Text(text))) => {
                        return Err(ClientError::Login(text.to_string()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "socket closed before login".to_string());
                        return Err(ClientError::Login(reason));
                    }
                    None => return Err(ClientError::Login("socket closed before login".into())),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(ClientError::WebSocket(e)),
                }
            }
        };
        let outcome = tokio::time::timeout(LOGIN_TIMEOUT, login).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = ws.close(None).await;
                return Err(e);
            }
            Err(_) => {
                let _ = ws.close(None).await;
                return Err(ClientError::Login("timed out waiting for login".into()));
            }
        }
        tracing::debug!(%target, ?terminal, "terminal connected");
        Ok(TerminalConnection { ws, close_reason: None })
    }

    pub async fn connect_server_terminal(
        &self,
        server: &str,
        terminal: Option<&str>,
        init: Option<&InitTerminal>,
    ) -> Result<TerminalConnection, ClientError> {
        self.connect_terminal(&Target::server(server), terminal, init).await
    }

    pub async fn connect_container_terminal(
        &self,
        server: &str,
        container: &str,
        terminal: Option<&str>,
        init: Option<&InitTerminal>,
    ) -> Result<TerminalConnection, ClientError> {
        self.connect_terminal(&Target::container(server, container), terminal, init)
            .await
    }

    pub async fn connect_stack_service_terminal(
        &self,
        stack: &str,
        service: &str,
        terminal: Option<&str>,
        init: Option<&InitTerminal>,
    ) -> Result<TerminalConnection, ClientError> {
        self.connect_terminal(&Target::stack_service(stack, service), terminal, init)
            .await
    }

    pub async fn connect_deployment_terminal(
        &self,
        deployment: &str,
        terminal: Option<&str>,
        init: Option<&InitTerminal>,
    ) -> Result<TerminalConnection, ClientError> {
        self.connect_terminal(&Target::deployment(deployment), terminal, init)
            .await
    }

    // ── Exec ───────────────────────────────────────────────────────

    /// Run a command and stream raw output lines, sentinel included.
    pub async fn execute_stream(&self, request: &ExecuteTerminal) -> Result<ExecuteLines, ClientError> {
        request.target.validate()?;
        let req = self
            .authorize(self.http.post(self.url("/terminal/execute")?))
            .json(request);
        let resp = check_status(req.send().await?).await?;
        Ok(ExecuteLines::new(resp.bytes_stream()))
    }

    /// Run a command, calling `on_line` for each output line and
    /// `on_finish` exactly once when the stream ends.
    ///
    /// Transport failures are returned as errors and `on_finish` is not
    /// called.
    pub async fn execute(
        &self,
        request: &ExecuteTerminal,
        mut on_line: impl FnMut(&str),
        on_finish: impl FnOnce(Finish),
    ) -> Result<(), ClientError> {
        let mut lines = self.execute_stream(request).await?;
        let mut finish = Finish::EarlyExit;
        while let Some(line) = lines.next().await {
            let line = line?;
            match parse_sentinel(&line) {
                Some(code) => finish = Finish::ExitCode(code),
                None => on_line(&line),
            }
        }
        on_finish(finish);
        Ok(())
    }

    /// Run a command and collect its output. Convenience over
    /// [`execute`](Self::execute).
    pub async fn execute_collect(&self, request: &ExecuteTerminal) -> Result<(Vec<String>, Finish), ClientError> {
        let mut lines = Vec::new();
        let mut finish = Finish::EarlyExit;
        self.execute(request, |line| lines.push(line.to_string()), |f| finish = f)
            .await?;
        Ok((lines, finish))
    }

    pub async fn execute_server_command(
        &self,
        server: &str,
        terminal: Option<&str>,
        command: &str,
        init: Option<InitTerminal>,
    ) -> Result<ExecuteLines, ClientError> {
        self.execute_stream(&exec_request(Target::server(server), terminal, command, init))
            .await
    }

    pub async fn execute_container_command(
        &self,
        server: &str,
        container: &str,
        terminal: Option<&str>,
        command: &str,
        init: Option<InitTerminal>,
    ) -> Result<ExecuteLines, ClientError> {
        self.execute_stream(&exec_request(
            Target::container(server, container),
            terminal,
            command,
            init,
        ))
        .await
    }

    pub async fn execute_stack_service_command(
        &self,
        stack: &str,
        service: &str,
        terminal: Option<&str>,
        command: &str,
        init: Option<InitTerminal>,
    ) -> Result<ExecuteLines, ClientError> {
        self.execute_stream(&exec_request(
            Target::stack_service(stack, service),
            terminal,
            command,
            init,
        ))
        .await
    }

    pub async fn execute_deployment_command(
        &self,
        deployment: &str,
        terminal: Option<&str>,
        command: &str,
        init: Option<InitTerminal>,
    ) -> Result<ExecuteLines, ClientError> {
        self.execute_stream(&exec_request(Target::deployment(deployment), terminal, command, init))
            .await
    }

    // ── Management ─────────────────────────────────────────────────

    pub async fn create_terminal(&self, request: &CreateTerminal) -> Result<TerminalSummary, ClientError> {
        request.target.validate()?;
        self.post("/terminal/create", request).await
    }

    /// Returns whether a terminal was actually removed.
    pub async fn delete_terminal(&self, target: &Target, terminal: &str) -> Result<bool, ClientError> {
        target.validate()?;
        let resp: DeleteTerminalResponse = self
            .post(
                "/terminal/delete",
                &DeleteTerminal {
                    target: target.clone(),
                    terminal: terminal.to_string(),
                },
            )
            .await?;
        Ok(resp.deleted)
    }

    pub async fn delete_all_terminals(&self, server: &str) -> Result<usize, ClientError> {
        let resp: DeleteAllResponse = self
            .post(
                "/terminal/delete_all",
                &DeleteAllTerminals {
                    server: server.to_string(),
                },
            )
            .await?;
        Ok(resp.deleted)
    }

    pub async fn batch_delete_all_terminals(&self, request: &BatchDeleteAllTerminals) -> Result<usize, ClientError> {
        let resp: DeleteAllResponse = self.post("/terminal/batch_delete_all", request).await?;
        Ok(resp.deleted)
    }

    pub async fn list_terminals(&self, target: Option<&Target>) -> Result<Vec<TerminalSummary>, ClientError> {
        if let Some(target) = target {
            target.validate_filter()?;
        }
        self.post(
            "/terminal/list",
            &ListTerminals {
                target: target.cloned(),
            },
        )
        .await
    }
}

fn exec_request(target: Target, terminal: Option<&str>, command: &str, init: Option<InitTerminal>) -> ExecuteTerminal {
    ExecuteTerminal {
        target,
        terminal: terminal.map(str::to_string),
        command: command.to_string(),
        init,
    }
}

/// Turn a non-success response into [`ClientError::Api`].
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => ClientError::Api {
            status: status.as_u16(),
            error: body.error,
            trace: body.trace,
        },
        Err(e) => ClientError::Api {
            status: status.as_u16(),
            error: format!("failed to parse error response: {e}"),
            trace: if text.is_empty() { vec![] } else { vec![text] },
        },
    })
}

// ── Exec line stream ───────────────────────────────────────────────

/// Raw output lines of one exec request.
///
/// Finite and not restartable. Lines are reassembled across chunk
/// boundaries; a final unterminated fragment is yielded at the end.
pub struct ExecuteLines {
    inner: BoxStream<'static, Result<String, ClientError>>,
}

struct LineState<S> {
    body: S,
    splitter: LineSplitter,
    ready: VecDeque<String>,
    done: bool,
}

impl ExecuteLines {
    fn new<S>(body: S) -> Self
    where
        S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
    {
        let state = LineState {
            body,
            splitter: LineSplitter::new(),
            ready: VecDeque::new(),
            done: false,
        };
        let inner = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(line) = state.ready.pop_front() {
                    return Some((Ok(line), state));
                }
                if state.done {
                    return None;
                }
                match state.body.next().await {
                    Some(Ok(chunk)) => {
                        let lines = state.splitter.push(&chunk);
                        state.ready.extend(lines);
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(ClientError::Request(e)), state));
                    }
                    None => {
                        state.done = true;
                        state.ready.extend(state.splitter.finish());
                    }
                }
            }
        });
        Self { inner: inner.boxed() }
    }
}

impl Stream for ExecuteLines {
    type Item = Result<String, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

// ── Terminal connection ────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a terminal stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by either side. Carries the close frame reason, if any.
    Clean(Option<String>),
    Error(String),
}

enum Inbound {
    Output(Bytes),
    Closed(Option<String>),
}

async fn next_inbound<S>(ws: &mut S) -> Result<Inbound, ClientError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(bytes))) => return Ok(Inbound::Output(bytes)),
            Some(Ok(Message::Text(text))) => {
                return Ok(Inbound::Output(Bytes::copy_from_slice(text.as_bytes())));
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                return Ok(Inbound::Closed(reason));
            }
            None => return Ok(Inbound::Closed(None)),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ClientError::WebSocket(e)),
        }
    }
}

fn control_frame(msg: &ControlMessage) -> Result<Message, ClientError> {
    Ok(Message::text(serde_json::to_string(msg)?))
}

/// A logged-in terminal socket.
pub struct TerminalConnection {
    ws: WsStream,
    close_reason: Option<String>,
}

impl TerminalConnection {
    pub async fn send_stdin(&mut self, data: impl Into<Bytes>) -> Result<(), ClientError> {
        self.ws.send(Message::Binary(data.into())).await?;
        Ok(())
    }

    pub async fn resize(&mut self, rows: u16, cols: u16) -> Result<(), ClientError> {
        self.send_control(&ControlMessage::Resize { rows, cols }).await
    }

    pub async fn send_control(&mut self, msg: &ControlMessage) -> Result<(), ClientError> {
        self.ws.send(control_frame(msg)?).await?;
        Ok(())
    }

    /// Next chunk of terminal output. `None` once the socket is closed;
    /// see [`close_reason`](Self::close_reason).
    pub async fn receive_stdout(&mut self) -> Result<Option<Bytes>, ClientError> {
        match next_inbound(&mut self.ws).await? {
            Inbound::Output(bytes) => Ok(Some(bytes)),
            Inbound::Closed(reason) => {
                self.close_reason = reason;
                Ok(None)
            }
        }
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// Close the socket. The terminal keeps running on the server.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.ws.close(None).await?;
        Ok(())
    }

    pub fn split(self) -> (TerminalSink, TerminalStream) {
        let (sink, stream) = self.ws.split();
        (
            TerminalSink { sink },
            TerminalStream {
                stream,
                close_reason: None,
            },
        )
    }
}

/// Write half of a [`TerminalConnection`].
pub struct TerminalSink {
    sink: SplitSink<WsStream, Message>,
}

impl TerminalSink {
    pub async fn send_stdin(&mut self, data: impl Into<Bytes>) -> Result<(), ClientError> {
        self.sink.send(Message::Binary(data.into())).await?;
        Ok(())
    }

    pub async fn resize(&mut self, rows: u16, cols: u16) -> Result<(), ClientError> {
        self.send_control(&ControlMessage::Resize { rows, cols }).await
    }

    pub async fn send_control(&mut self, msg: &ControlMessage) -> Result<(), ClientError> {
        self.sink.send(control_frame(msg)?).await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.sink.close().await?;
        Ok(())
    }
}

/// Read half of a [`TerminalConnection`].
pub struct TerminalStream {
    stream: SplitStream<WsStream>,
    close_reason: Option<String>,
}

impl TerminalStream {
    pub async fn receive_stdout(&mut self) -> Result<Option<Bytes>, ClientError> {
        match next_inbound(&mut self.stream).await? {
            Inbound::Output(bytes) => Ok(Some(bytes)),
            Inbound::Closed(reason) => {
                self.close_reason = reason;
                Ok(None)
            }
        }
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// Feed every output chunk to `on_output` until the socket ends, then
    /// call `on_close` exactly once.
    pub async fn pump(mut self, mut on_output: impl FnMut(Bytes), on_close: impl FnOnce(CloseReason)) {
        let reason = loop {
            match next_inbound(&mut self.stream).await {
                Ok(Inbound::Output(bytes)) => on_output(bytes),
                Ok(Inbound::Closed(reason)) => break CloseReason::Clean(reason),
                Err(e) => break CloseReason::Error(e.to_string()),
            }
        };
        on_close(reason);
    }
}
