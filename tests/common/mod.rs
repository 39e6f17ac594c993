#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use termgate::api::{self, AppState, RouterConfig};
use termgate::auth::Credential;
use termgate::client::{TerminalClient, TerminalConnection};
use termgate::config::Config;
use tokio::sync::oneshot;

/// Users and inventory shared by most tests.
pub const BASE_CONFIG: &str = r#"
    [server]
    login_timeout_secs = 2

    [[users]]
    name = "ops"
    jwt = "ops-jwt"
    api_key = "ops-key"
    api_secret = "ops-secret"

    [[users]]
    name = "viewer"
    jwt = "viewer-jwt"
    terminal = false

    [[users]]
    name = "root"
    jwt = "root-jwt"
    admin = true

    [[servers]]
    id = "local"

    [[deployments]]
    id = "api"
    server = "local"
"#;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A server on an ephemeral port, stopped on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(BASE_CONFIG).await
    }

    pub async fn start_with(config: &str) -> Self {
        let config: Config = toml::from_str(config).expect("test config should parse");
        config.validate().expect("test config should be valid");
        let state = AppState::from_config(&config);
        let app = api::router(state.clone(), RouterConfig::default());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                shutdown_rx.await.ok();
            })
            .await
            .unwrap();
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn client(&self, credential: Credential) -> TerminalClient {
        TerminalClient::new(self.url(), credential)
    }

    /// Client logged in as `ops`, who may open terminals.
    pub fn ops(&self) -> TerminalClient {
        self.client(Credential::jwt("ops-jwt"))
    }

    /// Client logged in as `root`, who may bulk delete.
    pub fn root(&self) -> TerminalClient {
        self.client(Credential::jwt("root-jwt"))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.shutdown.shutdown();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.state.registry().drain();
    }
}

/// Read output until `needle` appears. Returns everything read so far.
pub async fn read_until(conn: &mut TerminalConnection, needle: &str) -> String {
    let mut seen = String::new();
    let result = tokio::time::timeout(TIMEOUT, async {
        while !seen.contains(needle) {
            match conn.receive_stdout().await.expect("terminal read failed") {
                Some(bytes) => seen.push_str(&String::from_utf8_lossy(&bytes)),
                None => break,
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {needle:?}, got {seen:?}");
    seen
}

/// Read output until the socket closes. Returns everything read.
pub async fn read_to_close(conn: &mut TerminalConnection) -> String {
    let mut seen = String::new();
    let result = tokio::time::timeout(TIMEOUT, async {
        while let Some(bytes) = conn.receive_stdout().await.expect("terminal read failed") {
            seen.push_str(&String::from_utf8_lossy(&bytes));
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for close, got {seen:?}");
    seen
}
