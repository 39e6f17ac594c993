//! The local side of `termgate connect`: raw mode, window size, and the
//! stdin/stdout bridge to a remote terminal.

use bytes::Bytes;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::client::{ClientError, CloseReason, TerminalConnection};

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),

    #[error("failed to read terminal size: {0}")]
    Size(#[source] std::io::Error),

    #[error("terminal io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// RAII guard for terminal raw mode.
///
/// When created, enables raw mode on the terminal. When dropped (even on panic),
/// restores the terminal to its previous state.
///
/// Raw mode is needed to capture all keystrokes (including Ctrl+C, etc.) and
/// forward them to the remote shell instead of having the local terminal
/// handle them.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Get the current terminal size as (rows, cols).
///
/// crossterm::terminal::size() returns (cols, rows), so we swap them.
pub fn terminal_size() -> Result<(u16, u16), TerminalError> {
    let (cols, rows) = size().map_err(TerminalError::Size)?;
    Ok((rows, cols))
}

/// Read stdin on its own task. Reads cannot be cancelled mid-flight, so the
/// bridge below only ever selects on the channel.
fn spawn_stdin_reader() -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

enum Event {
    Output(Result<Option<Bytes>, ClientError>),
    Input(Option<Bytes>),
    Resized,
}

/// Bridge the local terminal to `connection` until the remote side closes.
///
/// Keystrokes are forwarded raw and window size changes are sent as resize
/// control messages. Returns why the remote side ended the session.
pub async fn run_interactive(connection: TerminalConnection) -> Result<CloseReason, TerminalError> {
    let _raw = RawModeGuard::new()?;
    let (mut sink, mut stream) = connection.split();
    let (rows, cols) = terminal_size()?;
    sink.resize(rows, cols).await?;

    let mut stdin = spawn_stdin_reader();
    let mut stdout = tokio::io::stdout();

    #[cfg(unix)]
    let mut winch = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?;

    let mut stdin_open = true;
    let reason = loop {
        #[cfg(unix)]
        let resized = winch.recv();
        #[cfg(not(unix))]
        let resized = std::future::pending::<Option<()>>();

        let event = tokio::select! {
            output = stream.receive_stdout() => Event::Output(output),
            input = stdin.recv(), if stdin_open => Event::Input(input),
            _ = resized => Event::Resized,
        };
        match event {
            Event::Output(Ok(Some(bytes))) => {
                stdout.write_all(&bytes).await?;
                stdout.flush().await?;
            }
            Event::Output(Ok(None)) => {
                break CloseReason::Clean(stream.close_reason().map(str::to_string));
            }
            Event::Output(Err(e)) => break CloseReason::Error(e.to_string()),
            Event::Input(Some(bytes)) => sink.send_stdin(bytes).await?,
            // Local stdin closed; keep showing output until the remote ends.
            Event::Input(None) => stdin_open = false,
            Event::Resized => {
                if let Ok((rows, cols)) = terminal_size() {
                    sink.resize(rows, cols).await?;
                }
            }
        }
    };
    let _ = sink.close().await;
    Ok(reason)
}
