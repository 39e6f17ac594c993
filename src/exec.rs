//! Command execution behind `POST /terminal/execute`.
//!
//! Both flavors produce a channel of output lines. A one-shot process ends
//! its lines with the exit-code sentinel once it has been reaped; a command
//! run inside a persistent terminal forwards whatever the shell prints
//! between the start and end markers, sentinel included.

use bytes::Bytes;
use futures::StreamExt;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::lines::{sentinel_line, wrap_in_session, LineSplitter, END_OF_OUTPUT, START_OF_OUTPUT};
use crate::resolver::ResolvedTarget;
use crate::session::{InputClosed, Session};
use crate::target::{container_name, no_chaining, InitTerminal, TargetError};

/// Lines buffered between the process and the HTTP body.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Longest line forwarded from a one-shot process. A longer line ends the
/// run without an exit code.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Build the one-shot command for `command` on `resolved`.
///
/// Host commands run under `sh -c`. Container commands run through
/// `docker exec <container> <shell> -c`, with the shell taken from
/// `init.command` and defaulting to `sh`.
pub fn oneshot_command(
    resolved: &ResolvedTarget,
    init: Option<&InitTerminal>,
    command: &str,
) -> Result<Command, TargetError> {
    let cmd = match &resolved.container {
        None => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        }
        Some(container) => {
            container_name(container)?;
            let shell = init.and_then(|i| i.command.as_deref()).unwrap_or("sh");
            no_chaining(shell, "command")?;
            let mut cmd = Command::new("docker");
            cmd.args(["exec", container.as_str(), shell, "-c", command]);
            cmd
        }
    };
    Ok(cmd)
}

/// Spawn `cmd` and stream its merged stdout and stderr lines.
///
/// The sentinel is only sent when every line was forwarded. Dropping the
/// receiver, or output that cannot be framed, kills the process group.
pub fn spawn_oneshot(mut cmd: Command) -> std::io::Result<mpsc::Receiver<String>> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr not captured"))?;
    let stdout = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let stderr = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut lines = futures::stream::select(stdout, stderr);

    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!(?pid, "exec response abandoned, killing process");
                    kill_group(pid);
                    let _ = child.kill().await;
                    return;
                }
                next = lines.next() => next,
            };
            match next {
                Some(Ok(line)) => {
                    if tx.send(line).await.is_err() {
                        kill_group(pid);
                        let _ = child.kill().await;
                        return;
                    }
                }
                // The reader stops after a decode error, so the rest of the
                // output is lost too. End without an exit code.
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    tracing::warn!(?pid, max = MAX_LINE_LENGTH, "overlong output line, killing process");
                    kill_group(pid);
                    let _ = child.kill().await;
                    return;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    tracing::warn!(?pid, ?e, "error reading exec output, killing process");
                    kill_group(pid);
                    let _ = child.kill().await;
                    return;
                }
                None => break,
            }
        }

        match child.wait().await {
            Ok(status) => match status.code() {
                Some(code) => {
                    let _ = tx.send(sentinel_line(code)).await;
                }
                // Killed by a signal: no code to report.
                None => tracing::debug!(?pid, ?status, "exec process terminated by signal"),
            },
            Err(e) => tracing::warn!(?pid, ?e, "failed to reap exec process"),
        }
    });
    Ok(rx)
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid.filter(|p| *p != 0 && *p <= i32::MAX as u32) {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

/// Run `command` inside a persistent terminal and stream its output.
///
/// The command is typed into the shell wrapped in start/end markers. Lines
/// before the start marker (the echo of the command itself, prompts) are
/// skipped; the end marker ends the stream and is not forwarded. If the
/// terminal goes away first, the stream ends without a sentinel.
pub async fn in_session(session: &Session, command: &str) -> Result<mpsc::Receiver<String>, InputClosed> {
    // Subscribe before typing so the start marker cannot be missed.
    let output = session.subscribe();
    session.write(wrap_in_session(command)).await?;
    Ok(forward_marked_output(output, session.cancelled.clone(), session.name.clone()))
}

/// Forward the lines between the start and end markers of `output`.
///
/// A lagged receiver has lost output, so the stream ends there and the
/// caller sees no exit code.
fn forward_marked_output(
    mut output: broadcast::Receiver<Bytes>,
    cancelled: CancellationToken,
    name: String,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut splitter = LineSplitter::new();
        let mut started = false;
        loop {
            let chunk = tokio::select! {
                biased;
                chunk = output.recv() => chunk,
                _ = tx.closed() => return,
                _ = cancelled.cancelled() => {
                    tracing::debug!(terminal = %name, "terminal ended during exec");
                    return;
                }
            };
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(terminal = %name, skipped = n, "exec output lagged, ending without exit code");
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            for line in splitter.push(&bytes) {
                if !started {
                    started = line == START_OF_OUTPUT;
                    continue;
                }
                if line == END_OF_OUTPUT {
                    return;
                }
                if tx.send(line).await.is_err() {
                    return;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lines::parse_sentinel;
    use crate::pty::CommandLine;
    use crate::resolver::Endpoint;
    use crate::session::{SessionRegistry, SessionSpec};
    use crate::target::{Target, TerminalRecreateMode};
    use std::time::Duration;

    fn host() -> ResolvedTarget {
        ResolvedTarget {
            server: "local".into(),
            endpoint: Endpoint::Local,
            container: None,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("exec output timed out")
        {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn oneshot_streams_lines_then_sentinel() {
        let cmd = oneshot_command(&host(), None, "echo one; echo two").unwrap();
        let lines = collect(spawn_oneshot(cmd).unwrap()).await;
        assert_eq!(lines, vec!["one", "two", "__KOMODO_EXIT_CODE__:0"]);
    }

    #[tokio::test]
    async fn oneshot_reports_nonzero_exit_and_stderr() {
        let cmd = oneshot_command(&host(), None, "echo oops >&2; exit 7").unwrap();
        let lines = collect(spawn_oneshot(cmd).unwrap()).await;
        assert_eq!(lines, vec!["oops", "__KOMODO_EXIT_CODE__:7"]);
    }

    #[tokio::test]
    async fn signal_death_has_no_sentinel() {
        let cmd = oneshot_command(&host(), None, "echo before; kill -9 $$").unwrap();
        let lines = collect(spawn_oneshot(cmd).unwrap()).await;
        assert_eq!(lines, vec!["before"]);
    }

    #[tokio::test]
    async fn unterminated_last_line_is_kept() {
        let cmd = oneshot_command(&host(), None, "printf 'no newline'").unwrap();
        let lines = collect(spawn_oneshot(cmd).unwrap()).await;
        assert_eq!(lines, vec!["no newline", "__KOMODO_EXIT_CODE__:0"]);
    }

    #[tokio::test]
    async fn overlong_line_withholds_exit_code() {
        let script = format!("echo before; printf '%0{}d\\n' 0; echo after", MAX_LINE_LENGTH + 10);
        let cmd = oneshot_command(&host(), None, &script).unwrap();
        let lines = collect(spawn_oneshot(cmd).unwrap()).await;
        assert_eq!(lines.first().map(String::as_str), Some("before"));
        assert!(lines.iter().all(|l| parse_sentinel(l).is_none()), "{lines:?}");
    }

    #[tokio::test]
    async fn lagged_in_session_output_ends_without_sentinel() {
        let (output_tx, output) = broadcast::channel::<Bytes>(16);
        let mut rx = forward_marked_output(output, CancellationToken::new(), "lagging".into());

        output_tx
            .send(Bytes::from(format!("{START_OF_OUTPUT}\nfirst\n")))
            .unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("first"));

        // Overrun the channel before the forwarder reads again.
        for i in 0..64 {
            output_tx.send(Bytes::from(format!("line {i}\n"))).unwrap();
        }
        output_tx
            .send(Bytes::from(format!("{}\n{END_OF_OUTPUT}\n", sentinel_line(0))))
            .unwrap();

        let rest = collect(rx).await;
        assert!(rest.iter().all(|l| parse_sentinel(l).is_none()), "{rest:?}");
        assert!(rest.len() < 64, "{rest:?}");
    }

    #[tokio::test]
    async fn dropping_receiver_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("echo started; sleep 1; touch {}", marker.display());
        let cmd = oneshot_command(&host(), None, &script).unwrap();
        let mut rx = spawn_oneshot(cmd).unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("started"));
        drop(rx);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[test]
    fn container_commands_go_through_docker_exec() {
        let resolved = ResolvedTarget {
            container: Some("web".into()),
            ..host()
        };
        let cmd = oneshot_command(&resolved, None, "ls /").unwrap();
        let std = cmd.as_std();
        assert_eq!(std.get_program(), "docker");
        let args: Vec<_> = std.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["exec", "web", "sh", "-c", "ls /"]);

        let bash = InitTerminal {
            command: Some("bash".into()),
            ..Default::default()
        };
        let cmd = oneshot_command(&resolved, Some(&bash), "ls").unwrap();
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args[2], "bash");

        let chained = InitTerminal {
            command: Some("sh && id".into()),
            ..Default::default()
        };
        assert!(oneshot_command(&resolved, Some(&chained), "ls").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn in_session_forwards_between_markers() {
        let registry = SessionRegistry::new();
        let target = Target::server("local");
        let session = registry
            .create(
                SessionSpec {
                    target: target.clone(),
                    name: "shell".into(),
                    server: "local".into(),
                    command: CommandLine::shell("sh"),
                    tags: vec![],
                },
                TerminalRecreateMode::Never,
            )
            .await
            .unwrap();

        let lines = collect(in_session(&session, "echo inside; false").await.unwrap()).await;
        assert!(lines.iter().any(|l| l == "inside"), "{lines:?}");
        assert!(!lines.iter().any(|l| l.contains(START_OF_OUTPUT)));
        assert!(!lines.iter().any(|l| l == END_OF_OUTPUT));
        let code = lines.iter().find_map(|l| parse_sentinel(l));
        assert_eq!(code.as_deref(), Some("1"));

        // The terminal is still usable afterwards.
        let lines = collect(in_session(&session, "echo again").await.unwrap()).await;
        assert!(lines.iter().any(|l| l == "again"));
        registry.delete(&target, "shell").await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn in_session_ends_without_sentinel_when_terminal_dies() {
        let registry = SessionRegistry::new();
        let target = Target::server("local");
        let session = registry
            .create(
                SessionSpec {
                    target: target.clone(),
                    name: "doomed".into(),
                    server: "local".into(),
                    command: CommandLine::shell("sh"),
                    tags: vec![],
                },
                TerminalRecreateMode::Never,
            )
            .await
            .unwrap();
        let rx = in_session(&session, "sleep 30").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        registry.delete(&target, "doomed").await;
        let lines = collect(rx).await;
        assert!(lines.iter().all(|l| parse_sentinel(l).is_none()), "{lines:?}");
    }
}
