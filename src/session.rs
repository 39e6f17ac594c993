use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::history::{History, DEFAULT_HISTORY_CAPACITY};
use crate::protocol::TerminalSummary;
use crate::pty::{CommandLine, Pty, PtyError, DEFAULT_COLS, DEFAULT_ROWS};
use crate::target::{Target, TerminalRecreateMode};

/// Validate a terminal name. Names must be 1-64 chars, alphanumeric/hyphens/underscores/dots.
pub fn validate_terminal_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("terminal name must not be empty".into());
    }
    if name.len() > 64 {
        return Err(format!("terminal name too long ({} chars, max 64)", name.len()));
    }
    if !name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.') {
        return Err(format!(
            "terminal name contains invalid characters: {}",
            name.chars().take(64).collect::<String>()
        ));
    }
    Ok(())
}

/// Validate a tag string. Tags must be 1-64 chars, alphanumeric/hyphens/underscores/dots.
pub fn validate_tag(tag: &str) -> Result<(), String> {
    if tag.is_empty() {
        return Err("tag must not be empty".to_string());
    }
    if tag.len() > 64 {
        return Err(format!("tag too long ({} chars, max 64)", tag.len()));
    }
    if !tag.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.') {
        return Err(format!("tag contains invalid characters: {tag}"));
    }
    Ok(())
}

/// Capacity of the live output fan-out. A viewer further behind than this
/// loses the oldest chunks.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Everything needed to start a terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    pub target: Target,
    pub name: String,
    /// Resolved server the terminal runs on.
    pub server: String,
    pub command: CommandLine,
    pub tags: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("terminal input is closed")]
pub struct InputClosed;

/// A named terminal: one PTY process plus its output history.
///
/// Clones share the same process. The reader thread appends to the history
/// and publishes to live viewers under one lock, which is what lets
/// [`Session::attach`] hand out a replay that joins the live stream with no
/// gap and no overlap.
#[derive(Clone)]
pub struct Session {
    pub name: String,
    pub target: Target,
    pub server: String,
    pub command: String,
    /// Unix timestamp in milliseconds.
    pub created_at: i64,
    /// PID of the child process spawned in the PTY, if available.
    pub pid: Option<u32>,
    pub tags: Vec<String>,
    pub input_tx: mpsc::Sender<Bytes>,
    output_tx: broadcast::Sender<Bytes>,
    history: Arc<Mutex<History>>,
    pub pty: Arc<Mutex<Pty>>,
    /// Fires when this terminal is deleted or its process exits.
    pub cancelled: CancellationToken,
    /// Set once the child has been reaped. Checked before signaling so a
    /// recycled PID is never hit.
    pub child_exited: Arc<AtomicBool>,
    exited_rx: watch::Receiver<bool>,
    attached: Arc<AtomicBool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("pid", &self.pid)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

/// RAII guard for the single attached viewer. Releases the slot on drop.
pub struct AttachGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// A viewer's handle: the history to replay, then the live stream.
pub struct Attachment {
    pub replay: Bytes,
    pub output: broadcast::Receiver<Bytes>,
    pub guard: AttachGuard,
}

impl Session {
    /// Spawn the PTY process and its I/O threads.
    ///
    /// Must be called from within a tokio runtime (including a blocking
    /// pool thread).
    pub fn spawn(spec: &SessionSpec, history_capacity: usize) -> Result<Self, PtyError> {
        let mut pty = Pty::spawn(&spec.command, DEFAULT_ROWS, DEFAULT_COLS)?;
        let pty_reader = pty.take_reader()?;
        let pty_writer = pty.take_writer()?;
        let mut child = pty.take_child()?;
        let pid = child.process_id();

        let child_exited = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited_rx) = watch::channel(false);
        {
            let child_exited = child_exited.clone();
            tokio::task::spawn_blocking(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    match child.wait() {
                        Ok(status) => tracing::debug!(?status, "terminal child exited"),
                        Err(e) => tracing::error!(?e, "error waiting for terminal child"),
                    }
                }));
                if let Err(e) = result {
                    tracing::error!("child exit monitor task panicked: {:?}", e);
                }
                child_exited.store(true, Ordering::Release);
                let _ = exited_tx.send(true);
            });
        }

        let history = Arc::new(Mutex::new(History::new(history_capacity)));
        let (output_tx, _) = broadcast::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);

        // History push and broadcast happen under the history lock; attach
        // takes its snapshot and subscription under the same lock.
        {
            let history = history.clone();
            let output_tx = output_tx.clone();
            tokio::task::spawn_blocking(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    use std::io::Read;
                    let mut reader = pty_reader;
                    let mut buf = [0u8; 4096];
                    loop {
                        match reader.read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => {
                                let data = Bytes::copy_from_slice(&buf[..n]);
                                let mut history = history.lock();
                                history.push(&data);
                                // No receivers is fine; history still has it.
                                let _ = output_tx.send(data);
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                            Err(_) => break,
                        }
                    }
                }));
                if let Err(e) = result {
                    tracing::error!("PTY reader task panicked: {:?}", e);
                }
            });
        }

        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                use std::io::Write;
                let mut writer = pty_writer;
                let mut rx = input_rx;
                while let Some(data) = rx.blocking_recv() {
                    if writer.write_all(&data).is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
            }));
            if let Err(e) = result {
                tracing::error!("PTY writer task panicked: {:?}", e);
            }
        });

        Ok(Session {
            name: spec.name.clone(),
            target: spec.target.clone(),
            server: spec.server.clone(),
            command: spec.command.to_string(),
            created_at: unix_timestamp_ms(),
            pid,
            tags: spec.tags.clone(),
            input_tx,
            output_tx,
            history,
            pty: Arc::new(Mutex::new(pty)),
            cancelled: CancellationToken::new(),
            child_exited,
            exited_rx,
            attached: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn key(&self) -> SessionKey {
        (self.target.clone(), self.name.clone())
    }

    /// Claim the single viewer slot.
    ///
    /// Returns `None` if another viewer is attached. The replay is the
    /// history as of the moment the live receiver was created.
    pub fn attach(&self) -> Option<Attachment> {
        if self
            .attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let guard = AttachGuard {
            flag: Arc::clone(&self.attached),
        };
        let history = self.history.lock();
        let replay = history.snapshot();
        let output = self.output_tx.subscribe();
        drop(history);
        Some(Attachment {
            replay,
            output,
            guard,
        })
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Live output from now on, without claiming the viewer slot.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.output_tx.subscribe()
    }

    pub fn history_snapshot(&self) -> Bytes {
        self.history.lock().snapshot()
    }

    pub fn stored_size_kb(&self) -> f64 {
        self.history.lock().size_kb()
    }

    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), InputClosed> {
        self.input_tx.send(data.into()).await.map_err(|_| InputClosed)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.pty.lock().resize(rows, cols)
    }

    pub fn has_exited(&self) -> bool {
        self.child_exited.load(Ordering::Acquire)
    }

    /// Resolve once the child process has been reaped.
    pub async fn wait_exit(&self) {
        let mut rx = self.exited_rx.clone();
        let _ = rx.wait_for(|exited| *exited).await;
    }

    /// Send SIGHUP to the child's process group.
    ///
    /// Signals the entire process group (negative PID) so that child
    /// processes spawned by the shell also receive the signal.
    pub fn send_sighup(&self) {
        self.signal(libc::SIGHUP);
    }

    /// Send SIGKILL to the child's process group.
    pub fn kill_child(&self) {
        self.signal(libc::SIGKILL);
    }

    fn signal(&self, sig: libc::c_int) {
        if let Some(pid) = self.pid {
            if pid == 0 || pid > i32::MAX as u32 {
                tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
                return;
            }
            if self.has_exited() {
                tracing::debug!(pid, "child already exited, skipping signal");
                return;
            }
            unsafe {
                libc::kill(-(pid as i32), sig);
            }
        }
    }

    pub fn summary(&self) -> TerminalSummary {
        TerminalSummary {
            name: self.name.clone(),
            target: self.target.clone(),
            command: self.command.clone(),
            stored_size_kb: self.stored_size_kb(),
            created_at: self.created_at,
            tags: self.tags.clone(),
            attached: self.is_attached(),
        }
    }

    fn clear_history(&self) {
        self.history.lock().clear();
    }

    fn same_process(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.child_exited, &other.child_exited)
    }
}

fn unix_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid terminal name: {0}")]
    InvalidName(String),
    #[error("invalid tag: {0}")]
    InvalidTag(String),
    #[error("terminal '{0}' already exists")]
    AlreadyExists(String),
    #[error("terminal '{name}' already exists running '{existing}'")]
    CommandMismatch { name: String, existing: String },
    #[error("terminal '{0}' not found")]
    NotFound(String),
    #[error("{0}")]
    CapacityExceeded(String),
    #[error("terminal registry is shutting down")]
    ShuttingDown,
    #[error("failed to spawn terminal: {0}")]
    Spawn(#[from] PtyError),
    #[error("terminal process exited immediately: {0}")]
    ExitedImmediately(String),
    #[error("terminal spawn task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Terminals are unique per target, not globally.
pub type SessionKey = (Target, String);

enum Slot {
    /// Process being spawned. Holds the key against concurrent creators.
    Pending,
    Ready(Session),
}

struct RegistryInner {
    slots: HashMap<SessionKey, Slot>,
    closed: bool,
}

#[derive(Debug, Clone)]
pub struct RegistryLimits {
    pub max_sessions: Option<usize>,
    pub max_sessions_per_target: Option<usize>,
    pub history_capacity: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_sessions: Some(SessionRegistry::DEFAULT_MAX_SESSIONS),
            max_sessions_per_target: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// Which terminals a bulk delete removes. Every set criterion must match;
/// `tags` matches if the terminal carries any of them.
#[derive(Debug, Clone, Default)]
pub struct DeleteFilter {
    pub server: Option<String>,
    pub target: Option<Target>,
    pub tags: Vec<String>,
}

impl DeleteFilter {
    pub fn server(server: impl Into<String>) -> Self {
        Self {
            server: Some(server.into()),
            ..Default::default()
        }
    }

    fn selects(&self, session: &Session) -> bool {
        if let Some(server) = &self.server {
            if &session.server != server {
                return false;
            }
        }
        if let Some(target) = &self.target {
            if !target.matches(&session.target) {
                return false;
            }
        }
        self.tags.is_empty() || self.tags.iter().any(|t| session.tags.contains(t))
    }
}

/// How long a fresh process must survive to count as started.
const SPAWN_CHECK: Duration = Duration::from_millis(100);
/// Bound on waiting for a killed process to be reaped.
const EXIT_WAIT: Duration = Duration::from_secs(3);

/// Removes a `Pending` slot if creation does not complete.
struct PendingGuard {
    registry: SessionRegistry,
    key: SessionKey,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.registry.inner.write();
        if matches!(inner.slots.get(&self.key), Some(Slot::Pending)) {
            inner.slots.remove(&self.key);
        }
    }
}

/// Process-wide map of terminals keyed by `(target, name)`.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    limits: Arc<RegistryLimits>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Default maximum number of terminals when no explicit limit is set.
    ///
    /// Each terminal costs ~2 fds (PTY pair) + 3 blocking threads + up to
    /// the history capacity in memory.
    pub const DEFAULT_MAX_SESSIONS: usize = 256;

    pub fn new() -> Self {
        Self::with_limits(RegistryLimits::default())
    }

    pub fn with_limits(limits: RegistryLimits) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                slots: HashMap::new(),
                closed: false,
            })),
            limits: Arc::new(limits),
        }
    }

    pub fn limits(&self) -> &RegistryLimits {
        &self.limits
    }

    /// Spawn a terminal and insert it.
    ///
    /// With [`TerminalRecreateMode::Never`] an existing `(target, name)` is
    /// an error. `Always` replaces it, `DifferentCommand` replaces it only
    /// when the command changed; a replaced process is killed before the new
    /// one starts. A key whose creation is still in flight counts as
    /// existing.
    pub async fn create(
        &self,
        spec: SessionSpec,
        recreate: TerminalRecreateMode,
    ) -> Result<Session, RegistryError> {
        validate_terminal_name(&spec.name).map_err(RegistryError::InvalidName)?;
        for tag in &spec.tags {
            validate_tag(tag).map_err(RegistryError::InvalidTag)?;
        }

        let key: SessionKey = (spec.target.clone(), spec.name.clone());
        let replaced = self.reserve(&key, &spec.command.to_string(), recreate)?;
        let mut pending = PendingGuard {
            registry: self.clone(),
            key: key.clone(),
            armed: true,
        };

        if let Some(old) = replaced {
            tracing::info!(terminal = %old.name, target = %old.target, "replacing terminal");
            self.terminate(&old).await;
        }

        let capacity = self.limits.history_capacity;
        let spawn_spec = spec.clone();
        let session =
            tokio::task::spawn_blocking(move || Session::spawn(&spawn_spec, capacity)).await??;

        if tokio::time::timeout(SPAWN_CHECK, session.wait_exit()).await.is_ok() {
            let output = String::from_utf8_lossy(&session.history_snapshot())
                .trim()
                .to_string();
            return Err(RegistryError::ExitedImmediately(output));
        }

        {
            let mut inner = self.inner.write();
            if inner.closed {
                drop(inner);
                session.kill_child();
                return Err(RegistryError::ShuttingDown);
            }
            inner.slots.insert(key, Slot::Ready(session.clone()));
        }
        pending.armed = false;

        self.monitor_child_exit(session.clone());
        tracing::info!(
            terminal = %session.name,
            target = %session.target,
            pid = ?session.pid,
            command = %session.command,
            "terminal created"
        );
        Ok(session)
    }

    /// Claim `key` as `Pending`, returning the session it displaces.
    fn reserve(
        &self,
        key: &SessionKey,
        command: &str,
        recreate: TerminalRecreateMode,
    ) -> Result<Option<Session>, RegistryError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(RegistryError::ShuttingDown);
        }
        match inner.slots.get(key) {
            Some(Slot::Pending) => return Err(RegistryError::AlreadyExists(key.1.clone())),
            Some(Slot::Ready(existing)) => {
                let replace = match recreate {
                    TerminalRecreateMode::Never => false,
                    TerminalRecreateMode::Always => true,
                    TerminalRecreateMode::DifferentCommand => existing.command != command,
                };
                if !replace {
                    return Err(RegistryError::AlreadyExists(key.1.clone()));
                }
            }
            None => {
                if let Some(max) = self.limits.max_sessions {
                    if inner.slots.len() >= max {
                        return Err(RegistryError::CapacityExceeded(format!(
                            "maximum of {max} terminals reached"
                        )));
                    }
                }
                if let Some(max) = self.limits.max_sessions_per_target {
                    let on_target = inner.slots.keys().filter(|(t, _)| *t == key.0).count();
                    if on_target >= max {
                        return Err(RegistryError::CapacityExceeded(format!(
                            "maximum of {max} terminals reached for {}",
                            key.0
                        )));
                    }
                }
            }
        }
        Ok(match inner.slots.insert(key.clone(), Slot::Pending) {
            Some(Slot::Ready(old)) => Some(old),
            _ => None,
        })
    }

    /// Return the existing terminal or create it.
    ///
    /// An existing terminal is reused when `recreate` allows it. Under
    /// `Never`, an existing terminal running a different command is an
    /// error rather than a silent reuse.
    pub async fn get_or_create(
        &self,
        spec: SessionSpec,
        recreate: TerminalRecreateMode,
    ) -> Result<Session, RegistryError> {
        if let Ok(existing) = self.get(&spec.target, &spec.name) {
            let same = existing.command == spec.command.to_string();
            return match recreate {
                TerminalRecreateMode::Never if same => Ok(existing),
                TerminalRecreateMode::Never => Err(RegistryError::CommandMismatch {
                    name: existing.name.clone(),
                    existing: existing.command.clone(),
                }),
                TerminalRecreateMode::DifferentCommand if same => Ok(existing),
                _ => self.create(spec, TerminalRecreateMode::Always).await,
            };
        }
        let (target, name) = (spec.target.clone(), spec.name.clone());
        match self.create(spec, recreate).await {
            // Lost a race with another creator; use theirs if it is ready.
            Err(RegistryError::AlreadyExists(n)) => {
                self.get(&target, &name).map_err(|_| RegistryError::AlreadyExists(n))
            }
            other => other,
        }
    }

    pub fn get(&self, target: &Target, name: &str) -> Result<Session, RegistryError> {
        let inner = self.inner.read();
        match inner.slots.get(&(target.clone(), name.to_string())) {
            Some(Slot::Ready(session)) => Ok(session.clone()),
            _ => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    /// All ready terminals matching `filter`, sorted by name then target.
    pub fn sessions(&self, filter: Option<&Target>) -> Vec<Session> {
        let inner = self.inner.read();
        let mut sessions: Vec<Session> = inner
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(s) if filter.map_or(true, |f| f.matches(&s.target)) => Some(s.clone()),
                _ => None,
            })
            .collect();
        drop(inner);
        sessions.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.target.cmp(&b.target)));
        sessions
    }

    pub fn list(&self, filter: Option<&Target>) -> Vec<TerminalSummary> {
        self.sessions(filter).iter().map(Session::summary).collect()
    }

    /// Delete a terminal and wait for its process to die.
    ///
    /// Returns `false` if there was nothing to delete, including a key whose
    /// creation is still in flight.
    pub async fn delete(&self, target: &Target, name: &str) -> bool {
        let key = (target.clone(), name.to_string());
        let removed = {
            let mut inner = self.inner.write();
            match inner.slots.get(&key) {
                Some(Slot::Ready(_)) => match inner.slots.remove(&key) {
                    Some(Slot::Ready(session)) => Some(session),
                    _ => None,
                },
                _ => None,
            }
        };
        let Some(session) = removed else {
            return false;
        };
        self.terminate(&session).await;
        tracing::info!(terminal = %session.name, target = %session.target, "terminal deleted");
        true
    }

    /// Delete every terminal selected by `filter`. Returns how many.
    pub async fn delete_all(&self, filter: &DeleteFilter) -> usize {
        let removed: Vec<Session> = {
            let mut inner = self.inner.write();
            let keys: Vec<SessionKey> = inner
                .slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(s) if filter.selects(s) => Some(key.clone()),
                    _ => None,
                })
                .collect();
            keys.iter()
                .filter_map(|key| match inner.slots.remove(key) {
                    Some(Slot::Ready(s)) => Some(s),
                    _ => None,
                })
                .collect()
        };
        futures::future::join_all(removed.iter().map(|s| self.terminate(s))).await;
        for session in &removed {
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), ?filter, "terminals deleted");
        }
        removed.len()
    }

    /// Kill the process group and wait (bounded) for the child to be reaped.
    async fn terminate(&self, session: &Session) {
        session.cancelled.cancel();
        session.kill_child();
        if tokio::time::timeout(EXIT_WAIT, session.wait_exit()).await.is_err() {
            tracing::warn!(
                terminal = %session.name,
                pid = ?session.pid,
                "terminal process still running after SIGKILL"
            );
        }
        session.clear_history();
    }

    /// Remove all terminals and refuse new ones.
    ///
    /// Called during server shutdown. Sends SIGHUP to each child and returns
    /// a `JoinHandle` for the SIGKILL escalation task if any terminals were
    /// drained, so the caller can await it. Uses a single write lock so
    /// in-flight creates cannot slip in after the snapshot.
    pub fn drain(&self) -> Option<tokio::task::JoinHandle<()>> {
        let sessions: Vec<Session> = {
            let mut inner = self.inner.write();
            inner.closed = true;
            let drained: Vec<Session> = inner
                .slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Ready(s) => Some(s),
                    Slot::Pending => None,
                })
                .collect();
            for session in &drained {
                session.cancelled.cancel();
                session.send_sighup();
            }
            drained
        };
        if sessions.is_empty() {
            return None;
        }
        // Give children 3 seconds to exit from SIGHUP, then escalate to SIGKILL
        Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            for session in &sessions {
                session.kill_child();
            }
        }))
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the terminal once its child exits.
    ///
    /// The slot is only removed if it still holds this same process; a
    /// recreate may already have replaced it.
    fn monitor_child_exit(&self, session: Session) {
        let registry = self.clone();
        tokio::spawn(async move {
            session.wait_exit().await;
            let removed = {
                let mut inner = registry.inner.write();
                let key = session.key();
                match inner.slots.get(&key) {
                    Some(Slot::Ready(current)) if current.same_process(&session) => {
                        inner.slots.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            session.cancelled.cancel();
            if removed {
                tracing::info!(terminal = %session.name, target = %session.target, "terminal process exited");
            }
        });
    }
}
