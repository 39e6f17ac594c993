//! Routes terminal operations to the local registry or to the remote agent
//! that owns the target, and enforces the host's terminal policy.

use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;

use crate::client::{ClientError, TerminalClient};
use crate::config::ServerSettings;
use crate::exec;
use crate::protocol::{BatchDeleteAllTerminals, CreateTerminal, ExecuteTerminal, TerminalSummary};
use crate::resolver::{
    default_terminal_name, terminal_command, Endpoint, ResolveError, ResolvedTarget, TargetResolver,
};
use crate::session::{DeleteFilter, InputClosed, RegistryError, Session, SessionRegistry, SessionSpec};
use crate::target::{InitTerminal, Target, TargetError};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Invalid(#[from] TargetError),

    #[error("{0}")]
    Disabled(&'static str),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    InputClosed(#[from] InputClosed),

    #[error(transparent)]
    Remote(#[from] ClientError),
}

/// Host policy for terminals.
#[derive(Debug, Clone)]
pub struct TerminalSettings {
    /// Command for host terminals created without one.
    pub default_shell: String,
    pub disable_terminals: bool,
    pub disable_container_terminals: bool,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            default_shell: "sh".to_string(),
            disable_terminals: false,
            disable_container_terminals: false,
        }
    }
}

impl From<&ServerSettings> for TerminalSettings {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            default_shell: settings.default_shell.clone(),
            disable_terminals: settings.disable_terminals,
            disable_container_terminals: settings.disable_container_terminals,
        }
    }
}

/// Where an operation on a target is carried out.
pub enum Route {
    Local(ResolvedTarget),
    Remote(TerminalClient),
}

/// Lines of exec output, local or proxied.
pub type LineStream = BoxStream<'static, Result<String, ClientError>>;

#[derive(Clone)]
pub struct Dispatcher {
    registry: SessionRegistry,
    resolver: Arc<dyn TargetResolver>,
    settings: Arc<TerminalSettings>,
}

impl Dispatcher {
    pub fn new(registry: SessionRegistry, resolver: Arc<dyn TargetResolver>, settings: TerminalSettings) -> Self {
        Self {
            registry,
            resolver,
            settings: Arc::new(settings),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &TerminalSettings {
        &self.settings
    }

    /// Resolve `target` and decide who serves it.
    pub fn route(&self, target: &Target) -> Result<Route, DispatchError> {
        let resolved = self.resolver.resolve(target)?;
        Ok(into_route(resolved))
    }

    fn check_enabled(&self, resolved: &ResolvedTarget) -> Result<(), DispatchError> {
        if self.settings.disable_terminals {
            return Err(DispatchError::Disabled("terminals are disabled on this host"));
        }
        if resolved.container.is_some() && self.settings.disable_container_terminals {
            return Err(DispatchError::Disabled("container terminals are disabled on this host"));
        }
        Ok(())
    }

    fn session_spec(
        &self,
        target: &Target,
        resolved: &ResolvedTarget,
        name: String,
        init: &InitTerminal,
        tags: Vec<String>,
    ) -> Result<SessionSpec, DispatchError> {
        self.check_enabled(resolved)?;
        let command = terminal_command(resolved, init, &self.settings.default_shell)?;
        Ok(SessionSpec {
            target: target.clone(),
            name,
            server: resolved.server.clone(),
            command,
            tags,
        })
    }

    /// Find (or, with `init`, create) a terminal in the local registry.
    pub async fn open_local(
        &self,
        target: &Target,
        resolved: &ResolvedTarget,
        name: Option<&str>,
        init: Option<&InitTerminal>,
    ) -> Result<Session, DispatchError> {
        self.check_enabled(resolved)?;
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| default_terminal_name(target, init));
        match init {
            Some(init) => {
                let spec = self.session_spec(target, resolved, name, init, Vec::new())?;
                Ok(self.registry.get_or_create(spec, init.recreate).await?)
            }
            None => Ok(self.registry.get(target, &name)?),
        }
    }

    pub async fn create(&self, request: &CreateTerminal) -> Result<TerminalSummary, DispatchError> {
        let resolved = match self.route(&request.target)? {
            Route::Remote(client) => return Ok(client.create_terminal(request).await?),
            Route::Local(resolved) => resolved,
        };
        let init = InitTerminal {
            command: request.command.clone(),
            recreate: request.recreate,
            mode: request.mode,
        };
        let spec = self.session_spec(
            &request.target,
            &resolved,
            request.name.clone(),
            &init,
            request.tags.clone(),
        )?;
        let session = self.registry.create(spec, request.recreate).await?;
        Ok(session.summary())
    }

    /// Delete one terminal. `false` if it did not exist.
    pub async fn delete(&self, target: &Target, name: &str) -> Result<bool, DispatchError> {
        match self.route(target)? {
            Route::Local(_) => Ok(self.registry.delete(target, name).await),
            Route::Remote(client) => Ok(client.delete_terminal(target, name).await?),
        }
    }

    /// Delete every terminal on `server`. Returns how many.
    pub async fn delete_all(&self, server: &str) -> Result<usize, DispatchError> {
        match self.route(&Target::server(server))? {
            Route::Local(resolved) => Ok(self
                .registry
                .delete_all(&DeleteFilter::server(resolved.server))
                .await),
            Route::Remote(client) => Ok(client.delete_all_terminals(server).await?),
        }
    }

    /// Delete terminals on each listed server (every known server when the
    /// list is empty), keeping only those with one of `tags` if any given.
    pub async fn batch_delete(&self, request: &BatchDeleteAllTerminals) -> Result<usize, DispatchError> {
        let servers = if request.servers.is_empty() {
            self.resolver.servers()
        } else {
            request.servers.clone()
        };
        let mut deleted = 0;
        for server in servers {
            deleted += match self.route(&Target::server(&server))? {
                Route::Local(resolved) => {
                    let filter = DeleteFilter {
                        server: Some(resolved.server),
                        target: None,
                        tags: request.tags.clone(),
                    };
                    self.registry.delete_all(&filter).await
                }
                Route::Remote(client) => {
                    let forwarded = BatchDeleteAllTerminals {
                        servers: vec![server.clone()],
                        tags: request.tags.clone(),
                    };
                    client.batch_delete_all_terminals(&forwarded).await?
                }
            };
        }
        Ok(deleted)
    }

    /// Terminals matching `filter`. With no filter, only this host's.
    pub async fn list(&self, filter: Option<&Target>) -> Result<Vec<TerminalSummary>, DispatchError> {
        let Some(filter) = filter else {
            return Ok(self.registry.list(None));
        };
        match into_route(self.resolver.locate(filter)?) {
            Route::Local(_) => Ok(self.registry.list(Some(filter))),
            Route::Remote(client) => Ok(client.list_terminals(Some(filter)).await?),
        }
    }

    /// Start a command and return its output lines.
    pub async fn execute(&self, request: &ExecuteTerminal) -> Result<LineStream, DispatchError> {
        let resolved = match self.route(&request.target)? {
            Route::Remote(client) => return Ok(client.execute_stream(request).await?.boxed()),
            Route::Local(resolved) => resolved,
        };
        let rx = match &request.terminal {
            None => {
                self.check_enabled(&resolved)?;
                let cmd = exec::oneshot_command(&resolved, request.init.as_ref(), &request.command)?;
                exec::spawn_oneshot(cmd).map_err(DispatchError::Spawn)?
            }
            Some(name) => {
                let session = self
                    .open_local(&request.target, &resolved, Some(name), request.init.as_ref())
                    .await?;
                exec::in_session(&session, &request.command).await?
            }
        };
        tracing::info!(target = %request.target, terminal = ?request.terminal, "executing command");
        Ok(ReceiverStream::new(rx).map(Ok).boxed())
    }
}

fn into_route(resolved: ResolvedTarget) -> Route {
    match resolved.endpoint {
        Endpoint::Local => Route::Local(resolved),
        Endpoint::Remote { address, credential } => Route::Remote(TerminalClient::new(address, credential)),
    }
}
