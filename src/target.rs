//! Logical terminal targets and the init options that travel with them.
//!
//! A [`Target`] names *where* a terminal lives: a server's host shell, a
//! container on a server, one service of a stack, or a deployment. The
//! resource layer turns it into a concrete host (see `resolver`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("stack target requires a service")]
    MissingService,

    #[error("'&&' is not allowed in {0}")]
    Chained(&'static str),

    #[error("invalid container name '{0}'")]
    InvalidContainerName(String),
}

/// Where a terminal runs.
///
/// Serialized as `{"type": "Server", "params": {"server": "..."}}` so the
/// same shape is used in request bodies and in listings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum Target {
    Server {
        server: String,
    },
    Container {
        server: String,
        container: String,
    },
    Stack {
        stack: String,
        /// `None` is only meaningful as a listing filter.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<String>,
    },
    Deployment {
        deployment: String,
    },
}

impl Target {
    pub fn server(server: impl Into<String>) -> Self {
        Target::Server { server: server.into() }
    }

    pub fn container(server: impl Into<String>, container: impl Into<String>) -> Self {
        Target::Container {
            server: server.into(),
            container: container.into(),
        }
    }

    pub fn stack_service(stack: impl Into<String>, service: impl Into<String>) -> Self {
        Target::Stack {
            stack: stack.into(),
            service: Some(service.into()),
        }
    }

    pub fn deployment(deployment: impl Into<String>) -> Self {
        Target::Deployment {
            deployment: deployment.into(),
        }
    }

    /// Short lowercase name of the variant, used in paths and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Target::Server { .. } => "server",
            Target::Container { .. } => "container",
            Target::Stack { .. } => "stack",
            Target::Deployment { .. } => "deployment",
        }
    }

    /// Check that the target can be operated on: every identifier present
    /// and non-empty, and a stack target names its service.
    pub fn validate(&self) -> Result<(), TargetError> {
        self.validate_filter()?;
        if let Target::Stack { service: None, .. } = self {
            return Err(TargetError::MissingService);
        }
        Ok(())
    }

    /// Like [`validate`](Self::validate) but allows a stack without a
    /// service, which matches every service of that stack.
    pub fn validate_filter(&self) -> Result<(), TargetError> {
        match self {
            Target::Server { server } => non_empty(server, "server"),
            Target::Container { server, container } => {
                non_empty(server, "server")?;
                non_empty(container, "container")?;
                container_name(container)
            }
            Target::Stack { stack, service } => {
                non_empty(stack, "stack")?;
                match service {
                    Some(service) => non_empty(service, "service"),
                    None => Ok(()),
                }
            }
            Target::Deployment { deployment } => non_empty(deployment, "deployment"),
        }
    }

    /// Whether a session bound to `other` is selected by `self` used as a
    /// listing filter.
    pub fn matches(&self, other: &Target) -> bool {
        match (self, other) {
            (Target::Stack { stack, service: None }, Target::Stack { stack: s, .. }) => stack == s,
            _ => self == other,
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Server { server } => write!(f, "server:{server}"),
            Target::Container { server, container } => write!(f, "container:{server}/{container}"),
            Target::Stack { stack, service: Some(service) } => write!(f, "stack:{stack}/{service}"),
            Target::Stack { stack, service: None } => write!(f, "stack:{stack}/*"),
            Target::Deployment { deployment } => write!(f, "deployment:{deployment}"),
        }
    }
}

fn non_empty(value: &str, field: &'static str) -> Result<(), TargetError> {
    if value.trim().is_empty() {
        Err(TargetError::EmptyField(field))
    } else {
        Ok(())
    }
}

/// Docker's container name charset: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
pub(crate) fn container_name(value: &str) -> Result<(), TargetError> {
    no_chaining(value, "container name")?;
    let mut chars = value.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(TargetError::InvalidContainerName(value.to_string()))
    }
}

pub(crate) fn no_chaining(value: &str, field: &'static str) -> Result<(), TargetError> {
    if value.contains("&&") {
        Err(TargetError::Chained(field))
    } else {
        Ok(())
    }
}

/// How a terminal on a container-shaped target talks to the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerTerminalMode {
    /// Start a new shell process inside the container.
    #[default]
    Exec,
    /// Attach to the container's main process.
    Attach,
}

impl ContainerTerminalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerTerminalMode::Exec => "exec",
            ContainerTerminalMode::Attach => "attach",
        }
    }
}

impl std::fmt::Display for ContainerTerminalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContainerTerminalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exec" => Ok(ContainerTerminalMode::Exec),
            "attach" => Ok(ContainerTerminalMode::Attach),
            other => Err(format!("unknown container terminal mode: {other}")),
        }
    }
}

/// What to do when a terminal with the requested name already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminalRecreateMode {
    /// Keep the existing terminal.
    #[default]
    Never,
    /// Always kill the existing terminal and start a fresh one.
    Always,
    /// Replace the existing terminal only if its command differs.
    DifferentCommand,
}

impl TerminalRecreateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalRecreateMode::Never => "Never",
            TerminalRecreateMode::Always => "Always",
            TerminalRecreateMode::DifferentCommand => "DifferentCommand",
        }
    }
}

impl std::str::FromStr for TerminalRecreateMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "never" => Ok(TerminalRecreateMode::Never),
            "always" => Ok(TerminalRecreateMode::Always),
            "differentcommand" => Ok(TerminalRecreateMode::DifferentCommand),
            other => Err(format!("unknown recreate mode: {other}")),
        }
    }
}

/// Options for creating the terminal on first use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitTerminal {
    /// Shell or command to run. Defaults to the configured shell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub recreate: TerminalRecreateMode,
    /// Only meaningful for container-shaped targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ContainerTerminalMode>,
}
