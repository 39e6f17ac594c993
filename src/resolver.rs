//! Target resolution: which host a terminal runs on, and whether it runs
//! inside a container there.

use std::collections::HashMap;
use thiserror::Error;

use crate::auth::Credential;
use crate::config::{Config, DeploymentEntry, ServerEntry, StackEntry};
use crate::pty::CommandLine;
use crate::target::{container_name, no_chaining, ContainerTerminalMode, InitTerminal, Target, TargetError};

/// Where requests for a resolved target are served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// This process's own registry.
    Local,
    /// Another agent speaking the same protocol.
    Remote { address: String, credential: Credential },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub server: String,
    pub endpoint: Endpoint,
    /// Container to exec into or attach to, for container-shaped targets.
    pub container: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error(transparent)]
    Invalid(#[from] TargetError),
    #[error("server '{0}' not found")]
    ServerNotFound(String),
    #[error("stack '{0}' not found")]
    StackNotFound(String),
    #[error("service '{service}' not found in stack '{stack}'")]
    ServiceNotFound { stack: String, service: String },
    #[error("deployment '{0}' not found")]
    DeploymentNotFound(String),
}

/// The resource layer, as seen by terminals.
pub trait TargetResolver: Send + Sync {
    /// Validate `target` and look it up. Validation failures are reported
    /// before any lookup.
    fn resolve(&self, target: &Target) -> Result<ResolvedTarget, ResolveError>;

    /// Like [`resolve`](Self::resolve) for a listing filter: a stack
    /// without a service locates the stack's server, with no container.
    fn locate(&self, filter: &Target) -> Result<ResolvedTarget, ResolveError>;

    /// Ids of every known server.
    fn servers(&self) -> Vec<String>;
}

/// Resolver over the inventory in the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    servers: HashMap<String, ServerEntry>,
    stacks: HashMap<String, StackEntry>,
    deployments: HashMap<String, DeploymentEntry>,
}

impl StaticResolver {
    pub fn from_config(config: &Config) -> Self {
        Self {
            servers: config.servers.iter().map(|s| (s.id.clone(), s.clone())).collect(),
            stacks: config.stacks.iter().map(|s| (s.id.clone(), s.clone())).collect(),
            deployments: config
                .deployments
                .iter()
                .map(|d| (d.id.clone(), d.clone()))
                .collect(),
        }
    }

    fn on_server(&self, server: &str, container: Option<String>) -> Result<ResolvedTarget, ResolveError> {
        let entry = self
            .servers
            .get(server)
            .ok_or_else(|| ResolveError::ServerNotFound(server.to_string()))?;
        let endpoint = if entry.is_local() {
            Endpoint::Local
        } else {
            Endpoint::Remote {
                address: entry.address.clone(),
                credential: Credential::api_keys(
                    entry.key.clone().unwrap_or_default(),
                    entry.secret.clone().unwrap_or_default(),
                ),
            }
        };
        Ok(ResolvedTarget {
            server: entry.id.clone(),
            endpoint,
            container,
        })
    }
}

impl TargetResolver for StaticResolver {
    fn resolve(&self, target: &Target) -> Result<ResolvedTarget, ResolveError> {
        target.validate()?;
        match target {
            Target::Server { server } => self.on_server(server, None),
            Target::Container { server, container } => self.on_server(server, Some(container.clone())),
            Target::Stack { stack, service } => {
                let service = service.as_deref().ok_or(TargetError::MissingService)?;
                let entry = self
                    .stacks
                    .get(stack)
                    .ok_or_else(|| ResolveError::StackNotFound(stack.clone()))?;
                let container = entry.services.get(service).ok_or_else(|| {
                    ResolveError::ServiceNotFound {
                        stack: stack.clone(),
                        service: service.to_string(),
                    }
                })?;
                self.on_server(&entry.server, Some(container.clone()))
            }
            Target::Deployment { deployment } => {
                let entry = self
                    .deployments
                    .get(deployment)
                    .ok_or_else(|| ResolveError::DeploymentNotFound(deployment.clone()))?;
                let container = entry.container.clone().unwrap_or_else(|| entry.id.clone());
                self.on_server(&entry.server, Some(container))
            }
        }
    }

    fn locate(&self, filter: &Target) -> Result<ResolvedTarget, ResolveError> {
        filter.validate_filter()?;
        match filter {
            Target::Stack { stack, service: None } => {
                let entry = self
                    .stacks
                    .get(stack)
                    .ok_or_else(|| ResolveError::StackNotFound(stack.clone()))?;
                self.on_server(&entry.server, None)
            }
            _ => self.resolve(filter),
        }
    }

    fn servers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.servers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Command line for a persistent terminal on `resolved`.
///
/// Server terminals run `init.command` or the default shell through the
/// host shell. Container terminals either exec a shell in the container
/// (`sh` unless `init.command` names another) or attach to its main
/// process; both are spawned as argument vectors, never through a shell.
pub fn terminal_command(
    resolved: &ResolvedTarget,
    init: &InitTerminal,
    default_shell: &str,
) -> Result<CommandLine, TargetError> {
    let Some(container) = &resolved.container else {
        return Ok(CommandLine::shell(
            init.command.clone().unwrap_or_else(|| default_shell.to_string()),
        ));
    };
    container_name(container)?;
    match init.mode.unwrap_or_default() {
        ContainerTerminalMode::Exec => {
            let shell = init.command.as_deref().unwrap_or("sh");
            no_chaining(shell, "command")?;
            let mut argv = vec!["docker", "exec", "-it", container.as_str()];
            argv.extend(shell.split_whitespace());
            Ok(CommandLine::argv(argv))
        }
        ContainerTerminalMode::Attach => Ok(CommandLine::argv([
            "docker",
            "attach",
            container.as_str(),
            "--sig-proxy=false",
        ])),
    }
}

/// Name used when a caller opens a terminal without naming it.
pub fn default_terminal_name(target: &Target, init: Option<&InitTerminal>) -> String {
    let command = init.and_then(|i| i.command.as_deref());
    let raw = match target {
        Target::Server { .. } => command.unwrap_or("term").to_string(),
        _ => {
            if let Some(command) = command {
                command.to_string()
            } else if let Some(mode) = init.and_then(|i| i.mode) {
                mode.as_str().to_string()
            } else {
                match target {
                    Target::Container { container, .. } => container.clone(),
                    Target::Stack { service: Some(service), .. } => service.clone(),
                    Target::Stack { stack, service: None } => stack.clone(),
                    Target::Deployment { deployment } => deployment.clone(),
                    Target::Server { .. } => "term".to_string(),
                }
            }
        }
    };
    sanitize_name(&raw)
}

/// Map anything that is not a valid terminal-name character to `-`.
fn sanitize_name(raw: &str) -> String {
    let name: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .take(64)
        .collect();
    if name.is_empty() {
        "term".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> StaticResolver {
        let config: Config = toml::from_str(
            r#"
            [[servers]]
            id = "local"

            [[servers]]
            id = "edge"
            address = "http://10.0.0.5:8120"
            key = "k"
            secret = "s"

            [[stacks]]
            id = "app"
            server = "edge"
            services = { web = "app-web-1" }

            [[deployments]]
            id = "api"
            server = "local"

            [[deployments]]
            id = "worker"
            server = "local"
            container = "worker-blue"
        "#,
        )
        .unwrap();
        StaticResolver::from_config(&config)
    }

    #[test]
    fn resolves_each_target_shape() {
        let r = resolver();
        let server = r.resolve(&Target::server("local")).unwrap();
        assert_eq!(server.endpoint, Endpoint::Local);
        assert_eq!(server.container, None);

        let container = r.resolve(&Target::container("local", "redis")).unwrap();
        assert_eq!(container.container.as_deref(), Some("redis"));

        let stack = r.resolve(&Target::stack_service("app", "web")).unwrap();
        assert_eq!(stack.server, "edge");
        assert_eq!(stack.container.as_deref(), Some("app-web-1"));
        assert_eq!(
            stack.endpoint,
            Endpoint::Remote {
                address: "http://10.0.0.5:8120".into(),
                credential: Credential::api_keys("k", "s"),
            }
        );

        assert_eq!(
            r.resolve(&Target::deployment("api")).unwrap().container.as_deref(),
            Some("api")
        );
        assert_eq!(
            r.resolve(&Target::deployment("worker")).unwrap().container.as_deref(),
            Some("worker-blue")
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let r = resolver();
        let target = Target::stack_service("app", "web");
        assert_eq!(r.resolve(&target), r.resolve(&target));
    }

    #[test]
    fn validation_runs_before_lookup() {
        let r = resolver();
        // Unknown stack, but the missing service is reported first.
        assert_eq!(
            r.resolve(&Target::Stack { stack: "nope".into(), service: None }),
            Err(ResolveError::Invalid(TargetError::MissingService))
        );
        assert_eq!(
            r.resolve(&Target::server("")),
            Err(ResolveError::Invalid(TargetError::EmptyField("server")))
        );
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let r = resolver();
        assert_eq!(r.resolve(&Target::server("ghost")), Err(ResolveError::ServerNotFound("ghost".into())));
        assert!(matches!(
            r.resolve(&Target::stack_service("app", "db")),
            Err(ResolveError::ServiceNotFound { .. })
        ));
        assert!(matches!(
            r.resolve(&Target::deployment("ghost")),
            Err(ResolveError::DeploymentNotFound(_))
        ));
    }

    #[test]
    fn locate_accepts_whole_stack_filters() {
        let r = resolver();
        let whole = Target::Stack { stack: "app".into(), service: None };
        let located = r.locate(&whole).unwrap();
        assert_eq!(located.server, "edge");
        assert_eq!(located.container, None);
        assert_eq!(r.locate(&Target::server("local")).unwrap().endpoint, Endpoint::Local);
        assert!(matches!(
            r.locate(&Target::Stack { stack: "nope".into(), service: None }),
            Err(ResolveError::StackNotFound(_))
        ));
    }

    #[test]
    fn lists_servers_sorted() {
        assert_eq!(resolver().servers(), vec!["edge", "local"]);
    }

    #[test]
    fn builds_server_and_container_commands() {
        let local = ResolvedTarget {
            server: "local".into(),
            endpoint: Endpoint::Local,
            container: None,
        };
        assert_eq!(
            terminal_command(&local, &InitTerminal::default(), "bash").unwrap(),
            CommandLine::shell("bash")
        );
        let init = InitTerminal { command: Some("htop".into()), ..Default::default() };
        assert_eq!(terminal_command(&local, &init, "bash").unwrap(), CommandLine::shell("htop"));

        let in_container = ResolvedTarget { container: Some("web".into()), ..local };
        assert_eq!(
            terminal_command(&in_container, &InitTerminal::default(), "bash").unwrap(),
            CommandLine::argv(["docker", "exec", "-it", "web", "sh"])
        );
        let bash = InitTerminal { command: Some("bash -l".into()), ..Default::default() };
        assert_eq!(
            terminal_command(&in_container, &bash, "sh").unwrap(),
            CommandLine::argv(["docker", "exec", "-it", "web", "bash", "-l"])
        );
        let attach = InitTerminal {
            mode: Some(ContainerTerminalMode::Attach),
            ..Default::default()
        };
        assert_eq!(
            terminal_command(&in_container, &attach, "sh").unwrap().to_string(),
            "docker attach web --sig-proxy=false"
        );
    }

    #[test]
    fn rejects_chained_container_commands() {
        let in_container = ResolvedTarget {
            server: "local".into(),
            endpoint: Endpoint::Local,
            container: Some("web".into()),
        };
        let init = InitTerminal { command: Some("sh && rm -rf /".into()), ..Default::default() };
        assert_eq!(
            terminal_command(&in_container, &init, "sh"),
            Err(TargetError::Chained("command"))
        );
    }

    #[test]
    fn container_names_from_inventory_are_checked() {
        let injected = ResolvedTarget {
            server: "local".into(),
            endpoint: Endpoint::Local,
            container: Some("x;touch /tmp/owned #".into()),
        };
        assert_eq!(
            terminal_command(&injected, &InitTerminal::default(), "sh"),
            Err(TargetError::InvalidContainerName("x;touch /tmp/owned #".into()))
        );
    }

    #[test]
    fn default_names() {
        assert_eq!(default_terminal_name(&Target::server("a"), None), "term");
        let htop = InitTerminal { command: Some("htop".into()), ..Default::default() };
        assert_eq!(default_terminal_name(&Target::server("a"), Some(&htop)), "htop");
        assert_eq!(default_terminal_name(&Target::container("a", "web"), None), "web");
        let attach = InitTerminal {
            mode: Some(ContainerTerminalMode::Attach),
            ..Default::default()
        };
        assert_eq!(default_terminal_name(&Target::deployment("api"), Some(&attach)), "attach");
        let spaced = InitTerminal { command: Some("bash -l".into()), ..Default::default() };
        assert_eq!(default_terminal_name(&Target::server("a"), Some(&spaced)), "bash--l");
    }
}
