//! termgate - remote terminals and command execution over HTTP/WebSocket.
//!
//! **Server mode** (`termgate serve`): hosts PTY terminals for the servers,
//! containers, stacks and deployments in its config, and proxies targets
//! that live on remote agents.
//!
//! **Client mode** (every other subcommand): talks to a running server,
//! either interactively (`connect`) or one request at a time.

use anyhow::{bail, Context};
use clap::{Args, Parser as ClapParser, Subcommand};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use termgate::{
    api,
    auth::Credential,
    client::{CloseReason, TerminalClient},
    config::Config,
    lines::Finish,
    protocol::{BatchDeleteAllTerminals, CreateTerminal, ExecuteTerminal},
    target::{ContainerTerminalMode, InitTerminal, Target, TerminalRecreateMode},
    terminal,
};

/// termgate - remote terminals over HTTP/WebSocket
#[derive(ClapParser, Debug)]
#[command(name = "termgate", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server URL for client commands
    #[arg(long, global = true, env = "TERMGATE_URL", default_value = "http://127.0.0.1:8120")]
    url: String,

    /// JWT for client commands
    #[arg(long, global = true, env = "TERMGATE_JWT", hide_env_values = true)]
    jwt: Option<String>,

    /// API key for client commands (with --api-secret)
    #[arg(long, global = true, env = "TERMGATE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// API secret for client commands (with --api-key)
    #[arg(long, global = true, env = "TERMGATE_API_SECRET", hide_env_values = true)]
    api_secret: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the terminal server
    Serve {
        /// Config file (default: the platform config dir)
        #[arg(long, env = "TERMGATE_CONFIG")]
        config: Option<PathBuf>,

        /// Override the configured bind address
        #[arg(long)]
        bind: Option<SocketAddr>,
    },

    /// Open an interactive terminal
    Connect {
        #[command(flatten)]
        target: TargetArgs,

        /// Terminal name (default: derived from the target)
        #[arg(long)]
        terminal: Option<String>,

        #[command(flatten)]
        init: InitArgs,
    },

    /// Run a command and stream its output; exits with the command's code
    Exec {
        #[command(flatten)]
        target: TargetArgs,

        /// Run inside this persistent terminal
        #[arg(long)]
        terminal: Option<String>,

        #[command(flatten)]
        init: InitArgs,

        /// Command to run
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// List terminals
    List {
        #[command(flatten)]
        target: OptionalTargetArgs,
    },

    /// Create a terminal
    Create {
        #[command(flatten)]
        target: TargetArgs,

        /// Terminal name
        #[arg(long)]
        name: String,

        /// Command to run (default: the server's shell)
        #[arg(long)]
        command: Option<String>,

        /// Container terminal mode: exec or attach
        #[arg(long)]
        mode: Option<ContainerTerminalMode>,

        /// Never, Always or DifferentCommand
        #[arg(long, default_value = "Never")]
        recreate: TerminalRecreateMode,

        /// Tag for bulk deletion (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Delete a terminal
    Delete {
        #[command(flatten)]
        target: TargetArgs,

        /// Terminal name
        #[arg(long)]
        terminal: String,
    },

    /// Delete terminals on one or more servers
    DeleteAll {
        /// Server id (repeatable; default: every server)
        #[arg(long = "server")]
        servers: Vec<String>,

        /// Only delete terminals with one of these tags (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct TargetSelector {
    /// Server id
    #[arg(long)]
    server: Option<String>,

    /// Container name (with --server)
    #[arg(long, requires = "server")]
    container: Option<String>,

    /// Stack id
    #[arg(long, conflicts_with_all = ["server", "deployment"])]
    stack: Option<String>,

    /// Stack service (with --stack)
    #[arg(long, requires = "stack")]
    service: Option<String>,

    /// Deployment id
    #[arg(long, conflicts_with_all = ["server", "stack"])]
    deployment: Option<String>,
}

impl TargetSelector {
    fn target(&self) -> Option<Target> {
        let TargetSelector {
            server,
            container,
            stack,
            service,
            deployment,
        } = self.clone();
        match (server, container, stack, deployment) {
            (Some(server), None, _, _) => Some(Target::Server { server }),
            (Some(server), Some(container), _, _) => Some(Target::Container { server, container }),
            (None, _, Some(stack), _) => Some(Target::Stack { stack, service }),
            (None, _, None, Some(deployment)) => Some(Target::Deployment { deployment }),
            (None, _, None, None) => None,
        }
    }
}

#[derive(Args, Debug)]
struct TargetArgs {
    #[command(flatten)]
    selector: TargetSelector,
}

impl TargetArgs {
    fn target(&self) -> anyhow::Result<Target> {
        match self.selector.target() {
            Some(target) => Ok(target),
            None => bail!("a target is required: --server, --stack or --deployment"),
        }
    }
}

#[derive(Args, Debug)]
struct OptionalTargetArgs {
    #[command(flatten)]
    selector: TargetSelector,
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Create the terminal if missing
    #[arg(long)]
    init: bool,

    /// Shell or command for a created terminal (implies --init)
    #[arg(long)]
    shell: Option<String>,

    /// Container terminal mode for a created terminal (implies --init)
    #[arg(long)]
    mode: Option<ContainerTerminalMode>,

    /// Recreate policy for a created terminal (implies --init)
    #[arg(long)]
    recreate: Option<TerminalRecreateMode>,
}

impl InitArgs {
    fn init(&self) -> Option<InitTerminal> {
        if !self.init && self.shell.is_none() && self.mode.is_none() && self.recreate.is_none() {
            return None;
        }
        Some(InitTerminal {
            command: self.shell.clone(),
            recreate: self.recreate.unwrap_or_default(),
            mode: self.mode,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, bind } => {
            init_tracing();
            run_server(config, bind).await
        }
        command => {
            init_tracing_stderr();
            let client = client_from(&cli.url, cli.jwt, cli.api_key, cli.api_secret)?;
            run_client(client, command).await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "termgate=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize tracing with stderr output.
///
/// Client commands print terminal output and exec lines on stdout, so
/// tracing MUST go to stderr. Quiet unless RUST_LOG says otherwise.
fn init_tracing_stderr() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "termgate=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Server mode ────────────────────────────────────────────────────

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let explicit = path.is_some();
    let Some(path) = path.or_else(Config::default_path) else {
        tracing::warn!("no config directory on this platform, using defaults");
        return Ok(Config::default());
    };
    match Config::load(&path)? {
        Some(config) => {
            tracing::info!(path = %path.display(), "loaded config");
            Ok(config)
        }
        None if explicit => bail!("config file {} does not exist", path.display()),
        None => {
            tracing::warn!(path = %path.display(), "no config file, using defaults");
            Ok(Config::default())
        }
    }
}

/// Run the terminal server until Ctrl+C.
async fn run_server(config_path: Option<PathBuf>, bind: Option<SocketAddr>) -> anyhow::Result<()> {
    tracing::info!("termgate server starting");

    let config = load_config(config_path)?;
    if config.users.is_empty() {
        tracing::warn!("no users configured, every request will be rejected");
    }
    let bind = bind.unwrap_or(config.server.bind);

    let state = api::AppState::from_config(&config);
    let shutdown = state.shutdown.clone();
    let registry = state.registry().clone();
    let app = api::router(
        state,
        api::RouterConfig {
            rate_limit: config.server.rate_limit,
        },
    );

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %bind, "HTTP/WS server listening");

    // Oneshot channel for server shutdown
    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let http_handle = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            server_shutdown_rx.await.ok();
        })
        .await;
        if let Err(e) = result {
            tracing::error!(?e, "HTTP server error");
        }
    });

    tracing::info!("termgate server ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(?e, "failed to listen for Ctrl+C");
    }
    tracing::info!("received Ctrl+C");

    // Signal WebSocket handlers to send close frames
    shutdown.shutdown();
    // Give handlers a moment to flush close frames before stopping the server
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let _ = server_shutdown_tx.send(());

    // Wait for HTTP server to stop
    if let Err(e) = http_handle.await {
        tracing::warn!(?e, "HTTP server task panicked");
    }

    // Hang up every terminal, escalating to SIGKILL for stragglers
    if let Some(escalation) = registry.drain() {
        let _ = escalation.await;
    }

    tracing::info!("termgate server exiting");
    Ok(())
}

// ── Client mode ────────────────────────────────────────────────────

fn client_from(
    url: &str,
    jwt: Option<String>,
    api_key: Option<String>,
    api_secret: Option<String>,
) -> anyhow::Result<TerminalClient> {
    let credential = match (api_key, api_secret, jwt) {
        (Some(key), Some(secret), _) => Credential::api_keys(key, secret),
        (_, _, Some(jwt)) => Credential::jwt(jwt),
        _ => bail!("credentials required: --jwt, or --api-key with --api-secret"),
    };
    Ok(TerminalClient::new(url, credential))
}

async fn run_client(client: TerminalClient, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve { .. } => bail!("serve is not a client command"),
        Commands::Connect { target, terminal, init } => {
            run_connect(&client, target.target()?, terminal, init.init()).await
        }
        Commands::Exec {
            target,
            terminal,
            init,
            command,
        } => {
            let request = ExecuteTerminal {
                target: target.target()?,
                terminal,
                command: command.join(" "),
                init: init.init(),
            };
            run_exec(&client, &request).await
        }
        Commands::List { target } => run_list(&client, target.selector.target()).await,
        Commands::Create {
            target,
            name,
            command,
            mode,
            recreate,
            tags,
        } => {
            let request = CreateTerminal {
                name,
                target: target.target()?,
                command,
                mode,
                recreate,
                tags,
            };
            let summary = client.create_terminal(&request).await?;
            println!("created {} ({}) on {}", summary.name, summary.command, summary.target);
            Ok(())
        }
        Commands::Delete { target, terminal } => {
            let target = target.target()?;
            if client.delete_terminal(&target, &terminal).await? {
                println!("deleted {terminal}");
            } else {
                println!("no terminal named {terminal} on {target}");
            }
            Ok(())
        }
        Commands::DeleteAll { servers, tags } => {
            let deleted = match (servers.as_slice(), tags.is_empty()) {
                ([server], true) => client.delete_all_terminals(server).await?,
                _ => {
                    client
                        .batch_delete_all_terminals(&BatchDeleteAllTerminals { servers, tags })
                        .await?
                }
            };
            println!("deleted {deleted} terminal(s)");
            Ok(())
        }
    }
}

async fn run_connect(
    client: &TerminalClient,
    target: Target,
    terminal: Option<String>,
    init: Option<InitTerminal>,
) -> anyhow::Result<()> {
    let connection = client
        .connect_terminal(&target, terminal.as_deref(), init.as_ref())
        .await
        .with_context(|| format!("failed to open terminal on {target}"))?;
    let reason = terminal::run_interactive(connection).await?;
    match reason {
        CloseReason::Clean(Some(reason)) => eprintln!("\r\n[termgate: {reason}]"),
        CloseReason::Clean(None) => eprintln!("\r\n[termgate: connection closed]"),
        CloseReason::Error(e) => bail!("connection lost: {e}"),
    }
    Ok(())
}

async fn run_exec(client: &TerminalClient, request: &ExecuteTerminal) -> anyhow::Result<()> {
    let mut finish = Finish::EarlyExit;
    let stdout = std::io::stdout();
    client
        .execute(
            request,
            |line| {
                let mut out = stdout.lock();
                let _ = writeln!(out, "{line}");
            },
            |f| finish = f,
        )
        .await?;
    match finish {
        Finish::ExitCode(code) => {
            let code: i32 = code.parse().unwrap_or(1);
            std::process::exit(code);
        }
        Finish::EarlyExit => {
            eprintln!("termgate: {}", Finish::EarlyExit);
            std::process::exit(1);
        }
    }
}

async fn run_list(client: &TerminalClient, target: Option<Target>) -> anyhow::Result<()> {
    let terminals = client.list_terminals(target.as_ref()).await?;
    if terminals.is_empty() {
        println!("No terminals.");
        return Ok(());
    }
    println!(
        "{:<20} {:<32} {:<20} {:<10} {}",
        "NAME", "TARGET", "COMMAND", "SIZE", "ATTACHED"
    );
    for t in &terminals {
        println!(
            "{:<20} {:<32} {:<20} {:<10} {}",
            t.name,
            t.target.to_string(),
            t.command,
            format!("{:.1}K", t.stored_size_kb),
            if t.attached { "yes" } else { "no" }
        );
    }
    Ok(())
}
