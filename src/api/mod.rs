pub mod auth;
pub mod error;
mod handlers;
mod ws;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue},
    routing::{get, post},
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::sync::Arc;
use std::time::Duration;

use crate::auth::{Authenticator, PermissionChecker, StaticAuth};
use crate::config::Config;
use crate::dispatch::{Dispatcher, TerminalSettings};
use crate::resolver::StaticResolver;
use crate::session::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;

use handlers::*;
use ws::*;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub auth: Arc<dyn Authenticator>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub shutdown: ShutdownCoordinator,
    /// How long an upgraded terminal socket may take to log in.
    pub login_timeout: Duration,
}

impl AppState {
    /// State for a server running from `config`: config users for auth, the
    /// config inventory for target resolution.
    pub fn from_config(config: &Config) -> Self {
        let users = Arc::new(StaticAuth::new(config.users.clone()));
        Self {
            dispatcher: Dispatcher::new(
                SessionRegistry::with_limits(config.registry_limits()),
                Arc::new(StaticResolver::from_config(config)),
                TerminalSettings::from(&config.server),
            ),
            auth: users.clone(),
            permissions: users,
            shutdown: ShutdownCoordinator::new(),
            login_timeout: config.login_timeout(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        self.dispatcher.registry()
    }
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a setup without rate limiting.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Requests per second per peer IP. Requires the router to be served
    /// with `into_make_service_with_connect_info::<SocketAddr>()`.
    pub rate_limit: Option<u32>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let authenticator = state.auth.clone();
    let terminal_routes = Router::new()
        .route("/terminal/create", post(create_terminal))
        .route("/terminal/delete", post(delete_terminal))
        .route("/terminal/delete_all", post(delete_all_terminals))
        .route("/terminal/batch_delete_all", post(batch_delete_all_terminals))
        .route("/terminal/list", post(list_terminals))
        .route("/terminal/execute", post(execute_terminal))
        .layer(axum::middleware::from_fn(move |req, next| {
            let a = Arc::clone(&authenticator);
            async move { auth::require_auth(a, req, next).await }
        }));

    // Sockets authenticate with their first message, not with headers.
    let socket_routes = Router::new()
        .route("/ws/server/{server}/terminal", get(ws_server_terminal))
        .route("/ws/container/{server}/{container}/terminal", get(ws_container_terminal))
        .route("/ws/stack/{stack}/{service}/terminal", get(ws_stack_terminal))
        .route("/ws/deployment/{deployment}/terminal", get(ws_deployment_terminal));

    let protected = terminal_routes.merge(socket_routes).with_state(state);

    // Apply rate limiting to the protected routes if configured.
    let protected = match config.rate_limit {
        Some(rps) => {
            use tower_governor::{
                governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorLayer,
            };
            let governor_conf = GovernorConfigBuilder::default()
                .per_second(u64::from(rps))
                .burst_size(rps)
                .key_extractor(PeerIpKeyExtractor)
                .finish();
            match governor_conf {
                Some(conf) => protected.layer(GovernorLayer::new(Arc::new(conf))),
                None => {
                    tracing::warn!(rps, "invalid rate limit, serving without one");
                    protected
                }
            }
        }
        None => protected,
    };

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("permissions-policy"),
            HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
        ))
}
