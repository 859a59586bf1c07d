//! # Server Configuration
//!
//! Router construction, shared state and the serve loop with graceful shutdown.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, middleware, routing::get};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::browser::{ChromeLauncher, LaunchOptions, SessionManager};
use crate::config::AppConfig;
use crate::credentials::DomainPolicy;
use crate::flow::{FlowPolicy, LoginFlow};
use crate::handlers;
use crate::oauth::SalesforceCoordinator;
use crate::telemetry;

/// In-flight flows get this long to finish after a shutdown signal before they are dropped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub flow: Arc<LoginFlow>,
    pub domain_policy: Arc<DomainPolicy>,
}

impl AppState {
    /// Wires the production collaborators: local Chrome and the Salesforce connected app.
    pub fn from_config(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let domain_policy = DomainPolicy::new(&config.provider.domain)
            .map_err(|e| format!("Invalid provider domain: {}", e))?;

        let sessions = Arc::new(SessionManager::new(
            Arc::new(ChromeLauncher::new()),
            LaunchOptions::for_container(&config.browser),
            config.browser.max_concurrent_sessions,
        ));
        let capture = Arc::new(SalesforceCoordinator::new(&config.provider)?);
        let flow = LoginFlow::new(sessions, capture, FlowPolicy::from(&config.flow));

        Ok(Self {
            config: Arc::new(config),
            flow: Arc::new(flow),
            domain_policy: Arc::new(domain_policy),
        })
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route(
            "/auth",
            get(handlers::get_auth).post(handlers::post_auth),
        )
        .route(
            "/sfdxauthurl",
            get(handlers::get_sfdx_auth_url).post(handlers::post_sfdx_auth_url),
        )
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(telemetry::trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Starts the server with the given configuration
pub async fn run_server(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config
        .socket_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;
    let profile = config.profile.clone();

    let state = AppState::from_config(config)?;
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, %profile, "server listening");

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_shutdown_signals(shutdown.clone()));

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();

    tokio::select! {
        result = server => result?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            warn!(grace = ?SHUTDOWN_GRACE, "shutdown grace period elapsed; dropping in-flight flows");
        }
    }

    info!("server stopped");
    Ok(())
}

async fn watch_shutdown_signals(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
    token.cancel();
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::auth::post_auth,
        crate::handlers::auth::get_auth,
        crate::handlers::auth::post_sfdx_auth_url,
        crate::handlers::auth::get_sfdx_auth_url,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::HealthStatus,
            crate::models::AuthRequest,
            crate::models::AuthPayload,
            crate::models::AuthResponse,
            crate::error::ErrorBody,
        )
    ),
    tags(
        (name = "root", description = "Service metadata"),
        (name = "auth", description = "Automated org login"),
    ),
    info(
        title = "Salesforce Auto OAuth API",
        description = "Automates the Salesforce login form in a headless browser and returns the captured org authorization",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
