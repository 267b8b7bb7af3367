//! The agent's HTTP surface over a Unix-domain socket.
//!
//! Every handler authenticates the connection's peer credentials, checks
//! the required permissions against the caller's claimed roles, and charges
//! the per-principal rate limiter, in that order, before touching the
//! store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{ConnectInfo, Path as UrlPath, Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use secretd_core::auth::{Action, Claims, Identity, Permissions, Roles, Subject};
use secretd_core::error::{Error, Result};
use secretd_core::limiter::Limiter;
use secretd_core::operation::{CreateOperationParameters, Operation, OperationParameters};
use secretd_core::store::{Items, SecretStore, SecretsById};
use secretd_core::{config, Instance, Instances, Secret};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::identity::{resolve_identity, PeerCreds};
use crate::responses::{parse_body, parse_range, ApiError};

/// File descriptor handed over by the init system (`LISTEN_PID` protocol).
const LISTEN_FD: std::os::unix::io::RawFd = 3;

/// Server configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Socket path to bind. `None` expects an inherited listener on fd 3.
    pub socket: Option<PathBuf>,
    /// Requests admitted per principal per window; zero disables limiting.
    pub request_limit: u32,
    /// The rate-limit window; zero disables limiting.
    pub request_window: Duration,
}

struct AppState {
    store: Arc<dyn SecretStore>,
    roles: Roles,
    claims: Claims,
    limiter: Limiter,
}

type SharedState = Arc<AppState>;

impl AppState {
    /// Identity, role check, rate limit - in that order.
    fn authorize(&self, peer: &PeerCreds, required: &Permissions) -> Result<Identity> {
        let identity = resolve_identity(peer, &self.claims)?;
        self.roles.assert_permission(&identity.roles, required)?;
        self.limiter.allow(&identity.principal)?;
        Ok(identity)
    }
}

/// Builds the route table over the given store and permissions document.
pub fn router(
    store: Arc<dyn SecretStore>,
    permissions: config::Permissions,
    config: &ServerConfig,
) -> Router {
    let state = Arc::new(AppState {
        store,
        roles: permissions.roles,
        claims: permissions.claims,
        limiter: Limiter::new(config.request_limit, config.request_window),
    });
    Router::new()
        .route("/secrets", get(list_secrets))
        .route("/secrets/{secret_id}", get(get_secret))
        .route("/secrets/{secret_id}/operations", get(secret_history))
        .route(
            "/secrets/{secret_id}/instances",
            get(list_instances).post(create_instance),
        )
        .route("/secrets/{secret_id}/active", get(get_active))
        .route(
            "/secrets/{secret_id}/instances/{instance_id}",
            get(get_instance),
        )
        .route(
            "/secrets/{secret_id}/instances/{instance_id}/operations",
            get(instance_history).post(create_operation),
        )
        .with_state(state)
}

async fn list_secrets(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<PeerCreds>,
) -> Result<Json<Items<SecretsById>>, ApiError> {
    state.authorize(&peer, &Permissions::of([(Subject::Secrets, Action::List)]))?;
    let secrets = state.store.list_secrets().await?;
    Ok(Json(Items {
        items: SecretsById(secrets),
    }))
}

async fn get_secret(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<PeerCreds>,
    UrlPath(secret_id): UrlPath<String>,
) -> Result<Json<Secret>, ApiError> {
    state.authorize(&peer, &Permissions::of([(Subject::Secrets, Action::Read)]))?;
    Ok(Json(state.store.get_secret(&secret_id).await?))
}

async fn secret_history(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<PeerCreds>,
    UrlPath(secret_id): UrlPath<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Operation>>, ApiError> {
    state.authorize(&peer, &Permissions::of([(Subject::Instances, Action::Read)]))?;
    let range = parse_range(&query)?;
    Ok(Json(state.store.secret_history(&secret_id, range).await?))
}

async fn list_instances(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<PeerCreds>,
    UrlPath(secret_id): UrlPath<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Items<Instances>>, ApiError> {
    state.authorize(&peer, &Permissions::of([(Subject::Instances, Action::Read)]))?;
    let range = parse_range(&query)?;
    let instances = state.store.list_instances(&secret_id, range).await?;
    Ok(Json(Items { items: instances }))
}

async fn create_instance(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<PeerCreds>,
    UrlPath(secret_id): UrlPath<String>,
    body: Bytes,
) -> Result<Json<Instance>, ApiError> {
    let identity =
        state.authorize(&peer, &Permissions::of([(Subject::Instances, Action::Write)]))?;
    let mut parameters: OperationParameters = parse_body(&body)?;
    parameters.started_by = identity.principal;
    Ok(Json(state.store.create(&secret_id, parameters).await?))
}

async fn get_instance(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<PeerCreds>,
    UrlPath((secret_id, instance_id)): UrlPath<(String, String)>,
) -> Result<Json<Instance>, ApiError> {
    state.authorize(&peer, &Permissions::of([(Subject::Instances, Action::Read)]))?;
    Ok(Json(state.store.get_instance(&secret_id, &instance_id).await?))
}

async fn get_active(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<PeerCreds>,
    UrlPath(secret_id): UrlPath<String>,
) -> Result<Json<Option<Instance>>, ApiError> {
    state.authorize(&peer, &Permissions::of([(Subject::Instances, Action::Read)]))?;
    Ok(Json(state.store.get_active(&secret_id).await?))
}

async fn instance_history(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<PeerCreds>,
    UrlPath((secret_id, instance_id)): UrlPath<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Operation>>, ApiError> {
    state.authorize(&peer, &Permissions::of([(Subject::Instances, Action::Read)]))?;
    let range = parse_range(&query)?;
    Ok(Json(
        state
            .store
            .instance_history(&secret_id, &instance_id, range)
            .await?,
    ))
}

async fn create_operation(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<PeerCreds>,
    UrlPath((secret_id, instance_id)): UrlPath<(String, String)>,
    body: Bytes,
) -> Result<Json<Instance>, ApiError> {
    let identity = state.authorize(
        &peer,
        &Permissions::of([
            (Subject::Secrets, Action::Write),
            (Subject::Instances, Action::Write),
        ]),
    )?;
    let operation: CreateOperationParameters = parse_body(&body)?;
    let mut parameters = operation.parameters;
    parameters.started_by = identity.principal;
    Ok(Json(
        state
            .store
            .operate(&secret_id, &instance_id, operation.name, parameters)
            .await?,
    ))
}

/// Serves the agent until `token` is cancelled.
///
/// The listener is either bound to the configured socket path (a stale
/// socket file is removed first) or inherited from the init system on fd 3
/// when `LISTEN_PID` names this process.
pub async fn serve(
    config: ServerConfig,
    store: Arc<dyn SecretStore>,
    permissions: config::Permissions,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(store, permissions, &config)
        .into_make_service_with_connect_info::<PeerCreds>();

    let listener = bind(config.socket.as_deref())?;
    info!(socket = ?listener.local_addr().ok(), "agent listening");

    let shutdown_token = token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await
        .context("agent server failed")?;

    if let Some(path) = &config.socket {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

fn bind(socket: Option<&Path>) -> anyhow::Result<UnixListener> {
    if let Some(path) = socket {
        if path.exists() {
            std::fs::remove_file(path).context("failed to remove stale socket")?;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("failed to create socket directory")?;
            }
        }
        return UnixListener::bind(path).context("failed to bind Unix socket");
    }

    if std::env::var("LISTEN_PID").ok() == Some(std::process::id().to_string()) {
        // Inherited listener from the init system on the conventional fd.
        use std::os::unix::io::FromRawFd;
        let listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(LISTEN_FD) };
        listener
            .set_nonblocking(true)
            .context("failed to configure inherited socket")?;
        return UnixListener::from_std(listener).context("failed to adopt inherited socket");
    }

    Err(Error::BadConfig("no server socket".to_string()).into())
}
