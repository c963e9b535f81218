//! HTTP query surface over the [`Resolver`].
//!
//! Routes are read-only. Resolver outcomes map to status codes as follows:
//! `NotFound` is 404, `BadRequest` is 400 and a store outage is 503, each
//! with an `{"error": ...}` body. `GET /teid/{teid}` answers a missing TEID
//! with status 200 and the error body, which existing clients depend on.

use std::future::Future;
use std::time::Instant;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::config::ApiConfig;
use crate::error::{Error, ResolveError, Result};
use crate::resolver::Resolver;

/// Routes listed by `GET /`.
pub const ENDPOINTS: &[&str] = &[
    "/teid/<teid>",
    "/all-teids",
    "/ip/<ue_ip>",
    "/imsi/<imsi>",
    "/resolve/ue/imsi/<imsi>",
    "/resolve/slice?sst=..&sd=..",
    "/health",
];

/// Resolver failure rendered as a JSON error response.
#[derive(Debug)]
pub struct ApiError(pub ResolveError);

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        Self(err)
    }
}

impl ApiError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self.0 {
            ResolveError::NotFound(_) => StatusCode::NOT_FOUND,
            ResolveError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ResolveError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct SliceQuery {
    pub sst: Option<String>,
    pub sd: Option<String>,
}

#[derive(Debug, Serialize)]
struct ServiceDescriptor {
    status: &'static str,
    version: &'static str,
    endpoints: &'static [&'static str],
}

/// Build the router.
pub fn router(resolver: Resolver) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/teid/:teid", get(teid))
        .route("/all-teids", get(all_teids))
        .route("/ip/:ip", get(by_ip))
        .route("/imsi/:imsi", get(by_imsi))
        .route("/resolve/ue/imsi/:imsi", get(resolve_subscriber))
        .route("/resolve/slice", get(resolve_slice))
        .layer(middleware::from_fn(log_request))
        .with_state(resolver)
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    debug!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        "api request"
    );
    response
}

async fn root() -> Json<ServiceDescriptor> {
    Json(ServiceDescriptor {
        status: "teidmap API running",
        version: crate::VERSION,
        endpoints: ENDPOINTS,
    })
}

async fn health(State(resolver): State<Resolver>) -> Response {
    if resolver.store().is_available() {
        Json(json!({ "status": "ok", "store": "available" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "store": "unavailable" })),
        )
            .into_response()
    }
}

async fn teid(State(resolver): State<Resolver>, Path(raw): Path<String>) -> Response {
    match resolver.teid(&raw) {
        Ok(fields) => Json(fields).into_response(),
        Err(err @ ResolveError::NotFound(_)) => {
            Json(json!({ "error": err.to_string() })).into_response()
        }
        Err(err) => ApiError(err).into_response(),
    }
}

async fn all_teids(
    State(resolver): State<Resolver>,
) -> ApiResult<std::collections::BTreeMap<String, crate::resolver::FieldMap>> {
    Ok(Json(resolver.all_teids()?))
}

async fn by_ip(
    State(resolver): State<Resolver>,
    Path(ip): Path<String>,
) -> ApiResult<crate::resolver::PointerLookup> {
    Ok(Json(resolver.resolve_by_ip(&ip)?))
}

async fn by_imsi(
    State(resolver): State<Resolver>,
    Path(imsi): Path<String>,
) -> ApiResult<crate::resolver::PointerLookup> {
    Ok(Json(resolver.by_imsi_pointer(&imsi)?))
}

async fn resolve_subscriber(
    State(resolver): State<Resolver>,
    Path(imsi): Path<String>,
) -> ApiResult<crate::resolver::SubscriberResolution> {
    Ok(Json(resolver.resolve_by_identity(&imsi)?))
}

async fn resolve_slice(
    State(resolver): State<Resolver>,
    Query(query): Query<SliceQuery>,
) -> ApiResult<crate::resolver::SliceResolution> {
    Ok(Json(resolver.resolve_by_slice(
        query.sst.as_deref(),
        query.sd.as_deref(),
    )?))
}

/// Bind per `config` and serve until `shutdown` resolves.
///
/// A non-loopback host is refused unless `allow_public_bind` is set.
pub async fn serve<F>(config: &ApiConfig, resolver: Resolver, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if !config.is_loopback() && !config.allow_public_bind {
        return Err(Error::Runtime(format!(
            "refusing to bind non-loopback address {}; set api.allow_public_bind to expose the unauthenticated API",
            config.host
        )));
    }
    let listener = TcpListener::bind(config.bind_addr()).await?;
    serve_listener(listener, resolver, shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve_listener<F>(listener: TcpListener, resolver: Resolver, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "query API listening");
    axum::serve(listener, router(resolver))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("query API stopped");
    Ok(())
}
