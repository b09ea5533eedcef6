//! HTTP reverse proxy that hosts a [`CacheProxy`].
//!
//! Every request except the `/__dashcache/*` admin endpoints goes through
//! [`CacheProxy::on_intercept`]. Responses carry an `x-dashcache` header
//! saying whether they were a hit, a miss or the offline fallback.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use reqwest::Url;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::network::Network;
use crate::proxy::{CacheProxy, Served};
use crate::request::{ProxyRequest, RequestMode};
use crate::storage::CacheStorage;

/// Header naming where a response came from.
pub const SOURCE_HEADER: &str = "x-dashcache";

/// Largest request body forwarded upstream.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

async fn api_health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_status<S, N>(State(proxy): State<Arc<CacheProxy<S, N>>>) -> Response
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    match proxy.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n")).into_response(),
    }
}

/// Maps the request target onto the URL the page meant to load.
///
/// Origin-form targets (`/dashboard?x=1`) are placed on the upstream origin.
/// Absolute-form targets are accepted for the upstream origin itself and for
/// allow-listed prefixes, so CDN assets can be routed through the proxy.
fn target_url(origin: &Url, cache: &CacheConfig, uri: &Uri) -> Result<Url> {
    if uri.scheme().is_some() {
        let url = Url::parse(&uri.to_string()).map_err(|e| Error::InvalidUrl(format!("{uri}: {e}")))?;
        if url.origin() == origin.origin() || cache.is_allow_listed(&url) {
            return Ok(url);
        }
        return Err(Error::InvalidUrl(format!("{url} is not proxied")));
    }

    let mut url = origin.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    Ok(url)
}

fn into_http(served: Served) -> Response {
    let Served { response, source } = served;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = response.header_map();
    headers.remove(CONTENT_LENGTH);
    headers.insert(SOURCE_HEADER, HeaderValue::from_static(source.as_str()));
    (status, headers, response.body).into_response()
}

fn failure(status: StatusCode, message: &str) -> Response {
    (
        status,
        [(SOURCE_HEADER, "error")],
        format!("dashcache: {message}\n"),
    )
        .into_response()
}

async fn intercept<S, N>(State(proxy): State<Arc<CacheProxy<S, N>>>, request: Request) -> Response
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    let (parts, body) = request.into_parts();

    let url = match target_url(proxy.origin(), proxy.config(), &parts.uri) {
        Ok(url) => url,
        Err(e) => return failure(StatusCode::FORBIDDEN, &e.to_string()),
    };

    let body: Bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => return failure(StatusCode::PAYLOAD_TOO_LARGE, &e.to_string()),
    };

    let mode = RequestMode::classify(&parts.method, &parts.headers);
    let request = ProxyRequest::new(parts.method, url)
        .with_mode(mode)
        .with_headers(parts.headers)
        .with_body(body);

    match proxy.on_intercept(&request).await {
        Ok(served) => {
            log::debug!("{} {} [{}]", request.method, request.url, served.source.as_str());
            into_http(served)
        }
        Err(e) => {
            log::error!("{} {} failed: {e}", request.method, request.url);
            failure(StatusCode::BAD_GATEWAY, &e.to_string())
        }
    }
}

/// Builds the router for `proxy`.
pub fn router<S, N>(proxy: Arc<CacheProxy<S, N>>) -> Router
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/__dashcache/health", get(api_health))
        .route("/__dashcache/status", get(api_status::<S, N>))
        .layer(cors)
        .fallback(intercept::<S, N>)
        .with_state(proxy)
}

/// Serves `proxy` on `host:port` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve<S, N, F>(proxy: Arc<CacheProxy<S, N>>, host: &str, port: u16, shutdown: F) -> Result<()>
where
    S: CacheStorage + 'static,
    N: Network + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    serve_on(listener, proxy, shutdown).await
}

/// Serves `proxy` on an already bound listener until `shutdown` resolves,
/// then waits for pending background store writes.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve_on<S, N, F>(
    listener: tokio::net::TcpListener,
    proxy: Arc<CacheProxy<S, N>>,
    shutdown: F,
) -> Result<()>
where
    S: CacheStorage + 'static,
    N: Network + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    log::info!(
        "Serving {} for {} on {}",
        proxy.version(),
        proxy.origin(),
        listener.local_addr()?
    );
    axum::serve(listener, router(Arc::clone(&proxy)))
        .with_graceful_shutdown(shutdown)
        .await?;

    log::info!("Draining pending store writes");
    proxy.settle().await;
    Ok(())
}
