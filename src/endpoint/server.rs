//! warp routes for `POST /api/internal/data`
//!
//! Processing order per request: rate limit (keyed by API key), internal
//! auth, body validation, device lookup, liveness update. Rate-limit headers
//! are attached to every response past the limiter.

use super::auth::{AuthDecision, InternalAuth};
use super::rate_limit::{FixedWindowRateLimiter, RateDecision, ANONYMOUS_KEY};
use super::registry::DeviceRegistry;
use super::validation::IngestValidator;
use super::EndpointError;
use crate::delivery::API_KEY_HEADER;
use crate::protocol::{format_timestamp, IngestErrorBody, IngestResponse, ValidationDetail};
use crate::shutdown::{wait_for_shutdown, ShutdownReceiver};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use warp::http::header::{HeaderName, HeaderValue};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// Largest accepted request body
const MAX_BODY_BYTES: u64 = 64 * 1024;

/// Everything a request handler needs
pub struct IngestState {
    auth: InternalAuth,
    limiter: Arc<FixedWindowRateLimiter>,
    validator: IngestValidator,
    registry: Arc<dyn DeviceRegistry>,
}

impl IngestState {
    pub fn new(
        api_key: impl Into<String>,
        registry: Arc<dyn DeviceRegistry>,
    ) -> Result<Self, EndpointError> {
        Self::with_limiter(
            api_key,
            registry,
            Arc::new(FixedWindowRateLimiter::for_ingestion()),
        )
    }

    pub fn with_limiter(
        api_key: impl Into<String>,
        registry: Arc<dyn DeviceRegistry>,
        limiter: Arc<FixedWindowRateLimiter>,
    ) -> Result<Self, EndpointError> {
        Ok(Self {
            auth: InternalAuth::new(api_key),
            limiter,
            validator: IngestValidator::new()?,
            registry,
        })
    }

    pub fn limiter(&self) -> Arc<FixedWindowRateLimiter> {
        Arc::clone(&self.limiter)
    }
}

pub fn ingest_routes(
    state: Arc<IngestState>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "internal" / "data")
        .and(warp::post())
        .and(warp::header::optional::<String>(API_KEY_HEADER))
        .and(warp::addr::remote())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(warp::any().map(move || Arc::clone(&state)))
        .and_then(handle_ingest)
}

async fn handle_ingest(
    api_key: Option<String>,
    peer: Option<SocketAddr>,
    body: Bytes,
    state: Arc<IngestState>,
) -> Result<Response, Infallible> {
    let rate_key = api_key.as_deref().unwrap_or(ANONYMOUS_KEY);
    let rate = state.limiter.check(rate_key);
    if !rate.allowed {
        warn!(target: "ingest_endpoint", retry_after_secs = rate.retry_after_secs, "Rate limit exceeded");
        return Ok(error_response(
            StatusCode::TOO_MANY_REQUESTS,
            IngestErrorBody::new("Data ingestion rate limit exceeded"),
            &rate,
        ));
    }

    let peer = peer.map(|addr| addr.to_string());
    let decision = state.auth.check(api_key.as_deref(), peer.as_deref());
    if let Some(message) = decision.error_message() {
        let status = if decision == AuthDecision::MissingKey {
            StatusCode::UNAUTHORIZED
        } else {
            StatusCode::FORBIDDEN
        };
        return Ok(error_response(status, IngestErrorBody::new(message), &rate));
    }

    let body: Value = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => {
            return Ok(invalid_format(
                vec![ValidationDetail {
                    path: String::new(),
                    message: format!("Malformed JSON: {e}"),
                }],
                &rate,
            ));
        }
    };

    let details = state.validator.validate(&body);
    if !details.is_empty() {
        warn!(target: "ingest_endpoint", violations = details.len(), "Data validation failed");
        return Ok(invalid_format(details, &rate));
    }

    // Validation guarantees these are strings
    let device_token = body["deviceToken"].as_str().unwrap_or_default();
    let topic = body["topic"].as_str().unwrap_or_default();
    debug!(target: "ingest_endpoint", device_token = %device_token, topic = %topic, "Data validation passed");

    let device = match state.registry.find_active_by_token(device_token).await {
        Ok(Some(device)) => device,
        Ok(None) => {
            warn!(target: "ingest_endpoint", device_token = %device_token, "Device not found or inactive");
            return Ok(error_response(
                StatusCode::NOT_FOUND,
                IngestErrorBody::new("Device not found or inactive"),
                &rate,
            ));
        }
        Err(e) => return Ok(internal_error(&e, &rate)),
    };

    if let Err(e) = state.registry.touch_last_seen(&device.id, Utc::now()).await {
        return Ok(internal_error(&e, &rate));
    }

    info!(
        target: "ingest_endpoint",
        device_id = %device.id,
        device_name = %device.device_name,
        topic = %topic,
        data_size = body["data"].to_string().len(),
        "Data received from device"
    );

    let response = IngestResponse {
        success: true,
        message: Some("Data ingested successfully".to_string()),
        device_id: Some(device.id),
        timestamp: Some(format_timestamp(&Utc::now())),
    };
    Ok(json_response(StatusCode::OK, &response, &rate))
}

fn invalid_format(details: Vec<ValidationDetail>, rate: &RateDecision) -> Response {
    let body = IngestErrorBody {
        error: "Invalid data format".to_string(),
        details: Some(details),
    };
    error_response(StatusCode::BAD_REQUEST, body, rate)
}

fn internal_error(error: &dyn std::error::Error, rate: &RateDecision) -> Response {
    error!(target: "ingest_endpoint", error = %error, "Internal data ingestion error");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        IngestErrorBody::new("Internal server error"),
        rate,
    )
}

fn error_response(status: StatusCode, body: IngestErrorBody, rate: &RateDecision) -> Response {
    json_response(status, &body, rate)
}

fn json_response<T: Serialize>(status: StatusCode, body: &T, rate: &RateDecision) -> Response {
    let mut response = warp::reply::with_status(warp::reply::json(body), status).into_response();
    let headers = response.headers_mut();
    for (name, value) in rate.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
    response
}

/// Serve the ingestion endpoint on `addr` until shutdown is signalled.
///
/// Also runs the rate limiter purge once per window.
pub async fn serve(
    state: Arc<IngestState>,
    addr: SocketAddr,
    shutdown_rx: ShutdownReceiver,
) -> Result<(), EndpointError> {
    let limiter = state.limiter();
    let routes = ingest_routes(state);

    let mut server_shutdown = shutdown_rx.clone();
    let (bound, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, async move {
            wait_for_shutdown(&mut server_shutdown).await;
        })
        .map_err(|e| EndpointError::Bind {
            addr,
            message: e.to_string(),
        })?;

    info!(target: "ingest_endpoint", address = %bound, "Ingestion endpoint listening");

    let purge = tokio::spawn(purge_expired_windows(limiter, shutdown_rx));
    server.await;
    purge.abort();

    info!(target: "ingest_endpoint", "Ingestion endpoint stopped");
    Ok(())
}

async fn purge_expired_windows(
    limiter: Arc<FixedWindowRateLimiter>,
    mut shutdown_rx: ShutdownReceiver,
) {
    let mut ticker = tokio::time::interval(limiter.window());
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let purged = limiter.purge_expired(Utc::now());
                if purged > 0 {
                    debug!(target: "ingest_endpoint", purged, "Purged expired rate limit windows");
                }
            }
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
        }
    }
}
