use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;

use super::HttpState;

pub(crate) const WORKER_HEADER: &str = "x-jsbrain-worker";

/// Identity of one HTTP exchange, independent of the render request counter.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub trace_id: String,
    pub worker_id: u32,
}

/// Attach a [`RequestContext`] and stamp the serving worker on the response.
pub async fn set_request_context(
    State(state): State<HttpState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let ctx = RequestContext {
        trace_id: Uuid::new_v4().simple().to_string(),
        worker_id: state.mediator.identity().worker_id,
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&ctx.worker_id.to_string()) {
        response.headers_mut().insert(WORKER_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

/// Log every exchange; failures carry the attached [`ErrorReport`] chain.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let (trace_id, worker_id) = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| (ctx.trace_id.clone(), ctx.worker_id))
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis() as u64;

    if !(status.is_client_error() || status.is_server_error()) {
        debug!(
            target = "jsbrain::http::response",
            status = status.as_u16(),
            method = %method,
            query = uri.query().unwrap_or(""),
            elapsed_ms,
            worker_id,
            trace_id = %trace_id,
            "request served"
        );
        return response;
    }

    let (source, messages) = match response.extensions_mut().remove::<ErrorReport>() {
        Some(report) => (report.source, report.messages),
        None => ("unknown", Vec::new()),
    };
    let detail = messages
        .first()
        .cloned()
        .unwrap_or_else(|| "no diagnostic available".to_string());

    if status.is_server_error() {
        error!(
            target = "jsbrain::http::response",
            status = status.as_u16(),
            method = %method,
            query = uri.query().unwrap_or(""),
            elapsed_ms,
            worker_id,
            source,
            detail = %detail,
            chain = ?messages,
            trace_id = %trace_id,
            "render request failed"
        );
    } else {
        warn!(
            target = "jsbrain::http::response",
            status = status.as_u16(),
            method = %method,
            query = uri.query().unwrap_or(""),
            elapsed_ms,
            worker_id,
            source,
            detail = %detail,
            trace_id = %trace_id,
            "render request rejected"
        );
    }

    response
}
