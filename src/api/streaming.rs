// SSE and JSON response plumbing for proxy outcomes

use axum::{
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::proxy::orchestrator::{ByteStream, ProxyOutcome};

/// Render an orchestrator outcome for the client.
pub fn outcome_response(outcome: ProxyOutcome) -> Response {
    match outcome {
        ProxyOutcome::Json { status, body } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            (status, Json(body)).into_response()
        }
        ProxyOutcome::Stream(stream) => sse_response(stream),
    }
}

/// Chunks are written as they arrive; proxies in front are asked not to buffer.
pub fn sse_response(stream: ByteStream) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
