//! The per-request control loop.
//!
//! `select -> for each candidate: rewrite, convert, send, interpret -> respond`.
//! Candidates are tried strictly one after another. Within one candidate a
//! few same-attempt retries are allowed: the alternate auth header after a
//! 401/403, one retry with a freshly learned unsupported parameter stripped,
//! and the `/responses` -> `/chat/completions` fallback.

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::health::classify_status;
use super::learning::{self, LearningSink};
use super::model_rewrite;
use super::registry::{Endpoint, Registry};
use super::selector::{Candidate, EndpointSelector};
use super::upstream::{TransportError, UpstreamClient, UpstreamReply, UpstreamRequest};
use super::{AttemptOutcome, AttemptRecord, RequestContext, WireFormat};
use crate::config::{AppConfig, AuthHeader, AuthType};
use crate::error::{ConversionError, ErrorCategory, ProxyError};
use crate::translator::sse::{LineBuffer, SseParser, DEFAULT_MAX_BUFFERED_BYTES};
use crate::translator::stream::{
    decoder_for, error_frames, synthesize_stream, StreamAccumulator, StreamCollector, StreamDecoder, StreamEvent, StreamState,
};
use crate::translator::{parse_json, ConversionDescriptor};

pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// A successful answer for the client.
pub enum ProxyOutcome {
    Json { status: u16, body: Value },
    Stream(ByteStream),
}

impl std::fmt::Debug for ProxyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyOutcome::Json { status, .. } => write!(f, "Json({})", status),
            ProxyOutcome::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Longest silence tolerated between upstream stream chunks.
    pub stream_idle_timeout: Duration,
    /// Keep trying other endpoints after a business 4xx.
    pub retry_on_client_error: bool,
    /// Pass the client's own credential upstream when an endpoint has none.
    pub forward_client_credential: bool,
    /// Bytes one unterminated line, frame or tool call may hold before the stream is aborted.
    pub max_stream_buffer: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            stream_idle_timeout: Duration::from_secs(120),
            retry_on_client_error: false,
            forward_client_credential: true,
            max_stream_buffer: DEFAULT_MAX_BUFFERED_BYTES,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            stream_idle_timeout: Duration::from_secs(config.stream_idle_timeout_secs),
            retry_on_client_error: config.retry_on_client_error,
            forward_client_credential: config.api_keys.is_empty(),
            max_stream_buffer: config.max_stream_buffer_bytes,
        }
    }
}

/// Why one candidate did not produce an answer.
#[derive(Debug)]
enum Failure {
    Upstream {
        category: ErrorCategory,
        status: u16,
        message: String,
    },
    Transport(String),
    Conversion(ConversionError),
}

enum AttemptResult {
    Served(ProxyOutcome),
    /// Stop trying further candidates.
    Terminal(ProxyError),
    Next(Failure),
}

enum SendResult {
    Success {
        response: reqwest::Response,
        latency: Duration,
        is_sse: bool,
        header: Option<AuthHeader>,
    },
    Rejected {
        status: u16,
        body: String,
    },
    Transport(TransportError),
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    sink: Arc<dyn LearningSink>,
    client: UpstreamClient,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        sink: Arc<dyn LearningSink>,
        client: UpstreamClient,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            sink,
            client,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn client(&self) -> &UpstreamClient {
        &self.client
    }

    pub async fn handle(&self, mut ctx: RequestContext) -> Result<ProxyOutcome, ProxyError> {
        let selection = EndpointSelector::select(
            &self.registry.snapshot(),
            ctx.format,
            &ctx.tags,
            ctx.client_type,
            Instant::now(),
        );
        for skipped in &selection.skipped {
            tracing::debug!(request = %ctx.id, "Skipping {}: {}", skipped.endpoint, skipped.reason);
        }

        if selection.candidates.is_empty() {
            let detail = selection
                .skipped
                .iter()
                .map(|s| format!("{}: {}", s.endpoint, s.reason))
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(request = %ctx.id, "No endpoint can serve {} ({})", ctx.format, detail);
            return Err(ProxyError::NoCandidate {
                format: ctx.format.to_string(),
                detail,
            });
        }

        tracing::debug!(
            request = %ctx.id,
            "{} candidate(s) for {} {} request",
            selection.candidates.len(),
            ctx.client_type.as_str(),
            ctx.format
        );

        let mut last_upstream: Option<Failure> = None;
        let mut last_transport: Option<String> = None;
        let mut last_conversion: Option<ConversionError> = None;

        for candidate in &selection.candidates {
            ctx.attempts += 1;
            match self.try_candidate(&mut ctx, candidate).await {
                AttemptResult::Served(outcome) => {
                    tracing::info!(
                        request = %ctx.id,
                        attempts = ctx.attempts,
                        "Served by {} [{}]",
                        candidate.endpoint.name(),
                        ctx.trace_summary()
                    );
                    return Ok(outcome);
                }
                AttemptResult::Terminal(err) => {
                    tracing::info!(request = %ctx.id, "Request rejected upstream [{}]", ctx.trace_summary());
                    return Err(err);
                }
                AttemptResult::Next(failure @ Failure::Upstream { .. }) => last_upstream = Some(failure),
                AttemptResult::Next(Failure::Transport(message)) => last_transport = Some(message),
                AttemptResult::Next(Failure::Conversion(err)) => last_conversion = Some(err),
            }
        }

        let trace = ctx.trace_summary();
        tracing::warn!(request = %ctx.id, "All candidates failed [{}]", trace);

        if let Some(Failure::Upstream {
            category,
            status,
            message,
        }) = last_upstream
        {
            let message = format!("{} (tried: {})", message, trace);
            return Err(match category {
                ErrorCategory::Business => ProxyError::Business { status, message },
                ErrorCategory::Config => ProxyError::Config { status, message },
                ErrorCategory::Server => ProxyError::Server {
                    status: Some(status),
                    message,
                },
            });
        }
        if let Some(message) = last_transport {
            return Err(ProxyError::Forward(format!("{} (tried: {})", message, trace)));
        }
        match last_conversion {
            Some(err) => Err(ProxyError::Conversion(err)),
            None => Err(ProxyError::NoCandidate {
                format: ctx.format.to_string(),
                detail: trace,
            }),
        }
    }

    async fn try_candidate(&self, ctx: &mut RequestContext, candidate: &Candidate) -> AttemptResult {
        let endpoint = &candidate.endpoint;
        let mut body = ctx.body.clone();
        let client_model = model_rewrite::apply_rewrite(&endpoint.config().model_rewrite.rules, &mut body);

        // Only an unconfirmed `/responses` may fall back; a learned one keeps
        // its 4xx as a real answer.
        let responses_unconfirmed = endpoint.learned().supports_responses != Some(true);
        let mut responses_rejected = false;
        let formats = &candidate.upstream_formats;

        for (i, &upstream_format) in formats.iter().enumerate() {
            let has_fallback = i + 1 < formats.len();
            let descriptor = ConversionDescriptor::new(ctx.format, upstream_format, ctx.stream);
            let mut converted = match descriptor.convert_request(&body) {
                Ok(converted) => converted,
                Err(err) => {
                    ctx.record(AttemptRecord {
                        endpoint: endpoint.name().to_string(),
                        upstream_format: Some(upstream_format),
                        outcome: AttemptOutcome::ConversionFailed,
                        status: None,
                        detail: err.to_string(),
                    });
                    return AttemptResult::Next(Failure::Conversion(err));
                }
            };
            ctx.attempt_body = Some(converted.clone());

            match self.send(ctx, endpoint, upstream_format, &mut converted).await {
                SendResult::Success {
                    response,
                    latency,
                    is_sse,
                    header,
                } => {
                    if let Some(header) = header {
                        learning::remember_auth(endpoint, header, self.sink.as_ref());
                    }
                    learning::remember_openai_format(endpoint, upstream_format, responses_rejected, self.sink.as_ref());
                    return self
                        .deliver(ctx, endpoint, descriptor, response, latency, is_sse, client_model)
                        .await;
                }
                SendResult::Rejected { status, body: text } => {
                    let format_rejected = learning::is_format_rejection(upstream_format, status)
                        && (upstream_format != WireFormat::OpenAIResponses || responses_unconfirmed);
                    if format_rejected && has_fallback {
                        tracing::debug!(
                            "Endpoint {} rejected {} with {}, falling back",
                            endpoint.name(),
                            upstream_format,
                            status
                        );
                        responses_rejected |= upstream_format == WireFormat::OpenAIResponses;
                        continue;
                    }
                    return self.reject(ctx, endpoint, upstream_format, status, &text);
                }
                SendResult::Transport(err) => {
                    if upstream_format == WireFormat::OpenAIResponses && has_fallback && responses_unconfirmed {
                        tracing::debug!("Endpoint {} /responses failed ({}), falling back", endpoint.name(), err);
                        // A timeout says nothing about support, so only a refused connection is learned.
                        responses_rejected |= matches!(err, TransportError::Connect(_));
                        continue;
                    }
                    let detail = err.to_string();
                    endpoint.record_failure(ErrorCategory::Server, &detail);
                    ctx.record(AttemptRecord {
                        endpoint: endpoint.name().to_string(),
                        upstream_format: Some(upstream_format),
                        outcome: AttemptOutcome::Failed(ErrorCategory::Server),
                        status: None,
                        detail: detail.clone(),
                    });
                    return AttemptResult::Next(Failure::Transport(detail));
                }
            }
        }

        // Every format was a fallback that itself fell through.
        AttemptResult::Next(Failure::Transport(format!(
            "{}: no upstream format accepted the request",
            endpoint.name()
        )))
    }

    /// One upstream call with auth header detection and unsupported-parameter retry.
    async fn send(
        &self,
        ctx: &RequestContext,
        endpoint: &Endpoint,
        format: WireFormat,
        body: &mut Value,
    ) -> SendResult {
        let Some(url) = endpoint.url_for(format) else {
            return SendResult::Transport(TransportError::Connect(format!("no {} URL configured", format)));
        };

        let learned = endpoint.learned();
        let removed = learning::strip_params(body, &learned.unsupported_params);
        if !removed.is_empty() {
            tracing::debug!("Stripped {:?} for {}", removed, endpoint.name());
        }

        let config = endpoint.config();
        let credential = if !config.auth_value.is_empty() {
            Some(config.auth_value.clone())
        } else if self.settings.forward_client_credential {
            ctx.client_credential.clone()
        } else {
            None
        };
        let headers: Vec<Option<AuthHeader>> = match (&credential, config.auth_type) {
            (None, _) | (_, AuthType::None) => vec![None],
            (Some(_), auth_type) => learning::auth_header_order(auth_type, &learned)
                .into_iter()
                .map(Some)
                .collect(),
        };

        let mut tried = 0;
        let mut param_retried = false;
        loop {
            let header = headers.get(tried).copied().flatten();
            let reply = {
                let request = UpstreamRequest {
                    url: url.clone(),
                    format,
                    body: &*body,
                    stream: ctx.stream,
                    auth: header.zip(credential.as_deref()),
                    anthropic_beta: ctx.anthropic_beta.as_deref(),
                };
                self.client.send(&request).await
            };

            match reply {
                Err(err) => return SendResult::Transport(err),
                Ok(UpstreamReply::Success {
                    response,
                    latency,
                    is_sse,
                }) => {
                    return SendResult::Success {
                        response,
                        latency,
                        is_sse,
                        header,
                    }
                }
                Ok(UpstreamReply::Rejected { status, body: text, .. }) => {
                    if (status == 401 || status == 403) && tried + 1 < headers.len() {
                        tracing::debug!(
                            "Endpoint {} refused {:?}, trying next auth header",
                            endpoint.name(),
                            header.map(|h| h.header_name())
                        );
                        tried += 1;
                        continue;
                    }
                    if (400..500).contains(&status) && !param_retried {
                        if let Some(param) = learning::extract_unsupported_param(&text) {
                            learning::remember_unsupported_param(endpoint, &param, self.sink.as_ref());
                            let stripped = learning::strip_params(body, &BTreeSet::from([param]));
                            if !stripped.is_empty() {
                                param_retried = true;
                                continue;
                            }
                        }
                    }
                    return SendResult::Rejected { status, body: text };
                }
            }
        }
    }

    fn reject(
        &self,
        ctx: &mut RequestContext,
        endpoint: &Endpoint,
        format: WireFormat,
        status: u16,
        body: &str,
    ) -> AttemptResult {
        let category = classify_status(status, body);
        let message = learning::error_message(body);
        let detail: String = format!("{} {}", status, message).chars().take(200).collect();
        endpoint.record_failure(category, &detail);
        ctx.record(AttemptRecord {
            endpoint: endpoint.name().to_string(),
            upstream_format: Some(format),
            outcome: AttemptOutcome::Failed(category),
            status: Some(status),
            detail,
        });
        tracing::warn!(
            "Endpoint {} answered {} ({})",
            endpoint.name(),
            status,
            category.as_str()
        );

        if category == ErrorCategory::Business && !self.settings.retry_on_client_error {
            return AttemptResult::Terminal(ProxyError::Business { status, message });
        }
        AttemptResult::Next(Failure::Upstream {
            category,
            status,
            message,
        })
    }

    /// Turn a 2xx upstream response into the client's format.
    #[allow(clippy::too_many_arguments)]
    async fn deliver(
        &self,
        ctx: &mut RequestContext,
        endpoint: &Arc<Endpoint>,
        descriptor: ConversionDescriptor,
        response: reqwest::Response,
        latency: Duration,
        is_sse: bool,
        client_model: Option<String>,
    ) -> AttemptResult {
        let served = |ctx: &mut RequestContext, detail: &str| {
            ctx.record(AttemptRecord {
                endpoint: endpoint.name().to_string(),
                upstream_format: Some(descriptor.upstream),
                outcome: AttemptOutcome::Success,
                status: Some(200),
                detail: detail.to_string(),
            });
        };

        if ctx.stream && is_sse {
            let guard = StreamGuard::new(endpoint.clone(), latency);
            let idle = self.settings.stream_idle_timeout;
            let limit = self.settings.max_stream_buffer;
            let stream = if descriptor.is_passthrough() {
                passthrough_stream(response, descriptor.client, client_model, idle, limit, guard)
            } else {
                let decoder = decoder_for(descriptor.upstream);
                let accumulator = StreamAccumulator::new(descriptor.client, client_model).with_buffer_limit(limit);
                converted_stream(response, decoder, accumulator, idle, limit, guard)
            };
            served(ctx, "stream");
            return AttemptResult::Served(ProxyOutcome::Stream(stream));
        }

        let read = if is_sse {
            self.collect_stream(response, descriptor.upstream).await
        } else {
            match tokio::time::timeout(self.client.attempt_timeout(), response.bytes()).await {
                Ok(Ok(bytes)) => Ok(Body::Json(bytes)),
                Ok(Err(e)) => Err(format!("failed to read upstream body: {}", e)),
                Err(_) => Err("timed out reading upstream body".to_string()),
            }
        };

        let upstream_body = match read {
            Ok(body) => body,
            Err(detail) => {
                endpoint.record_failure(ErrorCategory::Server, &detail);
                ctx.record(AttemptRecord {
                    endpoint: endpoint.name().to_string(),
                    upstream_format: Some(descriptor.upstream),
                    outcome: AttemptOutcome::Failed(ErrorCategory::Server),
                    status: Some(200),
                    detail: detail.clone(),
                });
                return AttemptResult::Next(Failure::Transport(detail));
            }
        };

        let converted = match upstream_body {
            Body::Json(bytes) => parse_json(&bytes).and_then(|json| {
                if ctx.stream {
                    synthesize_stream(&json, descriptor.upstream, descriptor.client, client_model.clone())
                        .map(Converted::Frames)
                } else {
                    descriptor.convert_response(&json).map(Converted::Json)
                }
            }),
            Body::Chat(chat) => descriptor.chat_to_client(&chat).map(Converted::Json),
        };

        match converted {
            Ok(Converted::Json(mut json)) => {
                if let Some(model) = &client_model {
                    model_rewrite::restore_model(&mut json, model);
                }
                endpoint.record_success(Some(latency));
                served(ctx, "json");
                AttemptResult::Served(ProxyOutcome::Json { status: 200, body: json })
            }
            Ok(Converted::Frames(frames)) => {
                endpoint.record_success(Some(latency));
                served(ctx, "synthesized stream");
                let stream = stream::iter(frames.into_iter().map(|frame| Ok(Bytes::from(frame)))).boxed();
                AttemptResult::Served(ProxyOutcome::Stream(stream))
            }
            Err(err) => {
                tracing::warn!("Response from {} could not be converted: {}", endpoint.name(), err);
                ctx.record(AttemptRecord {
                    endpoint: endpoint.name().to_string(),
                    upstream_format: Some(descriptor.upstream),
                    outcome: AttemptOutcome::ConversionFailed,
                    status: Some(200),
                    detail: err.to_string(),
                });
                AttemptResult::Next(Failure::Conversion(err))
            }
        }
    }

    /// Read a whole SSE body into one normalized Chat completion.
    async fn collect_stream(&self, response: reqwest::Response, upstream: WireFormat) -> Result<Body, String> {
        let mut decoder = decoder_for(upstream);
        let mut parser = SseParser::with_limit(self.settings.max_stream_buffer);
        let mut collector = StreamCollector::new();
        let mut chunks = response.bytes_stream();
        let idle = self.settings.stream_idle_timeout;

        loop {
            match tokio::time::timeout(idle, chunks.next()).await {
                Ok(Some(Ok(chunk))) => {
                    for frame in parser.feed(&chunk).map_err(|e| e.to_string())? {
                        decoder.decode(&frame).into_iter().for_each(|e| collector.push(e));
                    }
                }
                Ok(Some(Err(e))) => return Err(format!("stream read failed: {}", e)),
                Ok(None) => break,
                Err(_) => return Err(format!("stream idle for {}s", idle.as_secs())),
            }
        }
        if let Some(frame) = parser.finish() {
            decoder.decode(&frame).into_iter().for_each(|e| collector.push(e));
        }
        if let Some(message) = collector.error() {
            return Err(format!("upstream stream error: {}", message));
        }
        Ok(Body::Chat(collector.into_chat_completion(None)))
    }
}

enum Body {
    Json(Bytes),
    Chat(Value),
}

enum Converted {
    Json(Value),
    Frames(Vec<String>),
}

/// Records the endpoint's health once a stream ends. A stream dropped before
/// it finished (client went away) counts as neither success nor failure.
struct StreamGuard {
    endpoint: Arc<Endpoint>,
    latency: Duration,
    outcome: Option<Result<(), String>>,
}

impl StreamGuard {
    fn new(endpoint: Arc<Endpoint>, latency: Duration) -> Self {
        Self {
            endpoint,
            latency,
            outcome: None,
        }
    }

    fn succeed(&mut self) {
        self.outcome.get_or_insert(Ok(()));
    }

    fn fail(&mut self, detail: impl Into<String>) {
        self.outcome.get_or_insert(Err(detail.into()));
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        match self.outcome.take() {
            Some(Ok(())) => self.endpoint.record_success(Some(self.latency)),
            Some(Err(detail)) => {
                tracing::warn!("Stream from {} failed: {}", self.endpoint.name(), detail);
                self.endpoint.record_failure(ErrorCategory::Server, &detail);
            }
            None => tracing::debug!("Stream from {} cancelled by client", self.endpoint.name()),
        }
    }
}

/// Upstream and client speak the same format: forward line by line,
/// restoring the model name when it was rewritten.
fn passthrough_stream(
    response: reqwest::Response,
    format: WireFormat,
    client_model: Option<String>,
    idle: Duration,
    limit: usize,
    mut guard: StreamGuard,
) -> ByteStream {
    let stream = async_stream::stream! {
        let mut upstream = response.bytes_stream();
        let mut lines = LineBuffer::with_limit(limit);
        loop {
            match tokio::time::timeout(idle, upstream.next()).await {
                Ok(Some(Ok(chunk))) => {
                    let fed = match lines.feed(&chunk) {
                        Ok(fed) => fed,
                        Err(e) => {
                            let detail = e.to_string();
                            // Close any event the upstream left open before the error frames.
                            yield Ok(Bytes::from_static(b"\n"));
                            for frame in error_frames(format, &detail) {
                                yield Ok(Bytes::from(frame));
                            }
                            guard.fail(detail);
                            break;
                        }
                    };
                    for line in fed {
                        if is_error_line(format, &line) {
                            guard.fail("upstream sent an error event");
                        }
                        let line = match &client_model {
                            Some(model) => model_rewrite::restore_model_in_sse_line(&line, model).unwrap_or(line),
                            None => line,
                        };
                        yield Ok(Bytes::from(format!("{}\n", line)));
                    }
                }
                Ok(Some(Err(e))) => {
                    guard.fail(format!("stream read failed: {}", e));
                    break;
                }
                Ok(None) => {
                    if let Some(rest) = lines.finish() {
                        yield Ok(Bytes::from(format!("{}\n\n", rest)));
                    }
                    guard.succeed();
                    break;
                }
                Err(_) => {
                    guard.fail(format!("stream idle for {}s", idle.as_secs()));
                    break;
                }
            }
        }
    };
    stream.boxed()
}

fn is_error_line(format: WireFormat, line: &str) -> bool {
    match format {
        WireFormat::Anthropic => line == "event: error",
        WireFormat::OpenAIResponses => line == "event: response.failed",
        WireFormat::OpenAIChat => line.starts_with("data: {\"error\""),
    }
}

/// Cross-format stream: decode upstream frames, re-encode for the client.
fn converted_stream(
    response: reqwest::Response,
    mut decoder: Box<dyn StreamDecoder>,
    mut accumulator: StreamAccumulator,
    idle: Duration,
    limit: usize,
    mut guard: StreamGuard,
) -> ByteStream {
    let stream = async_stream::stream! {
        let mut upstream = response.bytes_stream();
        let mut parser = SseParser::with_limit(limit);
        loop {
            let frames = match tokio::time::timeout(idle, upstream.next()).await {
                Ok(Some(Ok(chunk))) => match parser.feed(&chunk) {
                    Ok(frames) => frames,
                    Err(e) => {
                        let detail = e.to_string();
                        for frame in accumulator.abort(&detail) {
                            yield Ok(Bytes::from(frame));
                        }
                        guard.fail(detail);
                        break;
                    }
                },
                Ok(Some(Err(e))) => {
                    let detail = format!("stream read failed: {}", e);
                    for frame in accumulator.abort(&detail) {
                        yield Ok(Bytes::from(frame));
                    }
                    guard.fail(detail);
                    break;
                }
                Ok(None) => {
                    for frame in parser.finish() {
                        for event in decoder.decode(&frame) {
                            if let StreamEvent::Error(message) = &event {
                                guard.fail(message.clone());
                            }
                            for out in accumulator.push(event) {
                                yield Ok(Bytes::from(out));
                            }
                        }
                    }
                    // Upstream ended without a terminal event of its own.
                    for out in accumulator.finish() {
                        yield Ok(Bytes::from(out));
                    }
                    guard.succeed();
                    break;
                }
                Err(_) => {
                    let detail = format!("stream idle for {}s", idle.as_secs());
                    for frame in accumulator.abort(&detail) {
                        yield Ok(Bytes::from(frame));
                    }
                    guard.fail(detail);
                    break;
                }
            };

            for frame in frames {
                for event in decoder.decode(&frame) {
                    if let StreamEvent::Error(message) = &event {
                        guard.fail(message.clone());
                    }
                    for out in accumulator.push(event) {
                        yield Ok(Bytes::from(out));
                    }
                }
            }
            if accumulator.state() == StreamState::Completed {
                guard.succeed();
                break;
            }
            if accumulator.state() == StreamState::Aborted {
                guard.fail("stream aborted");
                break;
            }
        }
    };
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, OpenAIPreference, RewriteRule};
    use crate::proxy::health::{HealthSettings, HealthStatus};
    use crate::proxy::learning::NoopSink;
    use crate::proxy::ClientType;
    use axum::{
        http::{header, HeaderMap, StatusCode},
        response::IntoResponse,
        routing::post,
        Json, Router,
    };
    use crate::translator::sse::DONE_FRAME;
    use serde_json::json;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn orchestrator_for(endpoints: Vec<EndpointConfig>) -> Orchestrator {
        orchestrator_with(endpoints, Duration::from_secs(5), OrchestratorSettings::default())
    }

    fn orchestrator_with(
        endpoints: Vec<EndpointConfig>,
        attempt_timeout: Duration,
        settings: OrchestratorSettings,
    ) -> Orchestrator {
        let registry = Arc::new(Registry::new(endpoints, HealthSettings::default()).unwrap());
        Orchestrator::new(
            registry,
            Arc::new(NoopSink),
            UpstreamClient::new(Duration::from_secs(2), attempt_timeout).unwrap(),
            settings,
        )
    }

    /// A Chat upstream that streams `chunks`, then optionally never finishes.
    fn chat_sse_upstream(chunks: Vec<String>, stall: bool) -> Router {
        Router::new().route(
            "/chat/completions",
            post(move || {
                let chunks = chunks.clone();
                async move {
                    // Spaced out so each chunk reaches the proxy on its own.
                    let head = stream::iter(chunks).then(|c| async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, Infallible>(Bytes::from(c))
                    });
                    let body = if stall {
                        axum::body::Body::from_stream(head.chain(stream::pending()))
                    } else {
                        axum::body::Body::from_stream(head)
                    };
                    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
                }
            }),
        )
    }

    const CHAT_CHUNK: &str =
        "data: {\"id\":\"chatcmpl-7\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"po\"}}]}\n\n";

    fn anthropic_stream_request() -> RequestContext {
        RequestContext::new(
            ClientType::ClaudeCode,
            WireFormat::Anthropic,
            json!({"model": "gpt-4o", "max_tokens": 64, "stream": true, "messages": [{"role": "user", "content": "ping"}]}),
        )
    }

    fn chat_reply(model: &str) -> Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": model,
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "pong"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1}
        })
    }

    fn anthropic_reply(model: &str) -> Value {
        json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": [{"type": "text", "text": "pong"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 1}
        })
    }

    fn chat_endpoint(name: &str, base: &str) -> EndpointConfig {
        let mut config = EndpointConfig::new(name);
        config.url_openai_chat = Some(base.to_string());
        config.openai_preference = OpenAIPreference::ChatCompletions;
        config
    }

    fn anthropic_endpoint(name: &str, base: &str) -> EndpointConfig {
        let mut config = EndpointConfig::new(name);
        config.url_anthropic = Some(base.to_string());
        config
    }

    fn chat_request(extra: Value) -> RequestContext {
        let mut body = json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "ping"}]});
        if let (Some(obj), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            obj.extend(extra.clone());
        }
        RequestContext::new(ClientType::Generic, WireFormat::OpenAIChat, body)
    }

    async fn collect(outcome: ProxyOutcome) -> String {
        match outcome {
            ProxyOutcome::Stream(stream) => {
                let chunks: Vec<_> = stream.collect().await;
                chunks
                    .into_iter()
                    .map(|c| String::from_utf8(c.unwrap().to_vec()).unwrap())
                    .collect()
            }
            other => panic!("expected a stream, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsupported_parameter_is_learned_and_stripped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/chat/completions",
            post(move |Json(body): Json<Value>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if body.get("top_p").is_some() {
                        (
                            StatusCode::BAD_REQUEST,
                            Json(json!({"error": {"message": "parameter 'top_p' is not supported"}})),
                        )
                    } else {
                        (StatusCode::OK, Json(chat_reply("gpt-4o")))
                    }
                }
            }),
        );
        let base = spawn(app).await;
        let orchestrator = orchestrator_for(vec![chat_endpoint("relay", &base)]);

        let outcome = orchestrator.handle(chat_request(json!({"top_p": 0.5}))).await.unwrap();
        match outcome {
            ProxyOutcome::Json { status, body } => {
                assert_eq!(status, 200);
                assert_eq!(body["choices"][0]["message"]["content"], "pong");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let endpoint = orchestrator.registry().get("relay").unwrap();
        assert_eq!(endpoint.learned().unsupported_params.len(), 1);

        orchestrator.handle(chat_request(json!({"top_p": 0.5}))).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(endpoint.learned().unsupported_params.len(), 1);
    }

    #[tokio::test]
    async fn test_responses_client_on_anthropic_endpoint_with_model_rewrite() {
        let app = Router::new().route(
            "/v1/messages",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "claude-sonnet-4");
                assert!(body.get("stream").is_none());
                Json(anthropic_reply("claude-sonnet-4"))
            }),
        );
        let base = spawn(app).await;
        let mut config = anthropic_endpoint("anthropic-only", &base);
        config.model_rewrite.rules.push(RewriteRule {
            source_pattern: "gpt-*".into(),
            target_model: "claude-sonnet-4".into(),
        });
        let orchestrator = orchestrator_for(vec![config]);

        let ctx = RequestContext::new(
            ClientType::Codex,
            WireFormat::OpenAIResponses,
            json!({"model": "gpt-5", "input": "ping", "instructions": "be terse"}),
        );
        let ProxyOutcome::Json { body, .. } = orchestrator.handle(ctx).await.unwrap() else {
            panic!("expected json");
        };
        assert_eq!(body["object"], "response");
        assert_eq!(body["model"], "gpt-5");
        assert_eq!(body["output"][0]["content"][0]["text"], "pong");
        assert_eq!(body["usage"]["input_tokens"], 3);
    }

    #[tokio::test]
    async fn test_json_upstream_is_synthesized_into_stream() {
        let app = Router::new().route(
            "/v1/messages",
            post(|| async { Json(anthropic_reply("claude-haiku")) }),
        );
        let base = spawn(app).await;
        let orchestrator = orchestrator_for(vec![anthropic_endpoint("a", &base)]);

        let ctx = RequestContext::new(
            ClientType::Codex,
            WireFormat::OpenAIResponses,
            json!({"model": "claude-haiku", "input": "ping", "stream": true}),
        );
        let text = collect(orchestrator.handle(ctx).await.unwrap()).await;
        let created = text.find("event: response.created").unwrap();
        let delta = text.find("event: response.output_text.delta").unwrap();
        let completed = text.find("event: response.completed").unwrap();
        assert!(created < delta && delta < completed);
        assert_eq!(text.matches("event: response.completed").count(), 1);
    }

    #[tokio::test]
    async fn test_chat_sse_converted_for_anthropic_client() {
        let sse = concat!(
            "data: {\"id\":\"chatcmpl-7\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"po\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ng\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let app = Router::new().route(
            "/chat/completions",
            post(move || async move { ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response() }),
        );
        let base = spawn(app).await;
        let orchestrator = orchestrator_for(vec![chat_endpoint("openai", &base)]);

        let ctx = RequestContext::new(
            ClientType::ClaudeCode,
            WireFormat::Anthropic,
            json!({"model": "gpt-4o", "max_tokens": 64, "stream": true, "messages": [{"role": "user", "content": "ping"}]}),
        );
        let text = collect(orchestrator.handle(ctx).await.unwrap()).await;
        assert!(text.starts_with("event: message_start"));
        assert!(text.contains("\"text\":\"po\""));
        assert!(text.contains("\"stop_reason\":\"end_turn\""));
        assert_eq!(text.matches("event: message_stop").count(), 1);

        let endpoint = orchestrator.registry().get("openai").unwrap();
        assert!(endpoint.last_latency().is_some());
    }

    #[tokio::test]
    async fn test_repeated_server_errors_blacklist_and_fail_over() {
        let bad = spawn(Router::new().route(
            "/chat/completions",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        ))
        .await;
        let good = spawn(Router::new().route(
            "/chat/completions",
            post(|| async { Json(chat_reply("gpt-4o")) }),
        ))
        .await;
        let mut primary = chat_endpoint("primary", &bad);
        primary.priority = 0;
        let mut backup = chat_endpoint("backup", &good);
        backup.priority = 1;
        let orchestrator = orchestrator_for(vec![primary, backup]);

        for _ in 0..2 {
            let outcome = orchestrator.handle(chat_request(json!({}))).await.unwrap();
            assert!(matches!(outcome, ProxyOutcome::Json { status: 200, .. }));
        }
        let primary = orchestrator.registry().get("primary").unwrap();
        assert_eq!(primary.health_status(Instant::now()), HealthStatus::Blacklisted);
    }

    #[tokio::test]
    async fn test_auth_header_falls_back_to_bearer() {
        let app = Router::new().route(
            "/v1/messages",
            post(|headers: HeaderMap| async move {
                let bearer = headers.get("authorization").and_then(|v| v.to_str().ok());
                if bearer == Some("Bearer secret") {
                    (StatusCode::OK, Json(anthropic_reply("claude")))
                } else {
                    (StatusCode::UNAUTHORIZED, Json(json!({"error": {"message": "bad key"}})))
                }
            }),
        );
        let base = spawn(app).await;
        let mut config = anthropic_endpoint("dual-auth", &base);
        config.auth_value = "secret".into();
        let orchestrator = orchestrator_for(vec![config]);

        let ctx = RequestContext::new(
            ClientType::ClaudeCode,
            WireFormat::Anthropic,
            json!({"model": "claude", "max_tokens": 16, "messages": [{"role": "user", "content": "hi"}]}),
        );
        orchestrator.handle(ctx).await.unwrap();
        let endpoint = orchestrator.registry().get("dual-auth").unwrap();
        assert_eq!(endpoint.learned().auth_header, Some(AuthHeader::Bearer));
    }

    #[tokio::test]
    async fn test_rejected_responses_route_falls_back_to_chat() {
        let app = Router::new()
            .route("/responses", post(|| async { (StatusCode::NOT_FOUND, "no such route") }))
            .route("/chat/completions", post(|| async { Json(chat_reply("gpt-4o")) }));
        let base = spawn(app).await;
        let mut config = EndpointConfig::new("auto");
        config.url_openai_chat = Some(base);
        let orchestrator = orchestrator_for(vec![config]);

        let ctx = RequestContext::new(
            ClientType::ClaudeCode,
            WireFormat::Anthropic,
            json!({"model": "gpt-4o", "max_tokens": 16, "messages": [{"role": "user", "content": "hi"}]}),
        );
        let ProxyOutcome::Json { body, .. } = orchestrator.handle(ctx).await.unwrap() else {
            panic!("expected json");
        };
        assert_eq!(body["content"][0]["text"], "pong");

        let learned = orchestrator.registry().get("auto").unwrap().learned();
        assert_eq!(learned.openai_preference, OpenAIPreference::ChatCompletions);
        assert_eq!(learned.supports_responses, Some(false));
    }

    #[tokio::test]
    async fn test_client_disconnect_mid_stream_leaves_health_untouched() {
        let base = spawn(chat_sse_upstream(vec![CHAT_CHUNK.to_string()], true)).await;
        let orchestrator = orchestrator_for(vec![chat_endpoint("stalling", &base)]);

        let outcome = orchestrator.handle(chat_request(json!({"stream": true}))).await.unwrap();
        let ProxyOutcome::Stream(mut body) = outcome else {
            panic!("expected a stream");
        };
        let first = body.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).starts_with("data: "));
        drop(body);

        let view = orchestrator.registry().get("stalling").unwrap().view();
        assert_eq!(view.window_samples, 0);
        assert_eq!(view.status, HealthStatus::Healthy);
        assert_eq!(view.last_latency_ms, None);
    }

    #[tokio::test]
    async fn test_attempt_timeout_moves_to_next_endpoint() {
        let slow = spawn(Router::new().route(
            "/chat/completions",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(chat_reply("gpt-4o"))
            }),
        ))
        .await;
        let fast = spawn(Router::new().route(
            "/chat/completions",
            post(|| async { Json(chat_reply("gpt-4o")) }),
        ))
        .await;
        let mut first = chat_endpoint("slow", &slow);
        first.priority = 0;
        let mut second = chat_endpoint("fast", &fast);
        second.priority = 1;
        let orchestrator = orchestrator_with(
            vec![first, second],
            Duration::from_millis(300),
            OrchestratorSettings::default(),
        );

        let outcome = orchestrator.handle(chat_request(json!({}))).await.unwrap();
        assert!(matches!(outcome, ProxyOutcome::Json { status: 200, .. }));
        let view = orchestrator.registry().get("slow").unwrap().view();
        assert_eq!(view.window_samples, 1);
        assert_ne!(view.status, HealthStatus::Healthy);

        let orchestrator = orchestrator_with(
            vec![chat_endpoint("slow", &slow)],
            Duration::from_millis(300),
            OrchestratorSettings::default(),
        );
        let err = orchestrator.handle(chat_request(json!({}))).await.unwrap_err();
        assert_eq!(err.code(), "proxy_forward_failed");
        let message = err.to_string();
        assert!(message.contains("timed out after 300ms"), "{}", message);
        assert!(message.contains("slow"), "{}", message);
    }

    #[tokio::test]
    async fn test_idle_upstream_stream_is_aborted_in_band() {
        let base = spawn(chat_sse_upstream(vec![CHAT_CHUNK.to_string()], true)).await;
        let settings = OrchestratorSettings {
            stream_idle_timeout: Duration::from_millis(200),
            ..OrchestratorSettings::default()
        };
        let orchestrator = orchestrator_with(vec![chat_endpoint("idle", &base)], Duration::from_secs(5), settings);

        let text = collect(orchestrator.handle(anthropic_stream_request()).await.unwrap()).await;
        assert!(text.contains("\"text\":\"po\""));
        assert_eq!(text.matches("event: error").count(), 1);
        assert_eq!(text.matches("event: message_stop").count(), 1);
        assert!(text.ends_with("\n\n"));

        let view = orchestrator.registry().get("idle").unwrap().view();
        assert_eq!(view.window_samples, 1);
        assert_ne!(view.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unterminated_upstream_line_is_capped() {
        let runaway = format!("data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{}", "x".repeat(4096));
        let base = spawn(chat_sse_upstream(vec![CHAT_CHUNK.to_string(), runaway], false)).await;
        let settings = OrchestratorSettings {
            max_stream_buffer: 1024,
            ..OrchestratorSettings::default()
        };

        // Converted for an Anthropic client: aborted through the accumulator.
        let orchestrator = orchestrator_with(
            vec![chat_endpoint("runaway", &base)],
            Duration::from_secs(5),
            settings.clone(),
        );
        let text = collect(orchestrator.handle(anthropic_stream_request()).await.unwrap()).await;
        assert!(text.contains("\"text\":\"po\""));
        assert!(text.contains("more than 1024 bytes"), "{}", text);
        assert_eq!(text.matches("event: error").count(), 1);
        assert_eq!(text.matches("event: message_stop").count(), 1);
        assert_eq!(orchestrator.registry().get("runaway").unwrap().view().window_samples, 1);

        // Same format on both sides: terminal error frames after the forwarded lines.
        let orchestrator = orchestrator_with(vec![chat_endpoint("runaway", &base)], Duration::from_secs(5), settings);
        let text = collect(orchestrator.handle(chat_request(json!({"stream": true}))).await.unwrap()).await;
        assert!(text.starts_with("data: {\"id\":\"chatcmpl-7\""));
        assert!(text.contains("more than 1024 bytes"), "{}", text);
        assert!(text.ends_with(DONE_FRAME));
        assert!(!text.contains(&"x".repeat(1024)));
        assert_eq!(orchestrator.registry().get("runaway").unwrap().view().window_samples, 1);
    }

    #[tokio::test]
    async fn test_slow_responses_route_falls_back_to_chat() {
        let app = Router::new()
            .route(
                "/responses",
                post(|| async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    (StatusCode::NOT_FOUND, "no such route")
                }),
            )
            .route("/chat/completions", post(|| async { Json(chat_reply("gpt-4o")) }));
        let base = spawn(app).await;
        let mut config = EndpointConfig::new("auto");
        config.url_openai_chat = Some(base);
        let orchestrator = orchestrator_with(vec![config], Duration::from_millis(300), OrchestratorSettings::default());

        let ctx = RequestContext::new(
            ClientType::ClaudeCode,
            WireFormat::Anthropic,
            json!({"model": "gpt-4o", "max_tokens": 16, "messages": [{"role": "user", "content": "hi"}]}),
        );
        let ProxyOutcome::Json { body, .. } = orchestrator.handle(ctx).await.unwrap() else {
            panic!("expected json");
        };
        assert_eq!(body["content"][0]["text"], "pong");

        let endpoint = orchestrator.registry().get("auto").unwrap();
        let learned = endpoint.learned();
        assert_eq!(learned.openai_preference, OpenAIPreference::ChatCompletions);
        // A timeout is not evidence that `/responses` is missing.
        assert_eq!(learned.supports_responses, None);
        assert_eq!(endpoint.health_status(Instant::now()), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_business_error_is_terminal() {
        let backup_hits = Arc::new(AtomicUsize::new(0));
        let counter = backup_hits.clone();
        let rejecting = spawn(Router::new().route(
            "/chat/completions",
            post(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": {"message": "prompt is too long"}})),
                )
            }),
        ))
        .await;
        let backup = spawn(Router::new().route(
            "/chat/completions",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(chat_reply("gpt-4o"))
                }
            }),
        ))
        .await;
        let mut first = chat_endpoint("first", &rejecting);
        first.priority = 0;
        let mut second = chat_endpoint("second", &backup);
        second.priority = 1;
        let orchestrator = orchestrator_for(vec![first, second]);

        let err = orchestrator.handle(chat_request(json!({}))).await.unwrap_err();
        assert_eq!(err.code(), "upstream_error");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(backup_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_candidates_and_exhaustion() {
        let orchestrator = orchestrator_for(vec![anthropic_endpoint("off", "http://127.0.0.1:9")]);
        orchestrator.registry().get("off").unwrap().set_enabled(false);
        let err = orchestrator.handle(chat_request(json!({}))).await.unwrap_err();
        assert_eq!(err.code(), "no_available_endpoints");
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Nothing listens on the discard port.
        let orchestrator = orchestrator_for(vec![chat_endpoint("dead", "http://127.0.0.1:9")]);
        let err = orchestrator.handle(chat_request(json!({}))).await.unwrap_err();
        assert_eq!(err.code(), "proxy_forward_failed");
        assert!(err.to_string().contains("dead"));
    }
}
