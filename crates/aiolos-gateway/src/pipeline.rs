//! Per-request pipeline: method check, route resolve, JSON decode, validate, forward.
//!
//! Each stage either advances or short-circuits to a terminal [`Outcome`], and
//! every outcome maps to exactly one CoAP response. The pipeline holds only
//! immutable shared state, so any number of requests run through it at once.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use opentelemetry::Key;
use serde::Serialize;
use serde_json::Value;
use tracing::{Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::coap::{Code, Message};
use crate::endpoints::ValidationError;
use crate::proxy::{correlation, Forward};
use crate::routing::{PathParams, RouteRegistry};
use crate::stats::GatewayStats;

/// A decoded CoAP request, reduced to what the pipeline needs.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Code,
    /// `None` when the Uri-Path options do not form a valid path.
    pub path: Option<String>,
    pub body: Bytes,
}

impl IncomingRequest {
    pub fn from_message(message: &Message) -> Self {
        Self {
            method: message.code,
            path: message.uri_path().ok(),
            body: message.payload.clone(),
        }
    }
}

/// Per-request state, filled in as stages complete. Dropped with the response.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Code,
    pub path: Option<String>,
    pub body: Bytes,
    pub json: Option<Value>,
    pub params: Option<PathParams>,
}

impl RequestContext {
    fn new(request: IncomingRequest) -> Self {
        Self {
            request_id: correlation::generate_id(),
            method: request.method,
            path: request.path,
            body: request.body,
            json: None,
            params: None,
        }
    }
}

/// Terminal state of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    MethodNotAllowed,
    RouteNotFound,
    MalformedPayload,
    InvalidPayload,
    ForwardFailure,
    HandlerException,
}

impl Outcome {
    pub const COUNT: usize = 7;

    pub fn code(self) -> Code {
        match self {
            Outcome::Accepted => Code::CHANGED,
            Outcome::MethodNotAllowed => Code::METHOD_NOT_ALLOWED,
            Outcome::RouteNotFound => Code::NOT_FOUND,
            Outcome::MalformedPayload | Outcome::InvalidPayload => Code::BAD_REQUEST,
            Outcome::ForwardFailure => Code::BAD_GATEWAY,
            Outcome::HandlerException => Code::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(self) -> &'static str {
        match self {
            Outcome::Accepted => "OK",
            Outcome::MethodNotAllowed => "Method Not Allowed",
            Outcome::RouteNotFound => "Not Found",
            Outcome::MalformedPayload => "Malformed JSON",
            Outcome::InvalidPayload => "Invalid payload",
            Outcome::ForwardFailure => "Bad Gateway",
            Outcome::HandlerException => "Internal Server Error",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// What the device gets back: a response code and a short diagnostic body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub outcome: Outcome,
    pub code: Code,
    pub body: String,
}

impl GatewayResponse {
    pub fn invalid(err: &ValidationError) -> Self {
        Self {
            outcome: Outcome::InvalidPayload,
            code: Outcome::InvalidPayload.code(),
            body: format!("Invalid payload: {err}"),
        }
    }
}

impl From<Outcome> for GatewayResponse {
    fn from(outcome: Outcome) -> Self {
        Self {
            outcome,
            code: outcome.code(),
            body: outcome.body().to_string(),
        }
    }
}

/// The request pipeline, built once at startup and shared by every request task.
pub struct RequestPipeline<F> {
    registry: RouteRegistry,
    forwarder: F,
    stats: Arc<GatewayStats>,
}

impl<F: Forward> RequestPipeline<F> {
    pub fn new(registry: RouteRegistry, forwarder: F, stats: Arc<GatewayStats>) -> Self {
        Self {
            registry,
            forwarder,
            stats,
        }
    }

    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<GatewayStats> {
        &self.stats
    }

    /// Run one request to its terminal outcome. Never fails: every fault is
    /// folded into the returned response.
    pub async fn handle(&self, request: IncomingRequest) -> GatewayResponse {
        let mut ctx = RequestContext::new(request);
        let method = ctx
            .method
            .method_name()
            .map(str::to_string)
            .unwrap_or_else(|| ctx.method.to_string());
        let path = ctx.path.as_deref().unwrap_or("<invalid>");
        let span = aiolos_tracing::coap_request_span!(ctx.request_id, method, path);
        let start = Instant::now();

        let response = self.process(&mut ctx).instrument(span.clone()).await;

        let latency = start.elapsed().as_millis() as u64;
        span.record("code", tracing::field::display(response.code));
        span.record("latency_ms", latency);
        if response.outcome == Outcome::Accepted {
            span.in_scope(|| tracing::info!(latency_ms = latency, "Request accepted"));
        }

        self.stats.record(response.outcome);
        response
    }

    async fn process(&self, ctx: &mut RequestContext) -> GatewayResponse {
        if ctx.method != Code::POST {
            tracing::warn!(method = %ctx.method, "Rejected: method not allowed");
            return Outcome::MethodNotAllowed.into();
        }

        let Some(path) = ctx.path.clone() else {
            tracing::warn!("Rejected: Uri-Path is not a valid path");
            return Outcome::RouteNotFound.into();
        };
        let Some(matched) = self.registry.resolve(&path) else {
            tracing::warn!(path = %path, "Rejected: no route matches");
            return Outcome::RouteNotFound.into();
        };
        let route = matched.route;
        Span::current().record("route", route.template().as_str());
        let params = ctx.params.insert(matched.params);

        let payload = match serde_json::from_slice::<Value>(&ctx.body) {
            Ok(value) => ctx.json.insert(value),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Rejected: malformed JSON");
                return Outcome::MalformedPayload.into();
            }
        };

        let (payload, params) = (&*payload, &*params);
        let validator = route.validator();
        match catch_unwind(AssertUnwindSafe(|| validator(payload, params))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                report_validation_failure(&err);
                tracing::warn!(
                    path = %path,
                    params = %params,
                    error = %err,
                    "Rejected: invalid payload"
                );
                return GatewayResponse::invalid(&err);
            }
            Err(panic) => {
                tracing::error!(
                    path = %path,
                    route = %route.template(),
                    panic = panic_message(&*panic),
                    "Validator panicked"
                );
                return Outcome::HandlerException.into();
            }
        }

        let target = match route.target_for(params) {
            Ok(target) => target,
            Err(e) => {
                tracing::error!(route = %route.template(), error = %e, "Target path could not be rendered");
                return Outcome::HandlerException.into();
            }
        };

        match self.forwarder.forward(&target, payload, &ctx.request_id).await {
            Ok(()) => Outcome::Accepted.into(),
            Err(e) => {
                tracing::error!(
                    path = %path,
                    params = %params,
                    target = %target,
                    error = %e,
                    "Forward failed"
                );
                Outcome::ForwardFailure.into()
            }
        }
    }
}

fn report_validation_failure(err: &ValidationError) {
    let span = Span::current();
    if let Some(field) = err.field() {
        span.set_attribute(
            Key::from_static_str("gateway.validation.field"),
            opentelemetry::Value::String(field.into()),
        );
    }
    span.set_attribute(
        Key::from_static_str("gateway.validation.reason"),
        opentelemetry::Value::String(err.reason().into()),
    );
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
