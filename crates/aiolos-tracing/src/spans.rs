//! Span builder helpers for gateway instrumentation.

/// Create the span covering one inbound CoAP request.
///
/// Usage: `let span = coap_request_span!(request_id, method, path);`
///
/// Fields recorded once the pipeline finishes:
/// - `route`: the matched path template, if any
/// - `code`: the CoAP response code sent back (e.g. `2.04`)
/// - `latency_ms`: time from datagram decode to response encode
#[macro_export]
macro_rules! coap_request_span {
    ($request_id:expr, $method:expr, $path:expr) => {
        tracing::info_span!(
            "coap_request",
            request_id = %$request_id,
            method = %$method,
            path = %$path,
            route = tracing::field::Empty,
            code = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}

/// Create a span for the outbound call to the telemetry backend.
#[macro_export]
macro_rules! backend_forward_span {
    ($request_id:expr, $target:expr) => {
        tracing::info_span!(
            "backend_forward",
            request_id = %$request_id,
            target = %$target,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}
