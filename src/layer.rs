use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context as TaskContext, Poll};

use axum::extract::MatchedPath;
use http::{Extensions, HeaderMap, Request, Response};
use opentelemetry::baggage::BaggageExt;
use opentelemetry::global::{self, BoxedSpan, BoxedTracer};
use opentelemetry::propagation::{
    Extractor, Injector, TextMapCompositePropagator, TextMapPropagator,
};
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_http::HeaderInjector;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_semantic_conventions::attribute::{
    HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, HTTP_ROUTE,
};
use pin_project_lite::pin_project;
use tower::{Layer, Service};

use crate::status::SpanStatus;

/// Default request/response header carrying the serialized trace context.
pub const DEFAULT_TRACE_HEADER: &str = "sentry-trace";
/// Default request/response header carrying the serialized baggage.
pub const DEFAULT_BAGGAGE_HEADER: &str = "baggage";

/// Instrumentation scope name under which request spans are created.
const INSTRUMENTATION_SCOPE: &str = "opentelemetry-axum";

/// Propagator fields the extracted header values are presented under.
const TRACEPARENT_FIELD: &str = "traceparent";
const BAGGAGE_FIELD: &str = "baggage";

/// Baggage entry seeded for traces that start at this service, so the
/// outbound sampling context is never empty.
const BAGGAGE_TRACE_ID_KEY: &str = "trace_id";

/// Extraction function producing the raw trace-context or baggage string for
/// a request, typically by reading one of its headers.
pub type ExtractFn = Arc<dyn Fn(&HeaderMap) -> Option<String> + Send + Sync>;

/// Layer that wraps every request in an OpenTelemetry server span.
///
/// For each request the layer extracts the upstream trace context, starts a
/// span named after the method and matched route, stores it in the request
/// extensions for [`start_span_from_extensions`], writes the serialized
/// context back onto the response headers and finalizes the span with a
/// status classified from the response code (see [`SpanStatus`]).
///
/// Defaults read the [`DEFAULT_TRACE_HEADER`] and [`DEFAULT_BAGGAGE_HEADER`]
/// request headers; both the header names and the extraction functions can be
/// overridden at construction.
///
/// ## Examples
/// ```
/// use axum::{routing::get, Router};
/// use opentelemetry_axum::RequestSpanLayer;
///
/// let app: Router = Router::new()
///     .route("/users/{id}", get(|| async { "hello" }))
///     .layer(RequestSpanLayer::new());
/// ```
#[derive(Clone)]
pub struct RequestSpanLayer {
    trace_header: &'static str,
    baggage_header: &'static str,
    extract_trace: Option<ExtractFn>,
    extract_baggage: Option<ExtractFn>,
    tracer: Option<Arc<BoxedTracer>>,
}

impl Default for RequestSpanLayer {
    fn default() -> Self {
        RequestSpanLayer::new()
    }
}

impl RequestSpanLayer {
    /// Create a layer with the default header-based extraction.
    pub fn new() -> Self {
        RequestSpanLayer {
            trace_header: DEFAULT_TRACE_HEADER,
            baggage_header: DEFAULT_BAGGAGE_HEADER,
            extract_trace: None,
            extract_baggage: None,
            tracer: None,
        }
    }

    /// Replace the function that extracts the trace-context string.
    pub fn with_trace_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&HeaderMap) -> Option<String> + Send + Sync + 'static,
    {
        self.extract_trace = Some(Arc::new(extractor));
        self
    }

    /// Replace the function that extracts the baggage string.
    pub fn with_baggage_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&HeaderMap) -> Option<String> + Send + Sync + 'static,
    {
        self.extract_baggage = Some(Arc::new(extractor));
        self
    }

    /// Use a custom trace-context header name, inbound and outbound.
    ///
    /// NOTE: falls back to [`DEFAULT_TRACE_HEADER`] when the provided name is
    /// empty. The serialized value format does not depend on the name.
    pub fn with_trace_header(mut self, name: &'static str) -> Self {
        self.trace_header = if name.trim().is_empty() {
            DEFAULT_TRACE_HEADER
        } else {
            name.trim()
        };
        self
    }

    /// Use a custom baggage header name, inbound and outbound.
    ///
    /// NOTE: falls back to [`DEFAULT_BAGGAGE_HEADER`] when the provided name
    /// is empty.
    pub fn with_baggage_header(mut self, name: &'static str) -> Self {
        self.baggage_header = if name.trim().is_empty() {
            DEFAULT_BAGGAGE_HEADER
        } else {
            name.trim()
        };
        self
    }

    /// Create request spans through the given tracer instead of the globally
    /// registered provider.
    pub fn with_tracer(mut self, tracer: BoxedTracer) -> Self {
        self.tracer = Some(Arc::new(tracer));
        self
    }
}

impl fmt::Debug for RequestSpanLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSpanLayer")
            .field("trace_header", &self.trace_header)
            .field("baggage_header", &self.baggage_header)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for RequestSpanLayer {
    type Service = RequestSpanService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestSpanService {
            inner,
            config: Arc::new(Config {
                trace_header: self.trace_header,
                baggage_header: self.baggage_header,
                extract_trace: self.extract_trace.clone(),
                extract_baggage: self.extract_baggage.clone(),
                tracer: self.tracer.clone(),
                propagator: TextMapCompositePropagator::new(vec![
                    Box::new(TraceContextPropagator::new()),
                    Box::new(BaggagePropagator::new()),
                ]),
            }),
        }
    }
}

struct Config {
    trace_header: &'static str,
    baggage_header: &'static str,
    extract_trace: Option<ExtractFn>,
    extract_baggage: Option<ExtractFn>,
    tracer: Option<Arc<BoxedTracer>>,
    propagator: TextMapCompositePropagator,
}

impl Config {
    fn tracer(&self) -> Arc<BoxedTracer> {
        self.tracer
            .clone()
            .unwrap_or_else(|| Arc::new(global::tracer(INSTRUMENTATION_SCOPE)))
    }

    /// Parent context described by the inbound headers, or an empty context
    /// when they are absent or unparseable (a fresh trace, never an error).
    fn extract_parent(&self, headers: &HeaderMap) -> Context {
        let carrier = ContextCarrier {
            trace: extract_value(headers, &self.extract_trace, self.trace_header),
            baggage: extract_value(headers, &self.extract_baggage, self.baggage_header),
        };
        self.propagator
            .extract_with_context(&Context::new(), &carrier)
    }

    /// Serialized trace-context and baggage values for the response headers.
    fn serialize(&self, cx: &Context) -> (Option<String>, Option<String>) {
        let mut fields = HashMap::new();
        self.propagator.inject_context(cx, &mut fields);
        (
            fields.remove(TRACEPARENT_FIELD),
            fields.remove(BAGGAGE_FIELD),
        )
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("trace_header", &self.trace_header)
            .field("baggage_header", &self.baggage_header)
            .finish_non_exhaustive()
    }
}

fn extract_value(
    headers: &HeaderMap,
    custom: &Option<ExtractFn>,
    header: &'static str,
) -> Option<String> {
    match custom {
        Some(extractor) => extractor(headers),
        None => headers
            .get(header)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned),
    }
}

/// Presents the two extracted strings to the SDK propagators under their
/// canonical field names. The wire format of the values stays entirely the
/// SDK's concern.
struct ContextCarrier {
    trace: Option<String>,
    baggage: Option<String>,
}

impl Extractor for ContextCarrier {
    fn get(&self, key: &str) -> Option<&str> {
        match key {
            TRACEPARENT_FIELD => self.trace.as_deref(),
            BAGGAGE_FIELD => self.baggage.as_deref(),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        let mut keys = Vec::with_capacity(2);
        if self.trace.is_some() {
            keys.push(TRACEPARENT_FIELD);
        }
        if self.baggage.is_some() {
            keys.push(BAGGAGE_FIELD);
        }
        keys
    }
}

/// Middleware produced by [`RequestSpanLayer`].
#[derive(Clone, Debug)]
pub struct RequestSpanService<S> {
    inner: S,
    config: Arc<Config>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RequestSpanService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, task_cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(task_cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let tracer = self.config.tracer();
        let parent_cx = self.config.extract_parent(req.headers());

        let mut attributes = vec![KeyValue::new(HTTP_REQUEST_METHOD, req.method().to_string())];
        // Name by matched route, not raw path, to keep cardinality bounded.
        let name = match req.extensions().get::<MatchedPath>() {
            Some(path) => {
                attributes.push(KeyValue::new(HTTP_ROUTE, path.as_str().to_owned()));
                format!("{} {}", req.method(), path.as_str())
            }
            None => format!("{} {}", req.method(), req.uri().path()),
        };

        let span = tracer
            .span_builder(name)
            .with_kind(SpanKind::Server)
            .with_attributes(attributes)
            .start_with_context(tracer.as_ref(), &parent_cx);

        let mut cx = parent_cx.with_span(span);
        if cx.baggage().is_empty() {
            // Traces starting here still advertise a sampling context
            // downstream, keyed by the new trace id.
            let trace_id = cx.span().span_context().trace_id().to_string();
            cx = cx.with_baggage([KeyValue::new(BAGGAGE_TRACE_ID_KEY, trace_id)]);
        }

        let (trace_value, baggage_value) = self.config.serialize(&cx);
        req.extensions_mut().insert(ActiveSpan {
            cx: cx.clone(),
            tracer,
        });

        ResponseFuture {
            inner: self.inner.call(req),
            finalize: Some(FinalizeSpan {
                cx,
                config: Arc::clone(&self.config),
                trace_value,
                baggage_value,
            }),
        }
    }
}

pin_project! {
    /// Response future for [`RequestSpanService`].
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        finalize: Option<FinalizeSpan>,
    }
}

impl<F> fmt::Debug for ResponseFuture<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseFuture")
    }
}

impl<F, B, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = Result<Response<B>, E>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match ready!(this.inner.poll(task_cx)) {
            Ok(mut response) => {
                if let Some(finalize) = this.finalize.take() {
                    finalize.finalize(&mut response);
                }
                Poll::Ready(Ok(response))
            }
            // Downstream failures are the host framework's to report; the
            // span is dropped without an explicit end.
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

struct FinalizeSpan {
    cx: Context,
    config: Arc<Config>,
    trace_value: Option<String>,
    baggage_value: Option<String>,
}

impl FinalizeSpan {
    /// Write propagation headers, classify the final status and end the span.
    fn finalize<B>(self, response: &mut Response<B>) {
        let mut injector = HeaderInjector(response.headers_mut());
        if let Some(value) = self.trace_value {
            injector.set(self.config.trace_header, value);
        }
        if let Some(value) = self.baggage_value {
            injector.set(self.config.baggage_header, value);
        }

        let status = SpanStatus::from(response.status());
        let span = self.cx.span();
        span.set_attribute(KeyValue::new(
            HTTP_RESPONSE_STATUS_CODE,
            i64::from(response.status().as_u16()),
        ));
        span.set_status(status.into());
        span.end();
    }
}

/// The per-request root span, stored in the request extensions by
/// [`RequestSpanService`].
#[derive(Clone, Debug)]
pub struct ActiveSpan {
    cx: Context,
    tracer: Arc<BoxedTracer>,
}

impl ActiveSpan {
    /// Tracing context holding the request's root span.
    pub fn context(&self) -> &Context {
        &self.cx
    }
}

/// Start a span for a sub-operation of the current request.
///
/// The span is nested under the request's root span when the extensions carry
/// one, i.e. the request went through [`RequestSpanLayer`]. Otherwise the
/// returned span starts a detached trace of its own. In both cases the caller
/// owns the span and must end it.
///
/// ## Examples
/// ```
/// use axum::extract::Request;
/// use opentelemetry::trace::Span;
/// use opentelemetry_axum::start_span_from_extensions;
///
/// async fn handler(req: Request) -> &'static str {
///     let mut span = start_span_from_extensions(req.extensions(), "load_user");
///     // ... the sub-operation ...
///     span.end();
///     "hello"
/// }
/// ```
pub fn start_span_from_extensions<T>(extensions: &Extensions, op: T) -> BoxedSpan
where
    T: Into<Cow<'static, str>>,
{
    match extensions.get::<ActiveSpan>() {
        Some(active) => active.tracer.start_with_context(op, &active.cx),
        None => global::tracer(INSTRUMENTATION_SCOPE).start_with_context(op, &Context::new()),
    }
}
