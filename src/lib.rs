//! Axum instrumentation for OpenTelemetry.
//!
//! This crate bridges [axum]'s request pipeline and the OpenTelemetry tracing
//! API: every request handled by an instrumented router is wrapped in one
//! server span that continues the trace described by the inbound
//! trace-context headers (or starts a fresh one), is named after the matched
//! route, carries the HTTP semantic-convention attributes, and is finalized
//! with a status classified from the response code. The serialized trace
//! context and baggage are written back onto the response headers so callers
//! and downstream proxies can correlate.
//!
//! Parsing and serialization of the propagated values is delegated entirely
//! to the SDK propagators; this crate only decides *where* the strings are
//! read from and written to. The default header names are
//! [`DEFAULT_TRACE_HEADER`] and [`DEFAULT_BAGGAGE_HEADER`], both overridable
//! at construction.
//!
//! # Components
//!
//! - [`RequestSpanLayer`]: the tower layer installing the middleware.
//! - [`start_span_from_extensions`]: creates child spans for sub-operations
//!   inside handlers.
//! - [`SpanStatus`]: the HTTP status classification attached to finished
//!   request spans.
//!
//! ## Quick start
//! ```no_run
//! use axum::{routing::get, Router};
//! use opentelemetry::global;
//! use opentelemetry_axum::RequestSpanLayer;
//! use opentelemetry_sdk::trace::SdkTracerProvider;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     // Tracer provider setup is the application's responsibility; a
//!     // failure here is fatal for startup.
//!     let provider = SdkTracerProvider::builder().build();
//!     global::set_tracer_provider(provider.clone());
//!
//!     let app = Router::new()
//!         .route("/users/{id}", get(|| async { "hello" }))
//!         .layer(RequestSpanLayer::new());
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//!     axum::serve(listener, app).await?;
//!
//!     provider.shutdown()?;
//!     Ok(())
//! }
//! ```
//!
//! [axum]: https://docs.rs/axum/latest/axum/
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(test, deny(warnings))]

mod layer;
mod status;

pub use layer::{
    start_span_from_extensions, ActiveSpan, ExtractFn, RequestSpanLayer, RequestSpanService,
    ResponseFuture, DEFAULT_BAGGAGE_HEADER, DEFAULT_TRACE_HEADER,
};
pub use status::SpanStatus;
