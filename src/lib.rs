//! Actix-web middleware for request-scoped structured logging and panic recovery.
//!
//! [`RequestLogger`] derives a [`Logger`] for every request, pre-populated with
//! the request's id, protocol, method, path, query, peer address, user agent and
//! referer. Handlers retrieve it with [`get`] or the [`Logger`] extractor, and the
//! middleware writes one access log record per completed request.
//!
//! [`Recoverer`] catches panics raised by the handlers it wraps, logs them through
//! the request's [`Logger`] and answers with `500 Internal Server Error` instead of
//! taking the worker down. Panics caused by a client that went away (broken pipe,
//! connection reset) are logged without a stack trace.
//!
//! Records go through the standard `log` crate with its key/value support, so any
//! structured `log` backend works.
//!
//! # Examples:
//! ```bash
//! cargo add actix-web-middleware-reqlog
//! ```
//! Example usage with `structured_logger` crate:
//! ```rust,no_run
//! use actix_web::{web, App, HttpResponse, HttpServer};
//! use actix_web_middleware_reqlog::{Field, Logger, Recoverer, RequestIdentifier, RequestLogger};
//! use structured_logger::{Builder, async_json::new_writer};
//!
//! async fn create_user(log: Logger) -> HttpResponse {
//!     log.info("creating user", [Field::new("plan", "free")]);
//!     HttpResponse::Created().finish()
//! }
//!
//! #[actix_web::main] // or #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     Builder::new()
//!         .with_target_writer("*", new_writer(tokio::io::stdout()))
//!         .init();
//!
//!     let logger = Logger::new("http").with("service", "users");
//!
//!     HttpServer::new(move || {
//!         App::new()
//!             .wrap(Recoverer::default())
//!             .wrap(RequestLogger::new(logger.clone()).exclude("/health"))
//!             .wrap(RequestIdentifier::default())
//!             .route("/health", web::get().to(|| async { HttpResponse::Ok().finish() }))
//!             .route("/users", web::post().to(create_user))
//!     })
//!     .bind("127.0.0.1:8080")?
//!     .run()
//!     .await
//! }
//! ```
//!
//! # Ordering
//!
//! The last `.wrap()` call is the outermost middleware. `Recoverer` must sit
//! inside `RequestLogger`, and a request id provider such as
//! [`RequestIdentifier`] (or `TracingLogger` with the `tracing-request-id`
//! feature) must sit outside of it.
//!
//! # Access log record
//!
//! Message `"<method> <path>"` at `Info` level with the request logger's fields
//! and:
//!
//! - `status` - Response status code
//! - `bytes_written` - Response body size in bytes
//! - `latency` - Time from the request entering the middleware to the body being
//!   written
//!
//! Paths starting with a prefix given to [`RequestLogger::exclude`], or matching
//! a pattern given to [`RequestLogger::exclude_regex`], get no access record. They
//! still get a request logger.
//!
//! # Feature Flags
//!
//! - `uuid_v4` (default) - Generate UUIDv4 request ids in [`RequestIdentifier`]
//! - `uuid_v7` - Use UUIDv7 instead of UUIDv4 for request ids
//! - `tracing-request-id` - Log the request id set by `tracing-actix-web`'s
//!   `TracingLogger`

mod context;
mod failure;
mod logger;
mod recoverer;
mod request_id;
mod sink;
mod wrapper;

#[cfg(test)]
mod testing;

pub use crate::context::{get, try_get};
pub use crate::failure::{FailureKind, NetworkError, classify, is_broken_connection};
pub use crate::logger::{ObservedBody, RequestLogger};
pub use crate::recoverer::{BodyPanic, GuardedBody, RecoveredPanic, Recoverer};
pub use crate::request_id::{RequestId, RequestIdentifier};
pub use crate::sink::{Field, Logger, Value};
