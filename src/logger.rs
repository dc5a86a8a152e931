use std::{
    future::Future,
    marker::PhantomData,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
    time::Instant,
};

use bytes::Bytes;
use futures_core::ready;
use pin_project_lite::pin_project;
use regex::Regex;

use actix_service::{Service, Transform};
use actix_utils::future::{Ready, ready};
use actix_web::body::{BodySize, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::{Error, Result};

use crate::context;
use crate::request_id;
use crate::sink::{Field, Logger, Value};

/// Middleware that stores a request-scoped [`Logger`] in every request and
/// writes one access log record per completed request.
///
/// The stored logger is derived from the base sink with these fields:
/// - `request_id` - id set by an upstream provider such as
///   [`RequestIdentifier`](crate::RequestIdentifier), empty otherwise
/// - `proto` - HTTP protocol version. Example: HTTP/1.1
/// - `method` - Example: GET
/// - `path` - Example: /api/users
/// - `query` - raw query string. Example: page=2
/// - `remote` - peer socket address. Example: 127.0.0.1:51234
/// - `user_agent`
/// - `referer`
///
/// Retrieve it downstream with [`get`](crate::get) or the [`Logger`]
/// extractor.
///
/// The access log record is emitted at `Info` level with the message
/// `"<method> <path>"` and the fields `status`, `bytes_written` and
/// `latency`, once the response body has been written.
///
/// # Examples
/// ```rust
/// use actix_web::App;
/// use actix_web_middleware_reqlog::{Logger, Recoverer, RequestLogger};
///
/// let app = App::new()
///     .wrap(Recoverer::default())
///     .wrap(RequestLogger::new(Logger::new("http")).exclude("/health"));
/// ```
#[derive(Clone)]
pub struct RequestLogger(Rc<Inner>);

#[derive(Debug, Clone)]
struct Inner {
    logger: Logger,
    exclude: Vec<String>,
    exclude_regex: Vec<Regex>,
}

impl RequestLogger {
    /// Create `RequestLogger` middleware deriving request loggers from
    /// `logger`.
    pub fn new(logger: Logger) -> RequestLogger {
        RequestLogger(Rc::new(Inner {
            logger,
            exclude: Vec::new(),
            exclude_regex: Vec::new(),
        }))
    }

    /// Do not write access records for paths starting with `prefix`.
    ///
    /// The match is a plain, case-sensitive string prefix: `/health` also
    /// excludes `/healthz`. The request logger is still stored.
    pub fn exclude<T: Into<String>>(mut self, prefix: T) -> Self {
        Rc::make_mut(&mut self.0).exclude.push(prefix.into());
        self
    }

    /// Do not write access records for paths that match `regex`.
    pub fn exclude_regex(mut self, regex: Regex) -> Self {
        Rc::make_mut(&mut self.0).exclude_regex.push(regex);
        self
    }
}

impl Inner {
    fn is_excluded(&self, path: &str) -> bool {
        self.exclude.iter().any(|prefix| path.starts_with(prefix.as_str()))
            || self.exclude_regex.iter().any(|r| r.is_match(path))
    }
}

impl Default for RequestLogger {
    /// Create `RequestLogger` middleware over [`Logger::default`] with no
    /// exclusions.
    fn default() -> Self {
        RequestLogger::new(Logger::default())
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequestLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<ObservedBody<B>>;
    type Error = Error;
    type Transform = RequestLoggerMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggerMiddlewareService {
            service,
            inner: Rc::clone(&self.0),
        }))
    }
}

/// Data needed to write the access record once the response is done.
struct Completion {
    logger: Logger,
    message: String,
    start: Instant,
    status: u16,
}

impl Completion {
    fn emit(self, size: usize) {
        self.logger.info(
            self.message,
            [
                Field::new("status", self.status),
                Field::new("bytes_written", size),
                Field::new("latency", self.start.elapsed()),
            ],
        );
    }
}

pin_project! {
    /// Response body wrapper counting the bytes written. Writes the access
    /// record when dropped.
    pub struct ObservedBody<B> {
        #[pin]
        body: B,
        completion: Option<Completion>,
        size: usize,
    }

    impl<B> PinnedDrop for ObservedBody<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(completion) = this.completion.take() {
                completion.emit(*this.size);
            }
        }
    }
}

impl<B: MessageBody> MessageBody for ObservedBody<B> {
    type Error = B::Error;

    #[inline]
    fn size(&self) -> BodySize {
        self.body.size()
    }

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.project();

        match ready!(this.body.poll_next(cx)) {
            Some(Ok(chunk)) => {
                *this.size += chunk.len();
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => Poll::Ready(None),
        }
    }
}

/// Fields every request logger carries, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestField {
    /// Example: 7b77f3f1-8e15-4b6a-9b3f-7f4b6f4b6f4b
    RequestId,
    /// Example: HTTP/1.1
    Proto,
    /// Example: GET
    Method,
    /// Example: /index.html
    Path,
    /// Example: search=actix
    Query,
    /// Example: 192.168.0.1:41234
    Remote,
    /// Example: Mozilla/5.0
    UserAgent,
    /// Example: https://actix.rs
    Referer,
}

impl RequestField {
    const ALL: [RequestField; 8] = [
        RequestField::RequestId,
        RequestField::Proto,
        RequestField::Method,
        RequestField::Path,
        RequestField::Query,
        RequestField::Remote,
        RequestField::UserAgent,
        RequestField::Referer,
    ];

    fn render(self, req: &ServiceRequest) -> Field {
        match self {
            RequestField::RequestId => Field::new("request_id", request_id::current(req)),
            RequestField::Proto => Field::new("proto", protocol(req.version())),
            RequestField::Method => Field::new("method", req.method().to_string()),
            RequestField::Path => Field::new("path", req.path().to_string()),
            RequestField::Query => Field::new("query", req.query_string().to_string()),
            RequestField::Remote => Field::new(
                "remote",
                req.peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_default(),
            ),
            RequestField::UserAgent => Field::new("user_agent", header(req, "user-agent")),
            RequestField::Referer => Field::new("referer", header(req, "referer")),
        }
    }
}

pub(crate) fn protocol(version: actix_http::Version) -> &'static str {
    match version {
        actix_http::Version::HTTP_09 => "HTTP/0.9",
        actix_http::Version::HTTP_10 => "HTTP/1.0",
        actix_http::Version::HTTP_11 => "HTTP/1.1",
        actix_http::Version::HTTP_2 => "HTTP/2.0",
        actix_http::Version::HTTP_3 => "HTTP/3.0",
        _ => "unknown",
    }
}

fn header(req: &ServiceRequest, name: &str) -> String {
    req.headers()
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
}

/// Request logger middleware service.
pub struct RequestLoggerMiddlewareService<S> {
    inner: Rc<Inner>,
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestLoggerMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<ObservedBody<B>>;
    type Error = Error;
    type Future = RequestLoggerResponse<S, B>;

    actix_service::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let excluded = self.inner.is_excluded(req.path());
        let start = (!excluded).then(Instant::now);

        let logger = self
            .inner
            .logger
            .with_fields(RequestField::ALL.iter().map(|field| field.render(&req)));
        context::set(&req, logger.clone());

        let pending = start.map(|start| PendingCompletion {
            logger,
            message: format!("{} {}", req.method(), req.path()),
            start,
        });

        RequestLoggerResponse {
            fut: self.service.call(req),
            pending,
            _phantom: PhantomData,
        }
    }
}

struct PendingCompletion {
    logger: Logger,
    message: String,
    start: Instant,
}

pin_project! {
    pub struct RequestLoggerResponse<S, B>
    where
        B: MessageBody,
        S: Service<ServiceRequest>,
    {
        #[pin]
        fut: S::Future,
        pending: Option<PendingCompletion>,
        _phantom: PhantomData<B>,
    }
}

impl<S, B> Future for RequestLoggerResponse<S, B>
where
    B: MessageBody,
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    type Output = Result<ServiceResponse<ObservedBody<B>>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let res = match ready!(this.fut.poll(cx)) {
            Ok(res) => res,
            Err(err) => return Poll::Ready(Err(err)),
        };

        let completion = this.pending.take().map(|pending| {
            if let Some(error) = res.response().error() {
                pending
                    .logger
                    .debug("error in response", [Field::new("error", Value::any(error))]);
            }
            Completion {
                logger: pending.logger,
                message: pending.message,
                start: pending.start,
                status: res.status().as_u16(),
            }
        });

        Poll::Ready(Ok(res.map_body(move |_, body| ObservedBody {
            body,
            completion,
            size: 0,
        })))
    }
}
