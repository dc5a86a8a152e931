use std::{
    any::Any,
    error::Error as StdError,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use pin_project_lite::pin_project;

use actix_service::{Service, Transform};
use actix_utils::future::{Ready, ready};
use actix_web::body::{BodySize, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::HeaderMap;
use actix_web::http::{Method, StatusCode, Uri, Version};
use actix_web::{Error, HttpResponse, ResponseError};

use crate::context;
use crate::failure::{self, FailureKind};
use crate::logger::protocol;
use crate::sink::{Field, Logger, Value};

/// Middleware that recovers from panics raised while a request is handled
/// and logs them with the request logger stored by
/// [`RequestLogger`](crate::RequestLogger).
///
/// `Recoverer` must be wrapped inside `RequestLogger`. Recovering a panic on
/// a request without a stored logger panics again, outside of any guard.
///
/// A panic whose payload is a [`NetworkError`](crate::NetworkError) or
/// [`std::io::Error`] mentioning a broken pipe or a connection reset is
/// logged without a stack trace and answered with an empty response that
/// closes the connection. Any other panic is logged with its stack trace and
/// answered with `500 Internal Server Error`. Both outcomes surface as a
/// [`RecoveredPanic`] error.
///
/// Panics raised while the response body is streamed are logged the same way;
/// the stream is then aborted with a [`BodyPanic`] error since the status line
/// is already gone.
///
/// # Examples
/// ```rust
/// use actix_web::App;
/// use actix_web_middleware_reqlog::{Recoverer, RequestLogger};
///
/// let app = App::new()
///     .wrap(Recoverer::default())
///     .wrap(RequestLogger::default());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Recoverer;

impl<S, B> Transform<S, ServiceRequest> for Recoverer
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<GuardedBody<B>>;
    type Error = Error;
    type Transform = RecovererMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        failure::install_hook();
        ready(Ok(RecovererMiddlewareService { service }))
    }
}

/// Outcome of a recovered panic.
#[derive(Debug, thiserror::Error)]
#[error("recovered from panic: {error}")]
pub struct RecoveredPanic {
    kind: FailureKind,
    error: String,
}

impl RecoveredPanic {
    /// Classification that decided how the panic was logged and answered.
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Rendered panic payload.
    pub fn error(&self) -> &str {
        &self.error
    }
}

impl ResponseError for RecoveredPanic {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn error_response(&self) -> HttpResponse {
        let mut res = HttpResponse::build(self.status_code());
        if self.kind == FailureKind::BrokenConnection {
            res.force_close();
        }
        res.finish()
    }
}

/// Error ending a response body stream that panicked.
#[derive(Debug, thiserror::Error)]
#[error("panic while writing response body")]
pub struct BodyPanic(#[source] pub RecoveredPanic);

/// What the recoverer knows about a request once it was handed over.
struct Guard {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    logger: Option<Logger>,
}

impl Guard {
    fn new(req: &ServiceRequest) -> Self {
        Guard {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
            logger: context::try_get(req),
        }
    }

    /// Request line and headers, without the body.
    fn dump(&self) -> String {
        let target = self
            .uri
            .path_and_query()
            .map_or_else(|| self.uri.path(), |pq| pq.as_str());
        let mut out = format!("{} {} {}\r\n", self.method, target, protocol(self.version));

        let mut headers: Vec<_> = self.headers.iter().collect();
        headers.sort_by(|(a, _), (b, _)| {
            (a.as_str() != "host")
                .cmp(&(b.as_str() != "host"))
                .then_with(|| a.as_str().cmp(b.as_str()))
        });
        for (name, value) in headers {
            out.push_str(&format!(
                "{}: {}\r\n",
                name,
                String::from_utf8_lossy(value.as_bytes())
            ));
        }

        out.push_str("\r\n");
        out
    }

    fn report(&self, payload: Box<dyn Any + Send>) -> RecoveredPanic {
        let kind = failure::classify(&*payload);
        let stack = failure::take_backtrace();
        let error = failure::describe(&*payload);

        let logger = match &self.logger {
            Some(logger) => logger,
            None => context::missing(),
        };

        let message = format!("{} {}", self.method, self.uri.path());
        let error_field = Field::new("error", Value::Any(error.clone()));
        let request_field = Field::new("request", self.dump());

        match kind {
            FailureKind::BrokenConnection => logger.error(message, [error_field, request_field]),
            FailureKind::Generic => logger.error(
                format!("{message} Recovered from panic"),
                [error_field, request_field, Field::new("stack", stack)],
            ),
        }

        RecoveredPanic { kind, error }
    }
}

/// Panic recovery middleware service.
pub struct RecovererMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RecovererMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<GuardedBody<B>>;
    type Error = Error;
    type Future = RecovererResponse<S, B>;

    actix_service::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let guard = Guard::new(&req);

        match failure::guarded(|| self.service.call(req)) {
            Ok(fut) => RecovererResponse {
                fut: Some(fut),
                guard: Some(guard),
                payload: None,
                _phantom: PhantomData,
            },
            Err(payload) => RecovererResponse {
                fut: None,
                guard: Some(guard),
                payload: Some(payload),
                _phantom: PhantomData,
            },
        }
    }
}

pin_project! {
    pub struct RecovererResponse<S, B>
    where
        B: MessageBody,
        S: Service<ServiceRequest>,
    {
        #[pin]
        fut: Option<S::Future>,
        guard: Option<Guard>,
        payload: Option<Box<dyn Any + Send>>,
        _phantom: PhantomData<B>,
    }
}

fn take_guard(guard: &mut Option<Guard>) -> Guard {
    guard
        .take()
        .unwrap_or_else(|| panic!("RecovererResponse polled after completion"))
}

impl<S, B> Future for RecovererResponse<S, B>
where
    B: MessageBody,
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    type Output = Result<ServiceResponse<GuardedBody<B>>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let polled = match (this.fut.as_pin_mut(), this.payload.take()) {
            (_, Some(payload)) => Err(payload),
            (Some(fut), None) => failure::guarded(|| fut.poll(cx)),
            (None, None) => panic!("RecovererResponse polled after completion"),
        };

        match polled {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(Ok(res))) => {
                let guard = take_guard(this.guard);
                Poll::Ready(Ok(res.map_body(move |_, body| GuardedBody {
                    body,
                    guard,
                    done: false,
                })))
            }
            Ok(Poll::Ready(Err(err))) => Poll::Ready(Err(err)),
            Err(payload) => {
                let recovered = take_guard(this.guard).report(payload);
                Poll::Ready(Err(recovered.into()))
            }
        }
    }
}

pin_project! {
    /// Response body wrapper recovering from panics raised while the body is
    /// streamed.
    pub struct GuardedBody<B> {
        #[pin]
        body: B,
        guard: Guard,
        done: bool,
    }
}

impl<B: MessageBody> MessageBody for GuardedBody<B> {
    type Error = Box<dyn StdError>;

    #[inline]
    fn size(&self) -> BodySize {
        self.body.size()
    }

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        let body = this.body;
        match failure::guarded(|| body.poll_next(cx)) {
            Ok(poll) => poll.map(|chunk| chunk.map(|res| res.map_err(Into::into))),
            Err(payload) => {
                *this.done = true;
                let err: Self::Error = Box::new(BodyPanic(this.guard.report(payload)));
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NetworkError, RequestLogger, testing};
    use actix_web::{
        App, HttpRequest, Responder,
        body::to_bytes,
        test::{self, TestRequest},
        web,
    };
    use std::{convert::Infallible, hint::black_box, panic};

    fn app_logger(target: &'static str) -> RequestLogger {
        RequestLogger::new(Logger::new(target))
    }

    async fn out_of_bounds() -> impl Responder {
        let items: Vec<u8> = Vec::new();
        let item = items[black_box(3)];
        HttpResponse::Ok().body(item.to_string())
    }

    async fn broken_pipe() -> HttpResponse {
        panic::panic_any(NetworkError::new(
            "write tcp 10.0.0.1:80->10.0.0.2:51234: write: Broken Pipe",
        ))
    }

    async fn fine(req: HttpRequest) -> impl Responder {
        HttpResponse::Ok().body(req.path().to_string())
    }

    #[actix_web::test]
    async fn test_generic_panic() {
        testing::init();
        let app = test::init_service(
            App::new()
                .wrap(Recoverer)
                .wrap(app_logger("recoverer_generic"))
                .route("/items", web::get().to(out_of_bounds)),
        )
        .await;

        let req = TestRequest::get()
            .uri("/items?id=3")
            .insert_header(("user-agent", "curl/8.0"))
            .to_request();
        let err = match app.call(req).await {
            Ok(_) => panic!("expected recovered panic"),
            Err(err) => err,
        };

        let recovered = err.as_error::<RecoveredPanic>().unwrap();
        assert_eq!(recovered.kind(), FailureKind::Generic);
        assert!(recovered.error().contains("index out of bounds"));
        let res = err.error_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

        // the access record is skipped, only the error is logged
        let records = testing::records("recoverer_generic");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.level, log::Level::Error);
        assert_eq!(record.message, "GET /items Recovered from panic");
        assert!(record.field("error").unwrap().contains("index out of bounds"));
        assert!(!record.field("stack").unwrap().is_empty());
        let request = record.field("request").unwrap();
        assert!(request.starts_with("GET /items?id=3 HTTP/1.1\r\n"));
        assert!(request.contains("user-agent: curl/8.0\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
        assert_eq!(record.field("path"), Some("/items"));
    }

    #[actix_web::test]
    async fn test_broken_connection() {
        testing::init();
        let app = test::init_service(
            App::new()
                .wrap(Recoverer)
                .wrap(app_logger("recoverer_broken"))
                .route("/stream", web::get().to(broken_pipe)),
        )
        .await;

        let req = TestRequest::get().uri("/stream").to_request();
        let err = match app.call(req).await {
            Ok(_) => panic!("expected recovered panic"),
            Err(err) => err,
        };

        let recovered = err.as_error::<RecoveredPanic>().unwrap();
        assert_eq!(recovered.kind(), FailureKind::BrokenConnection);
        let body = to_bytes(err.error_response().into_body()).await.unwrap();
        assert!(body.is_empty());

        let records = testing::records("recoverer_broken");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.level, log::Level::Error);
        assert_eq!(record.message, "GET /stream");
        assert!(record.field("error").unwrap().contains("Broken Pipe"));
        assert!(record.field("request").is_some());
        assert_eq!(record.field("stack"), None);
    }

    #[actix_web::test]
    async fn test_transparent_on_success() {
        testing::init();
        let app = test::init_service(
            App::new()
                .wrap(Recoverer)
                .wrap(app_logger("recoverer_success"))
                .route("/ok", web::get().to(fine)),
        )
        .await;

        let req = TestRequest::get().uri("/ok").to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(test::read_body(res).await, "/ok");

        let records = testing::records("recoverer_success");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, log::Level::Info);
        assert_eq!(records[0].field("status"), Some("200"));
        assert_eq!(records[0].field("bytes_written"), Some("3"));
    }

    #[actix_web::test]
    async fn test_panic_in_call() {
        testing::init();
        let inner = actix_service::fn_service(
            |_: ServiceRequest| -> Ready<Result<ServiceResponse, Error>> {
                panic!("routing exploded")
            },
        );
        let svc = Recoverer.new_transform(inner).await.unwrap();

        let req = TestRequest::get().uri("/sync").to_srv_request();
        context::set(&req, Logger::new("recoverer_call"));
        let err = match svc.call(req).await {
            Ok(_) => panic!("expected recovered panic"),
            Err(err) => err,
        };
        assert_eq!(err.as_response_error().status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let records = testing::records("recoverer_call");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "GET /sync Recovered from panic");
        assert_eq!(records[0].field("error"), Some("routing exploded"));
    }

    struct Exploding;

    impl MessageBody for Exploding {
        type Error = Infallible;

        fn size(&self) -> BodySize {
            BodySize::Stream
        }

        fn poll_next(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
        ) -> Poll<Option<Result<Bytes, Self::Error>>> {
            panic!("body exploded")
        }
    }

    #[actix_web::test]
    async fn test_panic_in_body() {
        testing::init();
        let app = test::init_service(
            App::new()
                .wrap(Recoverer)
                .wrap(app_logger("recoverer_body"))
                .route(
                    "/download",
                    web::get().to(|| async { HttpResponse::Ok().body(Exploding) }),
                ),
        )
        .await;

        let req = TestRequest::get().uri("/download").to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        let err = to_bytes(res.into_body()).await.unwrap_err();
        assert_eq!(err.to_string(), "panic while writing response body");

        let records = testing::records("recoverer_body");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, log::Level::Error);
        assert_eq!(records[0].message, "GET /download Recovered from panic");
        assert_eq!(records[0].field("error"), Some("body exploded"));
        // the head was already sent, the access record still reports it
        assert_eq!(records[1].level, log::Level::Info);
        assert_eq!(records[1].field("status"), Some("200"));
        assert_eq!(records[1].field("bytes_written"), Some("0"));
    }

    #[actix_web::test]
    #[should_panic(expected = "request logger missing")]
    async fn test_missing_request_logger() {
        let app = test::init_service(
            App::new()
                .wrap(Recoverer)
                .route("/items", web::get().to(out_of_bounds)),
        )
        .await;

        let req = TestRequest::get().uri("/items").to_request();
        let _ = app.call(req).await;
    }

    #[test]
    fn test_dump() {
        let req = TestRequest::post()
            .uri("/upload?name=a.txt")
            .insert_header(("x-trace", "1"))
            .insert_header(("content-type", "text/plain"))
            .insert_header(("host", "example.com"))
            .set_payload("secret body")
            .to_srv_request();

        let dump = Guard::new(&req).dump();
        assert!(dump.starts_with("POST /upload?name=a.txt HTTP/1.1\r\nhost: example.com\r\n"));
        assert!(dump.ends_with("content-type: text/plain\r\nx-trace: 1\r\n\r\n"));
        assert!(!dump.contains("secret body"));
    }
}
