use std::{fmt, rc::Rc};

use actix_service::{Service, Transform};
use actix_utils::future::{Ready, ready};
use actix_web::dev::{Payload, ServiceRequest, ServiceResponse};
use actix_web::http::header::HeaderName;
use actix_web::{Error, FromRequest, HttpMessage, HttpRequest};
use uuid::Uuid;

/// Request identifier assigned by [`RequestIdentifier`].
///
/// Either taken from the inbound request header or freshly generated. Example:
/// 7b77f3f1-8e15-4b6a-9b3f-7f4b6f4b6f4b.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(Rc<str>);

impl RequestId {
    pub(crate) fn generate() -> Self {
        #[cfg(not(feature = "uuid_v7"))]
        let id = Uuid::new_v4();
        #[cfg(feature = "uuid_v7")]
        let id = Uuid::now_v7();

        Self(id.as_hyphenated().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request id of `req` as seen by the request logger: the one stored by
/// [`RequestIdentifier`], then the `tracing-actix-web` one when that feature is
/// enabled, else the empty string.
pub(crate) fn current(req: &impl HttpMessage) -> String {
    let ext = req.extensions();
    let id = ext.get::<RequestId>().map(ToString::to_string);

    #[cfg(feature = "tracing-request-id")]
    let id = id.or_else(|| {
        ext.get::<tracing_actix_web::RequestId>()
            .map(ToString::to_string)
    });

    id.unwrap_or_default()
}

/// Extract the [`RequestId`] in a handler. Fails with `500` when
/// [`RequestIdentifier`] is not in the chain.
impl FromRequest for RequestId {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(req.extensions().get::<RequestId>().cloned().ok_or_else(|| {
            actix_web::error::ErrorInternalServerError("request id missing")
        }))
    }
}

/// Middleware that assigns a request id to every request.
///
/// The id in the inbound `x-request-id` header (configurable with
/// [`header`](RequestIdentifier::header)) is reused when it is present and
/// non-empty; otherwise a UUID is generated (v4, or v7 with the `uuid_v7`
/// feature). Wrap it outside of [`RequestLogger`](crate::RequestLogger) so
/// the logger sees the id.
///
/// # Examples
/// ```rust
/// use actix_web::App;
/// use actix_web_middleware_reqlog::{RequestIdentifier, RequestLogger};
///
/// let app = App::new()
///     .wrap(RequestLogger::default())
///     .wrap(RequestIdentifier::default());
/// ```
#[derive(Debug, Clone)]
pub struct RequestIdentifier {
    header: HeaderName,
}

impl RequestIdentifier {
    /// Read inbound ids from `header` instead of `x-request-id`.
    pub fn header(mut self, header: HeaderName) -> Self {
        self.header = header;
        self
    }
}

impl Default for RequestIdentifier {
    fn default() -> Self {
        RequestIdentifier {
            header: HeaderName::from_static("x-request-id"),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequestIdentifier
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RequestIdentifierMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestIdentifierMiddlewareService {
            service,
            header: self.header.clone(),
        }))
    }
}

/// Request id middleware service.
pub struct RequestIdentifierMiddlewareService<S> {
    header: HeaderName,
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestIdentifierMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = S::Future;

    actix_service::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let id = req
            .headers()
            .get(&self.header)
            .and_then(|val| val.to_str().ok())
            .filter(|val| !val.is_empty())
            .map(|val| RequestId(val.into()))
            .unwrap_or_else(RequestId::generate);

        req.extensions_mut().insert(id);
        self.service.call(req)
    }
}
