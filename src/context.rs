//! Request-scoped storage for the per-request [`Logger`].

use actix_utils::future::{Ready, ready};
use actix_web::{FromRequest, HttpMessage, HttpRequest, dev::Payload};

use crate::sink::Logger;

/// Private extensions key: nothing outside this module can insert or read it.
#[derive(Clone)]
struct RequestContext {
    logger: Logger,
}

pub(crate) fn set(req: &impl HttpMessage, logger: Logger) {
    req.extensions_mut().insert(RequestContext { logger });
}

/// Logger stored by [`RequestLogger`](crate::RequestLogger), if any.
pub fn try_get(req: &impl HttpMessage) -> Option<Logger> {
    req.extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.logger.clone())
}

/// Returns the [`Logger`] stored in the request by
/// [`RequestLogger`](crate::RequestLogger).
///
/// # Panics
/// Panics if the request did not pass through `RequestLogger`. That is a
/// misconfigured middleware chain, not a runtime condition.
pub fn get(req: &impl HttpMessage) -> Logger {
    try_get(req).unwrap_or_else(|| missing())
}

pub(crate) fn missing() -> ! {
    panic!("request logger missing: wrap the service with `RequestLogger` before using it")
}

/// Extract the request's logger in a handler.
///
/// ```rust
/// use actix_web::HttpResponse;
/// use actix_web_middleware_reqlog::{Field, Logger};
///
/// async fn create_user(log: Logger) -> HttpResponse {
///     log.info("creating user", [Field::new("plan", "free")]);
///     HttpResponse::Created().finish()
/// }
/// ```
///
/// Panics like [`get`] when `RequestLogger` is not in the chain.
impl FromRequest for Logger {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(Ok(get(req)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use std::panic;

    #[test]
    fn test_set_and_get() {
        let req = TestRequest::default().to_http_request();
        assert!(try_get(&req).is_none());

        set(&req, Logger::new("context_set").with("method", "GET"));

        let logger = get(&req);
        assert_eq!(logger.target(), "context_set");
        assert_eq!(logger.field("method").and_then(|v| v.as_str()), Some("GET"));
    }

    #[test]
    fn test_get_without_logger_panics() {
        let req = TestRequest::default().to_http_request();
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| get(&req)));

        let err = result.expect_err("get must panic without RequestLogger");
        assert!(crate::failure::describe(&*err).contains("RequestLogger"));
    }

    #[actix_web::test]
    async fn test_extractor() {
        let req = TestRequest::default().to_http_request();
        set(&req, Logger::new("context_extract"));

        let logger = Logger::extract(&req).await.unwrap();
        assert_eq!(logger.target(), "context_extract");
    }
}
