//! Request and response types of the service stack, and its layers.
//!
//! Every layer wraps a `Service<Request, Response = Response, Error = BoxError>`. The
//! outgoing response is built up in the request [`Context`] and rendered by
//! [`Response::into_http`] once the whole stack has run.
use bytes::Bytes;
use http::HeaderValue;
use http::Method;
use http::StatusCode;
use http::header::CONTENT_TYPE;
use serde_json_bytes::Value;
use static_assertions::assert_impl_all;
use tower::BoxError;
use tower::ServiceExt;

use crate::Context;

pub mod body_parser;
pub mod error_handler;
pub mod execute;

pub use self::body_parser::BodyParserLayer;
pub use self::error_handler::ErrorEvent;
pub use self::error_handler::ErrorHandlerLayer;
pub use self::execute::ExecuteLayer;

pub type BoxCloneService = tower::util::BoxCloneService<Request, Response, BoxError>;

assert_impl_all!(Request: Send, Sync);
/// An HTTP request on its way through the stack.
#[non_exhaustive]
#[derive(Debug)]
pub struct Request {
    /// The original HTTP request.
    pub http_request: http::Request<Bytes>,

    /// The parsed JSON body. `None` until a body parser ran.
    pub body: Option<Value>,

    /// Context for the layers handling this request.
    pub context: Context,
}

impl From<(http::Request<Bytes>, Context)> for Request {
    fn from((http_request, context): (http::Request<Bytes>, Context)) -> Self {
        Self {
            http_request,
            body: None,
            context,
        }
    }
}

#[buildstructor::buildstructor]
impl Request {
    /// This is the constructor (or builder) to use when constructing a real Request.
    #[builder(visibility = "pub")]
    fn new(http_request: http::Request<Bytes>, body: Option<Value>, context: Context) -> Self {
        Self {
            http_request,
            body,
            context,
        }
    }

    /// This is the constructor (or builder) to use when constructing a fake Request.
    ///
    /// Defaults to a `POST /` without headers or raw body.
    #[builder(visibility = "pub")]
    fn fake_new(
        method: Option<Method>,
        content_type: Option<String>,
        raw_body: Option<Bytes>,
        body: Option<Value>,
        context: Option<Context>,
    ) -> Result<Self, BoxError> {
        let mut builder = http::Request::builder()
            .method(method.unwrap_or(Method::POST))
            .uri("http://example.com/");
        if let Some(content_type) = content_type {
            builder = builder.header(CONTENT_TYPE, HeaderValue::try_from(content_type)?);
        }
        Ok(Self {
            http_request: builder.body(raw_body.unwrap_or_default())?,
            body,
            context: context.unwrap_or_default(),
        })
    }
}

assert_impl_all!(Response: Send);
/// The result of the stack; the response itself lives in the context.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct Response {
    pub context: Context,
}

impl Response {
    pub fn new(context: Context) -> Self {
        Self { context }
    }

    /// The current status. When none was set it is 200 if there is a body, 404 otherwise.
    pub fn status(&self) -> StatusCode {
        self.context.with_response(|response| {
            response.status.unwrap_or(if response.body.is_some() {
                StatusCode::OK
            } else {
                StatusCode::NOT_FOUND
            })
        })
    }

    /// The current JSON body.
    pub fn body(&self) -> Option<Value> {
        self.context.with_response(|response| response.body.clone())
    }

    /// Renders the response built up in the context.
    pub fn into_http(self) -> Result<http::Response<Bytes>, BoxError> {
        let status = self.status();
        let parts = self.context.response_parts();
        let mut builder = http::Response::builder().status(status);
        if let Some(content_type) = parts.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        let body = match parts.body {
            Some(body) => Bytes::from(serde_json::to_vec(&body)?),
            None => Bytes::new(),
        };
        Ok(builder.body(body)?)
    }
}

/// The end of the stack: responds with whatever the layers put in the context.
pub fn respond() -> BoxCloneService {
    tower::service_fn(|request: Request| async move {
        Ok::<_, BoxError>(Response::new(request.context))
    })
    .boxed_clone()
}
