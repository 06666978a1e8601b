//! Parses JSON request bodies into [`Request::body`].
use std::future::Ready;
use std::future::ready;
use std::task::Poll;

use futures::future::Either;
use http::StatusCode;
use http::header::CONTENT_TYPE;
use mediatype::MediaType;
use mediatype::names::APPLICATION;
use mediatype::names::JSON;
use serde_json_bytes::Value;
use tower::BoxError;
use tower::Layer;
use tower::Service;

use super::Request;
use super::Response;
use crate::error::HttpError;
use crate::json_ext::Object;

/// Fills in [`Request::body`] when no earlier layer did.
///
/// `application/json` and `application/*+json` bodies are parsed, an empty one being
/// `{}`. Any other body is left unparsed and reads as `{}`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BodyParserLayer;

impl BodyParserLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for BodyParserLayer {
    type Service = BodyParserService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BodyParserService { inner }
    }
}

#[derive(Clone, Debug)]
pub struct BodyParserService<S> {
    inner: S,
}

impl<S> Service<Request> for BodyParserService<S>
where
    S: Service<Request, Response = Response, Error = BoxError>,
{
    type Response = Response;
    type Error = BoxError;
    type Future = Either<Ready<Result<Response, BoxError>>, S::Future>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        if request.body.is_none() {
            match parse_body(&request.http_request) {
                Ok(body) => request.body = Some(body),
                Err(error) => return Either::Left(ready(Err(error.into()))),
            }
        }
        Either::Right(self.inner.call(request))
    }
}

fn parse_body(request: &http::Request<bytes::Bytes>) -> Result<Value, HttpError> {
    if !is_json(request) {
        return Ok(Value::Object(Object::new()));
    }
    let bytes = request.body();
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Object::new()));
    }
    serde_json::from_slice(bytes).map_err(|error| {
        tracing::debug!(%error, "invalid JSON request body");
        HttpError::builder()
            .status(StatusCode::BAD_REQUEST)
            .message("Request body JSON could not be parsed.")
            .build()
    })
}

fn is_json(request: &http::Request<bytes::Bytes>) -> bool {
    request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| MediaType::parse(value).ok())
        .is_some_and(|media_type| {
            media_type.ty == APPLICATION
                && (media_type.subty == JSON || media_type.suffix == Some(JSON))
        })
}
