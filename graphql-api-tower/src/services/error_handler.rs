//! Turns every error raised by the layers below into a GraphQL response.
//!
//! Place [`ErrorHandlerLayer`] outermost: its service never fails. Errors are written
//! into the response body `errors`, next to any `data` already there, and the HTTP
//! status is set from the error kind. See [`crate::error`] for which messages reach the
//! client.
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::task::Poll;

use futures::future::BoxFuture;
use http::HeaderValue;
use http::StatusCode;
use serde_json_bytes::ByteString;
use serde_json_bytes::Value;
use tokio::sync::broadcast;
use tower::BoxError;
use tower::Layer;
use tower::Service;

use super::Request;
use super::Response;
use crate::Context;
use crate::context::OPERATION_NAME;
use crate::error::AggregateError;
use crate::error::ConfigurationError;
use crate::error::Exposure;
use crate::error::HttpError;
use crate::error::INTERNAL_SERVER_ERROR_MESSAGE;
use crate::error::PipelineError;
use crate::error::RequestError;
use crate::graphql;
use crate::json_ext::Object;

const EVENT_CAPACITY: usize = 64;

/// An error handled by [`ErrorHandlerLayer`], as sent to its subscribers.
#[derive(Clone)]
pub struct ErrorEvent {
    /// The error as raised, before any formatting.
    pub error: Arc<BoxError>,
    pub context: Context,
}

impl fmt::Debug for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorEvent")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// The response an error turns into.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedError {
    pub status: StatusCode,
    pub errors: Vec<graphql::Error>,
}

/// Formats an error for the response. The result only depends on the error.
pub fn normalize(error: &(dyn StdError + Send + Sync + 'static)) -> NormalizedError {
    if let Some(error) = error.downcast_ref::<PipelineError>() {
        return match error {
            PipelineError::Configuration(error) => coerce(error),
            PipelineError::Request(error) => coerce(error),
            PipelineError::Aggregate(error) => aggregate(error),
            PipelineError::Raised(error) => normalize(error.as_ref()),
        };
    }
    if let Some(error) = error.downcast_ref::<AggregateError>() {
        aggregate(error)
    } else if let Some(error) = error.downcast_ref::<HttpError>() {
        coerce(error)
    } else if let Some(error) = error.downcast_ref::<ConfigurationError>() {
        coerce(error)
    } else if let Some(error) = error.downcast_ref::<RequestError>() {
        coerce(error)
    } else {
        internal_server_error(Object::new())
    }
}

fn aggregate(error: &AggregateError) -> NormalizedError {
    if !error.expose() {
        return coerce(error);
    }
    NormalizedError {
        status: error.status(),
        errors: error
            .errors()
            .iter()
            .map(|error| error.to_graphql_error())
            .collect(),
    }
}

fn coerce<E: Exposure + fmt::Display>(error: &E) -> NormalizedError {
    let extensions = error.extensions().cloned().unwrap_or_default();
    if !error.expose() {
        return internal_server_error(extensions);
    }
    NormalizedError {
        status: error.status(),
        errors: vec![
            graphql::Error::builder()
                .message(error.to_string())
                .extensions(extensions)
                .build(),
        ],
    }
}

fn internal_server_error(extensions: Object) -> NormalizedError {
    NormalizedError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        errors: vec![
            graphql::Error::builder()
                .message(INTERNAL_SERVER_ERROR_MESSAGE)
                .extensions(extensions)
                .build(),
        ],
    }
}

/// Writes the normalized error into the response, keeping any `data`.
fn respond_with(context: &Context, normalized: NormalizedError) -> Result<(), BoxError> {
    let errors = serde_json_bytes::to_value(&normalized.errors)?;
    context.with_response(|response| {
        let mut body = match response.body.take() {
            Some(Value::Object(body)) => body,
            _ => Object::new(),
        };
        body.insert(ByteString::from("errors"), errors);
        response.body = Some(Value::Object(body));
        response.status = Some(normalized.status);
        response.content_type = Some(HeaderValue::from_static(
            graphql::APPLICATION_GRAPHQL_JSON,
        ));
    });
    Ok(())
}

/// Logs the error and writes it into the response of `context`.
fn handle_error(context: &Context, error: &(dyn StdError + Send + Sync + 'static)) {
    let normalized = normalize(error);
    let operation_name = context.get::<_, String>(OPERATION_NAME).ok().flatten();
    if normalized.status.is_server_error() {
        tracing::error!(status = %normalized.status, ?operation_name, %error, "request failed");
    } else {
        tracing::debug!(status = %normalized.status, ?operation_name, %error, "request failed");
    }
    if let Err(format_error) = respond_with(context, normalized) {
        tracing::error!(%format_error, "could not format the error response");
        context.with_response(|response| {
            response.status = Some(StatusCode::INTERNAL_SERVER_ERROR);
            response.body = None;
        });
    }
}

/// Writes the error into the response of `context`, then sends it to subscribers.
fn report(events: &broadcast::Sender<ErrorEvent>, context: &Context, error: BoxError) -> Response {
    handle_error(context, error.as_ref());
    // No subscriber is not an error.
    let _ = events.send(ErrorEvent {
        error: Arc::new(error),
        context: context.clone(),
    });
    Response::new(context.clone())
}

/// Handles the errors of the layers it wraps. See the [module](self) documentation.
#[derive(Clone, Debug)]
pub struct ErrorHandlerLayer {
    events: broadcast::Sender<ErrorEvent>,
}

impl Default for ErrorHandlerLayer {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { events }
    }
}

impl ErrorHandlerLayer {
    pub fn new() -> Self {
        Default::default()
    }

    /// Receives every error handled from now on.
    ///
    /// A slow subscriber misses events rather than holding up responses.
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorEvent> {
        self.events.subscribe()
    }

    /// Handles an error raised outside of the wrapped layers, such as a request body
    /// that could not be read.
    pub fn handle(&self, context: &Context, error: BoxError) -> Response {
        report(&self.events, context, error)
    }
}

impl<S> Layer<S> for ErrorHandlerLayer {
    type Service = ErrorHandlerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ErrorHandlerService {
            inner,
            events: self.events.clone(),
            not_ready: None,
        }
    }
}

#[derive(Debug)]
pub struct ErrorHandlerService<S> {
    inner: S,
    events: broadcast::Sender<ErrorEvent>,
    /// Set when the inner service failed to get ready; the next call responds with it.
    not_ready: Option<BoxError>,
}

impl<S: Clone> Clone for ErrorHandlerService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            events: self.events.clone(),
            not_ready: None,
        }
    }
}

impl<S> Service<Request> for ErrorHandlerService<S>
where
    S: Service<Request, Response = Response, Error = BoxError>,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Response, BoxError>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.not_ready.is_some() {
            return Poll::Ready(Ok(()));
        }
        match self.inner.poll_ready(cx) {
            Poll::Ready(Err(error)) => {
                self.not_ready = Some(error);
                Poll::Ready(Ok(()))
            }
            poll => poll,
        }
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let context = request.context.clone();
        let events = self.events.clone();
        if let Some(error) = self.not_ready.take() {
            return Box::pin(async move { Ok(report(&events, &context, error)) });
        }
        let response = self.inner.call(request);

        Box::pin(async move {
            match response.await {
                Ok(response) => Ok(response),
                Err(error) => Ok(report(&events, &context, error)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;
    use tower::ServiceExt;

    use super::*;
    use crate::error::QueryError;
    use crate::error::ResolverError;
    use crate::graphql::Location;
    use crate::json_ext::Path;

    async fn handle(
        layer: &ErrorHandlerLayer,
        data: Option<Value>,
        error: impl Fn() -> BoxError + Send + 'static,
    ) -> Response {
        let service = layer.layer(tower::service_fn(move |request: Request| {
            if let Some(data) = &data {
                request
                    .context
                    .with_response(|response| response.body = Some(json!({ "data": data })));
            }
            let error = error();
            async move { Err::<Response, _>(error) }
        }));
        service
            .oneshot(Request::fake_builder().build().unwrap())
            .await
            .unwrap()
    }

    fn resolver_error(expose: bool) -> QueryError {
        QueryError::new(
            graphql::Error::builder()
                .message("Message.")
                .location(Location { line: 1, column: 3 })
                .path(Path::from(vec!["test"]))
                .build(),
        )
        .with_original_error(
            ResolverError::builder()
                .message("Message.")
                .expose(expose)
                .build(),
        )
    }

    #[tokio::test]
    async fn unknown_errors_are_hidden() {
        let response = handle(&ErrorHandlerLayer::new(), None, || "Message.".into()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let http = response.into_http().unwrap();
        assert_eq!(
            http.headers()[http::header::CONTENT_TYPE],
            graphql::APPLICATION_GRAPHQL_JSON
        );
        insta::assert_snapshot!(String::from_utf8_lossy(http.body()), @r###"{"errors":[{"message":"Internal Server Error"}]}"###);
    }

    #[tokio::test]
    async fn exposed_http_errors_keep_status_and_extensions() {
        let response = handle(&ErrorHandlerLayer::new(), None, || {
            HttpError::builder()
                .status(StatusCode::TOO_MANY_REQUESTS)
                .message("Rate limit exceeded.")
                .extension("code", "RATE_LIMIT_EXCEEDED")
                .build()
                .into()
        })
        .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        insta::assert_json_snapshot!(response.body(), @r###"
        {
          "errors": [
            {
              "message": "Rate limit exceeded.",
              "extensions": {
                "code": "RATE_LIMIT_EXCEEDED"
              }
            }
          ]
        }
        "###);
    }

    #[tokio::test]
    async fn unexposed_http_errors_keep_only_extensions() {
        let response = handle(&ErrorHandlerLayer::new(), None, || {
            HttpError::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .message("Database connection failed.")
                .extension("a", true)
                .build()
                .into()
        })
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.body(),
            Some(json!({
                "errors": [{ "message": "Internal Server Error", "extensions": { "a": true } }]
            }))
        );
    }

    #[tokio::test]
    async fn exposed_aggregate_masks_unexposed_resolver_errors() {
        let response = handle(&ErrorHandlerLayer::new(), None, || {
            let errors = vec![resolver_error(false), resolver_error(true)];
            PipelineError::from(AggregateError::execution(errors).unwrap()).into()
        })
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        insta::assert_json_snapshot!(response.body(), @r###"
        {
          "errors": [
            {
              "message": "Internal Server Error",
              "locations": [
                {
                  "line": 1,
                  "column": 3
                }
              ],
              "path": [
                "test"
              ]
            },
            {
              "message": "Message.",
              "locations": [
                {
                  "line": 1,
                  "column": 3
                }
              ],
              "path": [
                "test"
              ]
            }
          ]
        }
        "###);
    }

    #[tokio::test]
    async fn unexposed_aggregate_is_hidden() {
        let response = handle(&ErrorHandlerLayer::new(), None, || {
            AggregateError::schema_validation(
                "label",
                vec![graphql::Error::builder().message("bad schema").build()],
            )
            .unwrap()
            .into()
        })
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.body(),
            Some(json!({ "errors": [{ "message": "Internal Server Error" }] }))
        );
    }

    #[tokio::test]
    async fn keeps_data_already_in_the_body() {
        let response = handle(
            &ErrorHandlerLayer::new(),
            Some(json!({ "test": "ok" })),
            || "Message.".into(),
        )
        .await;
        assert_eq!(
            response.body(),
            Some(json!({
                "data": { "test": "ok" },
                "errors": [{ "message": "Internal Server Error" }]
            }))
        );
    }

    #[tokio::test]
    async fn raised_errors_are_classified_by_what_they_wrap() {
        let response = handle(&ErrorHandlerLayer::new(), None, || {
            PipelineError::Raised(
                HttpError::builder()
                    .status(StatusCode::FORBIDDEN)
                    .message("Forbidden.")
                    .build()
                    .into(),
            )
            .into()
        })
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.body(),
            Some(json!({ "errors": [{ "message": "Forbidden." }] }))
        );
    }

    #[test]
    fn normalizing_is_idempotent() {
        let error: BoxError = PipelineError::from(
            AggregateError::execution(vec![resolver_error(false)]).unwrap(),
        )
        .into();
        assert_eq!(normalize(error.as_ref()), normalize(error.as_ref()));
    }

    #[derive(Clone)]
    struct NeverReady;

    impl Service<Request> for NeverReady {
        type Response = Response;
        type Error = BoxError;
        type Future = futures::future::Ready<Result<Response, BoxError>>;

        fn poll_ready(&mut self, _: &mut std::task::Context<'_>) -> Poll<Result<(), BoxError>> {
            Poll::Ready(Err(HttpError::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .message("Overloaded.")
                .expose(true)
                .build()
                .into()))
        }

        fn call(&mut self, _: Request) -> Self::Future {
            panic!("called a service that is not ready")
        }
    }

    #[tokio::test]
    async fn readiness_errors_are_handled() {
        let layer = ErrorHandlerLayer::new();
        let mut events = layer.subscribe();
        let response = layer
            .layer(NeverReady)
            .oneshot(Request::fake_builder().build().unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.body(),
            Some(json!({ "errors": [{ "message": "Overloaded." }] }))
        );
        let event = events.recv().await.unwrap();
        assert_eq!(event.error.to_string(), "Overloaded.");
    }

    #[tokio::test]
    async fn errors_raised_outside_the_stack_reach_subscribers() {
        let layer = ErrorHandlerLayer::new();
        let mut events = layer.subscribe();
        let context = Context::new();
        let response = layer.handle(
            &context,
            HttpError::builder()
                .status(StatusCode::PAYLOAD_TOO_LARGE)
                .message("Request body too large.")
                .build()
                .into(),
        );
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let event = events.recv().await.unwrap();
        assert_eq!(event.error.to_string(), "Request body too large.");
    }

    #[test_log::test(tokio::test)]
    async fn subscribers_receive_the_original_error() {
        let layer = ErrorHandlerLayer::new();
        let mut events = layer.subscribe();
        handle(&layer, None, || "Message.".into()).await;
        let event = events.recv().await.unwrap();
        assert_eq!(event.error.to_string(), "Message.");
    }
}
