//! Axum router serving a service stack.
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::response::IntoResponse;
use axum::routing::any;
use http::StatusCode;
use http_body_util::BodyExt;
use http_body_util::LengthLimitError;
use http_body_util::Limited;
use parking_lot::Mutex;
use tower::BoxError;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use crate::Context;
use crate::configuration::Limits;
use crate::error::HttpError;
use crate::services;
use crate::services::ErrorHandlerLayer;

/// Routes every method on `path` to `service`.
///
/// The request body is read in full before the stack runs. A body larger than
/// [`Limits::http_max_request_bytes`] is answered with a 413 without calling `service`.
/// Such errors, and errors escaping `service`, are handled by `error_handler`; pass the
/// layer the stack was built with so its subscribers see them.
pub fn make_router(
    path: &str,
    service: services::BoxCloneService,
    limits: &Limits,
    error_handler: &ErrorHandlerLayer,
) -> Router {
    // Handlers must be Sync, a boxed service only is Send.
    let service = Arc::new(Mutex::new(service));
    let max_request_bytes = limits.http_max_request_bytes;
    let error_handler = error_handler.clone();

    Router::new()
        .route(
            path,
            any(move |request: http::Request<Body>| {
                let service = service.lock().clone();
                handle(service, error_handler.clone(), max_request_bytes, request)
            }),
        )
        .layer(TraceLayer::new_for_http())
}

async fn handle(
    service: services::BoxCloneService,
    error_handler: ErrorHandlerLayer,
    max_request_bytes: usize,
    request: http::Request<Body>,
) -> axum::response::Response {
    let context = Context::new();
    let (parts, body) = request.into_parts();

    let result = match Limited::new(body, max_request_bytes).collect().await {
        Ok(collected) => {
            let http_request = http::Request::from_parts(parts, collected.to_bytes());
            service
                .oneshot(services::Request::from((http_request, context.clone())))
                .await
        }
        Err(error) => Err(read_error(error).into()),
    };

    let response = match result {
        Ok(response) => response,
        Err(error) => error_handler.handle(&context, error),
    };

    match response.into_http() {
        Ok(response) => response.map(Body::from).into_response(),
        Err(error) => {
            tracing::error!(%error, "could not render the response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn read_error(error: BoxError) -> HttpError {
    if error.is::<LengthLimitError>() {
        HttpError::builder()
            .status(StatusCode::PAYLOAD_TOO_LARGE)
            .message("Request body too large.")
            .build()
    } else {
        tracing::debug!(%error, "could not read the request body");
        HttpError::builder()
            .status(StatusCode::BAD_REQUEST)
            .message("Request body could not be read.")
            .build()
    }
}

#[cfg(test)]
mod tests {
    use apollo_compiler::Schema;
    use http::header::CONTENT_TYPE;
    use serde_json_bytes::json;
    use tower::ServiceBuilder;

    use super::*;
    use crate::options::ExecuteOptions;
    use crate::services::BodyParserLayer;
    use crate::services::ExecuteLayer;
    use crate::services::respond;

    fn router(limits: &Limits, error_handler: &ErrorHandlerLayer) -> Router {
        let schema = Schema::parse("type Query { test: String }", "schema.graphql").unwrap();
        let service = ServiceBuilder::new()
            .layer(error_handler.clone())
            .layer(BodyParserLayer::new())
            .layer(
                ExecuteLayer::new(
                    ExecuteOptions::new()
                        .schema(schema)
                        .root_value(json!({ "test": "ok" })),
                )
                .unwrap(),
            )
            .service(respond())
            .boxed_clone();
        make_router("/graphql", service, limits, error_handler)
    }

    async fn post(router: Router, body: &'static str) -> (StatusCode, String) {
        let request = http::Request::post("/graphql")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn serves_graphql_requests() {
        let router = router(&Limits::default(), &ErrorHandlerLayer::new());
        let (status, body) = post(router, r#"{ "query": "{ test }" }"#).await;
        assert_eq!(status, StatusCode::OK);
        insta::assert_snapshot!(body, @r###"{"data":{"test":"ok"}}"###);
    }

    #[tokio::test]
    async fn rejects_bodies_over_the_limit() {
        let limits = Limits {
            http_max_request_bytes: 8,
        };
        let error_handler = ErrorHandlerLayer::new();
        let mut events = error_handler.subscribe();
        let router = router(&limits, &error_handler);
        let (status, body) = post(router, r#"{ "query": "{ test }" }"#).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        insta::assert_snapshot!(body, @r###"{"errors":[{"message":"Request body too large."}]}"###);

        let event = events.recv().await.unwrap();
        assert_eq!(event.error.to_string(), "Request body too large.");
        assert_eq!(
            event.context.response_parts().status,
            Some(StatusCode::PAYLOAD_TOO_LARGE)
        );
    }

    #[tokio::test]
    async fn handles_errors_escaping_the_stack() {
        let error_handler = ErrorHandlerLayer::new();
        let mut events = error_handler.subscribe();
        let router = make_router("/", respond(), &Limits::default(), &error_handler);
        let failing = make_router(
            "/",
            tower::service_fn(|_: services::Request| async {
                Err::<services::Response, BoxError>("Message.".into())
            })
            .boxed_clone(),
            &Limits::default(),
            &error_handler,
        );

        let response = router
            .oneshot(http::Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let (status, body) = {
            let request = http::Request::get("/").body(Body::empty()).unwrap();
            let response = failing.oneshot(request).await.unwrap();
            let status = response.status();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            (status, body)
        };
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&body).unwrap(),
            serde_json::json!({ "errors": [{ "message": "Internal Server Error" }] })
        );
        assert_eq!(events.recv().await.unwrap().error.to_string(), "Message.");
    }
}
