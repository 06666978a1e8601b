//! Executes the GraphQL operation of the request body.
use std::sync::Arc;
use std::task::Poll;

use apollo_compiler::ExecutableDocument;
use apollo_compiler::ast;
use apollo_compiler::validation::Valid;
use futures::future::BoxFuture;
use http::HeaderValue;
use http::StatusCode;
use serde_json_bytes::Value;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tracing::Instrument;

use super::Request;
use super::Response;
use crate::context::OPERATION_NAME;
use crate::error::AggregateError;
use crate::error::ConfigurationError;
use crate::error::PipelineError;
use crate::error::QueryError;
use crate::execution::ExecutionArgs;
use crate::graphql;
use crate::options::OptionValue;
use crate::options::OptionsResolver;
use crate::options::RequestOptions;

/// Executes the GraphQL request found in [`Request::body`].
///
/// Needs a body parser before it and an [`ErrorHandlerLayer`](super::ErrorHandlerLayer)
/// around it. On success `{ "data": ... }` is the response body and the inner service
/// is called; on failure the inner service is not called.
#[derive(Clone, Debug)]
pub struct ExecuteLayer {
    options: Arc<OptionsResolver>,
}

impl ExecuteLayer {
    /// Checks the static options, see [`OptionsResolver::new`].
    pub fn new(options: impl Into<OptionValue>) -> Result<Self, PipelineError> {
        Ok(Self {
            options: Arc::new(OptionsResolver::new(options)?),
        })
    }
}

impl<S> Layer<S> for ExecuteLayer {
    type Service = ExecuteService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ExecuteService {
            inner,
            options: self.options.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecuteService<S> {
    inner: S,
    options: Arc<OptionsResolver>,
}

impl<S> Service<Request> for ExecuteService<S>
where
    S: Service<Request, Response = Response, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Response, BoxError>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // The inner service is ready; keep that one and leave a clone in its place.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let options = self.options.clone();

        Box::pin(async move {
            execute(&options, &request).await?;
            inner.call(request).await
        })
    }
}

async fn execute(options: &OptionsResolver, request: &Request) -> Result<(), PipelineError> {
    let body = request
        .body
        .as_ref()
        .ok_or(ConfigurationError::MissingBody)?;
    let graphql_request = graphql::Request::from_body(body)?;
    if let Some(operation_name) = &graphql_request.operation_name {
        request
            .context
            .insert(OPERATION_NAME, operation_name.clone())
            .map_err(PipelineError::Raised)?;
    }

    let document =
        tracing::info_span!("parse_query").in_scope(|| parse(&graphql_request.query))?;

    let options = options.resolve(request).await?;

    let document =
        tracing::info_span!("validate_query").in_scope(|| validate(&options, &document))?;

    let result = options
        .execute
        .execute(ExecutionArgs {
            schema: &options.schema,
            document: &document,
            root_value: &options.root_value,
            context_value: &options.context_value,
            field_resolver: options.field_resolver.as_deref(),
            variable_values: &graphql_request.variables,
            operation_name: graphql_request.operation_name.as_deref(),
        })
        .instrument(tracing::info_span!("execute_query"))
        .await
        .map_err(PipelineError::Raised)?;

    // Data is kept in the response even when errors follow.
    let body = serde_json_bytes::to_value(graphql::Response {
        data: result.data.map(Value::Object),
        ..Default::default()
    })
    .map_err(|error| PipelineError::Raised(error.into()))?;
    request.context.with_response(|response| {
        response.body = Some(body);
        response.status = Some(StatusCode::OK);
    });
    if let Some(error) = AggregateError::execution(result.errors) {
        return Err(error.into());
    }

    request.context.with_response(|response| {
        response.content_type = Some(HeaderValue::from_static(
            graphql::APPLICATION_GRAPHQL_JSON,
        ));
    });
    Ok(())
}

/// Parses the query, reporting the first syntax error only.
fn parse(query: &str) -> Result<ast::Document, AggregateError> {
    ast::Document::parse(query, "query.graphql").map_err(|invalid| {
        let error = invalid
            .errors
            .iter()
            .next()
            .map(|diagnostic| QueryError::from(diagnostic.to_json()))
            .unwrap_or_else(|| {
                QueryError::new(graphql::Error::builder().message("Syntax error.").build())
            });
        AggregateError::syntax(error)
    })
}

/// Runs the default validation rules, then the configured ones.
fn validate(
    options: &RequestOptions,
    document: &ast::Document,
) -> Result<Valid<ExecutableDocument>, AggregateError> {
    let (executable, mut errors) = match document.to_executable_validate(&options.schema) {
        Ok(executable) => (Ok(executable), Vec::new()),
        Err(invalid) => (
            Err(QueryError::new(
                graphql::Error::builder().message("Invalid query.").build(),
            )),
            invalid
                .errors
                .iter()
                .map(|diagnostic| QueryError::from(diagnostic.to_json()))
                .collect::<Vec<_>>(),
        ),
    };
    for rule in &options.validation_rules {
        errors.extend(
            rule.validate(&options.schema, document)
                .into_iter()
                .map(QueryError::from),
        );
    }

    match (executable, AggregateError::query_validation(errors)) {
        (_, Some(error)) => Err(error),
        (Ok(executable), None) => Ok(executable),
        // A failed validation without diagnostics.
        (Err(error), None) => Err(AggregateError::invalid_query(error)),
    }
}
