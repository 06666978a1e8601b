//! Errors raised while handling GraphQL requests, and how each kind is exposed to clients.
//!
//! | kind                    | HTTP status | message exposed             |
//! |-------------------------|-------------|-----------------------------|
//! | [`ConfigurationError`]  | 500         | never                       |
//! | [`RequestError`]        | 400         | always                      |
//! | [`AggregateError`]      | its own     | per error, see [`QueryError`] |
//! | [`HttpError`]           | its own     | `expose` flag               |
//! | anything else           | 500         | never                       |
use std::fmt;

use apollo_compiler::response::GraphQLError as CompilerError;
use displaydoc::Display;
use http::StatusCode;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;
use thiserror::Error;
use tower::BoxError;

use crate::graphql;
use crate::json_ext::Object;

/// Message used in place of any error message that must not reach the client.
pub const INTERNAL_SERVER_ERROR_MESSAGE: &str = "Internal Server Error";

/// Option keys, displayed as a backtick quoted, comma separated list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OptionKeys(pub Vec<String>);

impl fmt::Display for OptionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, key) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "`{key}`")?;
        }
        Ok(())
    }
}

/// Invalid execute options or a missing request body.
///
/// Raised at setup time for static options and per request for options resolved by an
/// override. Never exposed to the client.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// {label} options must be an enumerable object.
    NotEnumerable { label: String },

    /// {label} options invalid: {keys}.
    InvalidKeys { label: String, keys: OptionKeys },

    /// {label} GraphQL schema must be a `Schema` instance.
    SchemaType { label: String },

    /// {label} GraphQL validation rules must be an array.
    ValidationRulesNotList { label: String },

    /// {label} GraphQL validation rules must be functions.
    ValidationRulesNotFunctions { label: String },

    /// {label} must be a function.
    NotFunction { label: String },

    /// {label} must be a JSON value.
    NotJson { label: String },

    /// GraphQL execute middleware requires a GraphQL schema.
    MissingSchema,

    /// Request body missing.
    MissingBody,
}

/// A malformed GraphQL request body.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequestError {
    /// Request body must be a JSON object.
    BodyNotObject,

    /// GraphQL operation field `query` missing.
    QueryMissing,

    /// GraphQL operation field `query` must be a string.
    QueryNotString,

    /// Request body JSON `operationName` field must be a string.
    OperationNameNotString,

    /// Request body JSON `variables` field must be an object.
    VariablesNotObject,
}

/// An error raised by a field resolver.
///
/// The message only reaches the client when `expose` is set; `extensions` always do.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ResolverError {
    pub message: String,
    pub expose: bool,
    pub extensions: Object,
}

#[buildstructor::buildstructor]
impl ResolverError {
    #[builder(visibility = "pub")]
    fn new(
        message: String,
        expose: Option<bool>,
        // Skip the `Object` type alias in order to use buildstructor's map special-casing
        extensions: JsonMap<ByteString, Value>,
    ) -> Self {
        Self {
            message,
            expose: expose.unwrap_or_default(),
            extensions,
        }
    }
}

impl From<&str> for ResolverError {
    fn from(message: &str) -> Self {
        Self::new(message.to_owned(), None, Default::default())
    }
}

impl From<String> for ResolverError {
    fn from(message: String) -> Self {
        Self::new(message, None, Default::default())
    }
}

/// A GraphQL error produced by the query engine.
///
/// Errors raised during execution keep the [`ResolverError`] they originate from. Syntax,
/// validation and schema errors have none.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryError {
    pub error: graphql::Error,
    pub original_error: Option<ResolverError>,
}

impl QueryError {
    pub fn new(error: graphql::Error) -> Self {
        Self {
            error,
            original_error: None,
        }
    }

    pub fn with_original_error(mut self, original_error: ResolverError) -> Self {
        self.original_error = Some(original_error);
        self
    }

    /// Formats the error for a response body.
    ///
    /// Errors coming from resolvers keep their locations, path and extensions, but their
    /// message is replaced unless the resolver error was marked as exposed.
    pub fn to_graphql_error(&self) -> graphql::Error {
        let mut error = self.error.clone();
        if self
            .original_error
            .as_ref()
            .is_some_and(|original| !original.expose)
        {
            error.message = INTERNAL_SERVER_ERROR_MESSAGE.to_owned();
        }
        error
    }
}

impl From<graphql::Error> for QueryError {
    fn from(error: graphql::Error) -> Self {
        Self::new(error)
    }
}

impl From<CompilerError> for QueryError {
    fn from(error: CompilerError) -> Self {
        Self::new(error.into())
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error.locations.first() {
            Some(location) => write!(
                f,
                "[{}:{}] {}",
                location.line, location.column, self.error.message
            ),
            None => f.write_str(&self.error.message),
        }
    }
}

/// One or more GraphQL errors raised together, with the HTTP status they result in.
///
/// `expose` applies to the aggregate `message`; when set, every error of the aggregate
/// is formatted into the response body on its own terms.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct AggregateError {
    errors: Vec<QueryError>,
    message: String,
    status: StatusCode,
    expose: bool,
}

impl AggregateError {
    /// Creates an aggregate error, or `None` if there are no errors to aggregate.
    pub fn from_errors<E>(
        errors: impl IntoIterator<Item = E>,
        message: impl Into<String>,
        status: StatusCode,
        expose: bool,
    ) -> Option<Self>
    where
        E: Into<QueryError>,
    {
        let errors: Vec<QueryError> = errors.into_iter().map(Into::into).collect();
        if errors.is_empty() {
            return None;
        }
        Some(Self {
            errors,
            message: message.into(),
            status,
            expose,
        })
    }

    /// A query syntax error. Exposed, HTTP 400.
    pub fn syntax(error: impl Into<QueryError>) -> Self {
        Self {
            errors: vec![error.into()],
            message: "GraphQL query syntax errors.".to_owned(),
            status: StatusCode::BAD_REQUEST,
            expose: true,
        }
    }

    /// A single query validation error. Exposed, HTTP 400.
    pub fn invalid_query(error: impl Into<QueryError>) -> Self {
        Self {
            errors: vec![error.into()],
            message: "GraphQL query validation errors.".to_owned(),
            status: StatusCode::BAD_REQUEST,
            expose: true,
        }
    }

    /// Query validation errors. Exposed, HTTP 400.
    pub fn query_validation<E: Into<QueryError>>(
        errors: impl IntoIterator<Item = E>,
    ) -> Option<Self> {
        Self::from_errors(
            errors,
            "GraphQL query validation errors.",
            StatusCode::BAD_REQUEST,
            true,
        )
    }

    /// Execution errors. Exposed, and HTTP 200 as execution errors never change the
    /// transport status.
    pub fn execution<E: Into<QueryError>>(errors: impl IntoIterator<Item = E>) -> Option<Self> {
        Self::from_errors(errors, "GraphQL execution errors.", StatusCode::OK, true)
    }

    /// Schema validation errors. Not exposed, HTTP 500.
    pub fn schema_validation<E: Into<QueryError>>(
        label: &str,
        errors: impl IntoIterator<Item = E>,
    ) -> Option<Self> {
        Self::from_errors(
            errors,
            format!("{label} has GraphQL schema validation errors."),
            StatusCode::INTERNAL_SERVER_ERROR,
            false,
        )
    }

    pub fn errors(&self) -> &[QueryError] {
        &self.errors
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn expose(&self) -> bool {
        self.expose
    }
}

/// An error carrying its own HTTP status and exposure, for layers placed anywhere in
/// the stack.
///
/// ```ignore
/// let error = HttpError::builder()
///     .status(StatusCode::TOO_MANY_REQUESTS)
///     .message("Rate limit exceeded.")
///     .extension("code", "RATE_LIMIT_EXCEEDED")
///     .build();
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct HttpError {
    status: StatusCode,
    message: String,
    expose: bool,
    extensions: Object,
}

#[buildstructor::buildstructor]
impl HttpError {
    /// Builder methods:
    ///
    /// * `.status(StatusCode)` Required.
    /// * `.message(impl Into<String>)` Optional, defaults to the status reason phrase.
    /// * `.expose(bool)` Optional, defaults to `true` for statuses below 500.
    /// * `.extension(key, value)` / `.extensions(map)` Optional.
    #[builder(visibility = "pub")]
    fn new(
        status: StatusCode,
        message: Option<String>,
        expose: Option<bool>,
        // Skip the `Object` type alias in order to use buildstructor's map special-casing
        extensions: JsonMap<ByteString, Value>,
    ) -> Self {
        Self {
            message: message
                .unwrap_or_else(|| status.canonical_reason().unwrap_or_default().to_owned()),
            expose: expose.unwrap_or(!status.is_server_error()),
            status,
            extensions,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn expose(&self) -> bool {
        self.expose
    }

    pub fn extensions(&self) -> &Object {
        &self.extensions
    }
}

/// Every failure of the execute pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// Raised by a user supplied override or `execute` function.
    #[error("{0}")]
    Raised(BoxError),
}

/// Status, exposure and extensions of an error that is not formatted as a list of
/// GraphQL errors.
pub(crate) trait Exposure {
    fn status(&self) -> StatusCode;

    fn expose(&self) -> bool;

    fn extensions(&self) -> Option<&Object> {
        None
    }
}

impl Exposure for ConfigurationError {
    fn status(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn expose(&self) -> bool {
        false
    }
}

impl Exposure for RequestError {
    fn status(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }

    fn expose(&self) -> bool {
        true
    }
}

impl Exposure for AggregateError {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn expose(&self) -> bool {
        self.expose
    }
}

impl Exposure for HttpError {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn expose(&self) -> bool {
        self.expose
    }

    fn extensions(&self) -> Option<&Object> {
        (!self.extensions.is_empty()).then_some(&self.extensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphql::Location;
    use crate::json_ext::Path;

    #[test]
    fn configuration_error_messages() {
        let error = ConfigurationError::InvalidKeys {
            label: "GraphQL execute middleware".to_owned(),
            keys: OptionKeys(vec!["a".to_owned(), "c".to_owned()]),
        };
        assert_eq!(
            error.to_string(),
            "GraphQL execute middleware options invalid: `a`, `c`."
        );
        assert_eq!(
            ConfigurationError::SchemaType {
                label: "GraphQL execute middleware `schema` option".to_owned()
            }
            .to_string(),
            "GraphQL execute middleware `schema` option GraphQL schema must be a `Schema` instance."
        );
        assert_eq!(ConfigurationError::MissingBody.to_string(), "Request body missing.");
    }

    #[test]
    fn request_error_messages() {
        assert_eq!(
            RequestError::QueryMissing.to_string(),
            "GraphQL operation field `query` missing."
        );
        assert_eq!(
            RequestError::VariablesNotObject.to_string(),
            "Request body JSON `variables` field must be an object."
        );
    }

    #[test]
    fn aggregate_error_is_never_empty() {
        assert!(AggregateError::query_validation(Vec::<graphql::Error>::new()).is_none());
        assert!(AggregateError::execution(Vec::<QueryError>::new()).is_none());

        let error = AggregateError::query_validation(vec![
            graphql::Error::builder().message("a").build(),
            graphql::Error::builder().message("b").build(),
        ])
        .unwrap();
        assert_eq!(error.errors().len(), 2);
        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
        assert!(error.expose());
        assert_eq!(error.to_string(), "GraphQL query validation errors.");

        let error = AggregateError::invalid_query(graphql::Error::builder().message("a").build());
        assert_eq!(error.errors().len(), 1);
        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
        assert!(error.expose());
        assert_eq!(error.to_string(), "GraphQL query validation errors.");
    }

    #[test]
    fn schema_validation_error_is_hidden() {
        let error = AggregateError::schema_validation(
            "GraphQL execute middleware `schema` option",
            vec![graphql::Error::builder().message("bad").build()],
        )
        .unwrap();
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!error.expose());
        assert_eq!(
            error.message(),
            "GraphQL execute middleware `schema` option has GraphQL schema validation errors."
        );
    }

    #[test]
    fn resolver_messages_are_masked_unless_exposed() {
        let error = graphql::Error::builder()
            .message("Unexposed message.")
            .location(Location { line: 1, column: 3 })
            .path(Path::from(vec!["test"]))
            .extension("a", true)
            .build();

        let unexposed =
            QueryError::new(error.clone()).with_original_error("Unexposed message.".into());
        let formatted = unexposed.to_graphql_error();
        assert_eq!(formatted.message, INTERNAL_SERVER_ERROR_MESSAGE);
        assert_eq!(formatted.locations, error.locations);
        assert_eq!(formatted.path, error.path);
        assert_eq!(formatted.extensions, error.extensions);

        let exposed = QueryError::new(error.clone()).with_original_error(
            ResolverError::builder()
                .message("Unexposed message.")
                .expose(true)
                .build(),
        );
        assert_eq!(exposed.to_graphql_error(), error);

        // Validation errors have no resolver error and are always shown.
        assert_eq!(QueryError::new(error.clone()).to_graphql_error(), error);
    }

    #[test]
    fn http_error_defaults_follow_status() {
        let client = HttpError::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .build();
        assert_eq!(client.message(), "Too Many Requests");
        assert!(client.expose());
        assert!(Exposure::extensions(&client).is_none());

        let server = HttpError::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .message("Service unavailable due to maintenance.")
            .extension("code", "MAINTENANCE")
            .build();
        assert!(!server.expose());
        assert_eq!(
            Exposure::extensions(&server).and_then(|e| e.get("code")),
            Some(&Value::from("MAINTENANCE"))
        );
    }
}
