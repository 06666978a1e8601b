//! Query execution on top of the `apollo-compiler` resolver engine.
//!
//! Resolved values are plain JSON. A [`FieldResolver`] computes the value of every
//! field from the value of its parent object; [`DefaultFieldResolver`] reads the member
//! of the same name. [`CompilerExecute`] walks the operation, and an [`Execute`]
//! implementation may replace it entirely.
use std::cell::RefCell;
use std::fmt;

use apollo_compiler::ExecutableDocument;
use apollo_compiler::Schema;
use apollo_compiler::ast::OperationType;
use apollo_compiler::resolvers::Execution;
use apollo_compiler::resolvers::FieldError;
use apollo_compiler::resolvers::ObjectValue;
use apollo_compiler::resolvers::ResolveInfo;
use apollo_compiler::resolvers::ResolvedValue;
use apollo_compiler::validation::Valid;
use serde_json_bytes::Value;
use tower::BoxError;

use crate::error::QueryError;
use crate::error::ResolverError;
use crate::graphql;
use crate::json_ext::Object;

/// Surrounds the index of a recorded resolver error in messages handed to the engine.
const RESOLVER_ERROR_MARKER: char = '\u{1f}';

/// What a [`FieldResolver`] knows about the field it resolves.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct FieldInfo<'a> {
    /// Name of the object type the field belongs to.
    pub parent_type: &'a str,
    pub field_name: &'a str,
    /// Argument values, coerced against the schema.
    pub arguments: &'a Object,
    /// The `contextValue` execute option, `null` when not configured.
    pub context_value: &'a Value,
}

/// Computes the value of a field from the value of its parent object.
///
/// The returned value may be a JSON object, which then resolves its own selection set.
/// Objects of an abstract type need a `__typename` member.
pub trait FieldResolver: Send + Sync {
    fn resolve(&self, source: &Value, info: &FieldInfo<'_>) -> Result<Value, ResolverError>;
}

/// Reads the member named after the field from an object source, `null` otherwise.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultFieldResolver;

impl FieldResolver for DefaultFieldResolver {
    fn resolve(&self, source: &Value, info: &FieldInfo<'_>) -> Result<Value, ResolverError> {
        Ok(source
            .as_object()
            .and_then(|object| object.get(info.field_name))
            .cloned()
            .unwrap_or(Value::Null))
    }
}

/// A [`FieldResolver`] from a closure, see [`resolver_fn`].
#[derive(Clone, Copy)]
pub struct ResolverFn<F>(F);

/// Returns a [`FieldResolver`] calling `f`.
pub fn resolver_fn<F>(f: F) -> ResolverFn<F>
where
    F: Fn(&Value, &FieldInfo<'_>) -> Result<Value, ResolverError> + Send + Sync,
{
    ResolverFn(f)
}

impl<F> FieldResolver for ResolverFn<F>
where
    F: Fn(&Value, &FieldInfo<'_>) -> Result<Value, ResolverError> + Send + Sync,
{
    fn resolve(&self, source: &Value, info: &FieldInfo<'_>) -> Result<Value, ResolverError> {
        (self.0)(source, info)
    }
}

impl<F> fmt::Debug for ResolverFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverFn").finish_non_exhaustive()
    }
}

/// Everything an execution needs, borrowed from the request options.
#[derive(Clone, Copy)]
#[non_exhaustive]
pub struct ExecutionArgs<'a> {
    pub schema: &'a Valid<Schema>,
    pub document: &'a Valid<ExecutableDocument>,
    /// Source value of the root fields, `null` when not configured.
    pub root_value: &'a Value,
    pub context_value: &'a Value,
    /// Replaces [`DefaultFieldResolver`] when set.
    pub field_resolver: Option<&'a dyn FieldResolver>,
    pub variable_values: &'a Object,
    pub operation_name: Option<&'a str>,
}

/// The outcome of executing an operation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionResult {
    pub data: Option<Object>,
    pub errors: Vec<QueryError>,
}

/// Executes a validated operation.
///
/// Returning `Err` means the execution itself failed, as opposed to errors in
/// [`ExecutionResult::errors`]; it is reported as an internal error.
#[async_trait::async_trait]
pub trait Execute: Send + Sync {
    async fn execute(&self, args: ExecutionArgs<'_>) -> Result<ExecutionResult, BoxError>;
}

/// An [`Execute`] from a synchronous closure, see [`execute_fn`].
#[derive(Clone, Copy)]
pub struct ExecuteFn<F>(F);

/// Returns an [`Execute`] calling `f`.
///
/// Wrap [`CompilerExecute::execute_sync`] to post-process the default execution.
pub fn execute_fn<F>(f: F) -> ExecuteFn<F>
where
    F: Fn(ExecutionArgs<'_>) -> Result<ExecutionResult, BoxError> + Send + Sync,
{
    ExecuteFn(f)
}

#[async_trait::async_trait]
impl<F> Execute for ExecuteFn<F>
where
    F: Fn(ExecutionArgs<'_>) -> Result<ExecutionResult, BoxError> + Send + Sync,
{
    async fn execute(&self, args: ExecutionArgs<'_>) -> Result<ExecutionResult, BoxError> {
        (self.0)(args)
    }
}

impl<F> fmt::Debug for ExecuteFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteFn").finish_non_exhaustive()
    }
}

/// The default [`Execute`], running the `apollo-compiler` resolver engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompilerExecute;

#[async_trait::async_trait]
impl Execute for CompilerExecute {
    async fn execute(&self, args: ExecutionArgs<'_>) -> Result<ExecutionResult, BoxError> {
        self.execute_sync(args)
    }
}

impl CompilerExecute {
    /// Executes the operation, blocking until every field is resolved.
    ///
    /// Field errors carry the [`ResolverError`] they originate from. Errors raised by the
    /// engine itself during execution, such as a `null` in a non-null position, carry an
    /// unexposed one. Request errors (unknown operation, invalid variables) carry none.
    pub fn execute_sync(&self, args: ExecutionArgs<'_>) -> Result<ExecutionResult, BoxError> {
        let document = args.document;
        let request_error = |error: apollo_compiler::response::GraphQLError| ExecutionResult {
            data: None,
            errors: vec![QueryError::from(error)],
        };

        let operation = match document.operations.get(args.operation_name) {
            Ok(operation) => operation,
            Err(error) => return Ok(request_error(error.to_graphql_error(&document.sources))),
        };
        if operation.operation_type == OperationType::Subscription {
            return Ok(ExecutionResult {
                data: None,
                errors: vec![QueryError::new(
                    graphql::Error::builder()
                        .message("Subscription operations are not supported.")
                        .build(),
                )],
            });
        }
        let root_type = match args.schema.root_operation(operation.operation_type) {
            Some(root_type) => root_type.as_str(),
            None => {
                return Ok(ExecutionResult {
                    data: None,
                    errors: vec![QueryError::new(
                        graphql::Error::builder()
                            .message(format!(
                                "Schema does not support {} operations.",
                                operation_type_name(operation.operation_type)
                            ))
                            .build(),
                    )],
                });
            }
        };

        let resolver_errors = RefCell::new(Vec::new());
        let field_resolver = args.field_resolver.unwrap_or(&DefaultFieldResolver);
        let root = JsonObject {
            type_name: root_type.to_owned(),
            value: args.root_value.clone(),
            resolver: Resolver {
                field_resolver,
                context_value: args.context_value,
                errors: &resolver_errors,
            },
        };

        let response = match Execution::new(args.schema, document)
            .operation(operation)
            .raw_variable_values(args.variable_values)
            .execute_sync(&root)
        {
            Ok(response) => response,
            Err(error) => return Ok(request_error(error.to_graphql_error(&document.sources))),
        };

        let resolver_errors = resolver_errors.into_inner();
        let errors = response
            .errors
            .into_iter()
            .map(|error| attach_original_error(error.into(), &resolver_errors))
            .collect();
        let data = match Value::from(response.data) {
            Value::Object(data) => Some(data),
            _ => None,
        };
        Ok(ExecutionResult { data, errors })
    }
}

/// Restores the message of a recorded resolver error and keeps it as the origin.
fn attach_original_error(mut error: graphql::Error, recorded: &[ResolverError]) -> QueryError {
    let original = marker_index(&error.message).and_then(|index| recorded.get(index));
    match original {
        Some(original) => {
            error.message = original.message.clone();
            for (key, value) in &original.extensions {
                error.extensions.insert(key.clone(), value.clone());
            }
            QueryError::new(error).with_original_error(original.clone())
        }
        None => {
            let original = ResolverError::from(error.message.clone());
            QueryError::new(error).with_original_error(original)
        }
    }
}

fn marker_index(message: &str) -> Option<usize> {
    let (_, rest) = message.split_once(RESOLVER_ERROR_MARKER)?;
    let (index, _) = rest.split_once(RESOLVER_ERROR_MARKER)?;
    index.parse().ok()
}

fn operation_type_name(operation_type: OperationType) -> &'static str {
    match operation_type {
        OperationType::Query => "query",
        OperationType::Mutation => "mutation",
        OperationType::Subscription => "subscription",
    }
}

/// State shared by every object of one execution.
#[derive(Clone, Copy)]
struct Resolver<'a> {
    field_resolver: &'a dyn FieldResolver,
    context_value: &'a Value,
    errors: &'a RefCell<Vec<ResolverError>>,
}

impl Resolver<'_> {
    /// Records the error and hands the engine a message referring to it.
    fn record(&self, error: ResolverError) -> FieldError {
        let mut errors = self.errors.borrow_mut();
        let index = errors.len();
        errors.push(error);
        FieldError {
            message: format!("{RESOLVER_ERROR_MARKER}{index}{RESOLVER_ERROR_MARKER}"),
        }
    }
}

/// A JSON value resolving a selection set.
struct JsonObject<'a> {
    type_name: String,
    value: Value,
    resolver: Resolver<'a>,
}

impl ObjectValue for JsonObject<'_> {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn resolve_field<'a>(
        &'a self,
        info: &'a ResolveInfo<'a>,
    ) -> Result<ResolvedValue<'a>, FieldError> {
        let field_info = FieldInfo {
            parent_type: &self.type_name,
            field_name: info.field_name(),
            arguments: info.arguments(),
            context_value: self.resolver.context_value,
        };
        match self.resolver.field_resolver.resolve(&self.value, &field_info) {
            Ok(value) => Ok(resolve_value(self.resolver, value, info)),
            Err(error) => Err(self.resolver.record(error)),
        }
    }
}

fn resolve_value<'a>(
    resolver: Resolver<'a>,
    value: Value,
    info: &'a ResolveInfo<'a>,
) -> ResolvedValue<'a> {
    match value {
        Value::Object(object) => {
            let type_name = match object.get("__typename") {
                Some(Value::String(type_name)) => type_name.as_str().to_owned(),
                _ => info
                    .field_definition()
                    .ty
                    .inner_named_type()
                    .as_str()
                    .to_owned(),
            };
            ResolvedValue::object(JsonObject {
                type_name,
                value: Value::Object(object),
                resolver,
            })
        }
        Value::Array(items) => ResolvedValue::List(Box::new(
            items
                .into_iter()
                .map(move |item| Ok(resolve_value(resolver, item, info))),
        )),
        leaf => ResolvedValue::leaf(leaf),
    }
}
