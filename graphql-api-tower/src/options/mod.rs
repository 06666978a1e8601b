//! Execute options: checked once when the layer is built, and again on every request
//! for options supplied by an `override`.
//!
//! Options enter as an [`OptionValue`] map, the untyped form an `override` returns.
//! Only whitelisted keys are accepted, then each value is checked for the type its key
//! needs before it reaches the query engine.
mod schema;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use apollo_compiler::Schema;
use apollo_compiler::ast;
use apollo_compiler::validation::Valid;
use indexmap::IndexMap;
use serde_json_bytes::Value;
use tower::BoxError;
use tracing::Instrument;

pub(crate) use self::schema::check_schema;
use crate::error::ConfigurationError;
use crate::error::OptionKeys;
use crate::error::PipelineError;
use crate::execution::CompilerExecute;
use crate::execution::Execute;
use crate::execution::FieldResolver;
use crate::graphql;
use crate::services;

pub(crate) const STATIC_LABEL: &str = "GraphQL execute middleware";
pub(crate) const OVERRIDE_LABEL: &str = "GraphQL execute middleware `override` option resolved";

const SCHEMA: &str = "schema";
const VALIDATION_RULES: &str = "validationRules";
const ROOT_VALUE: &str = "rootValue";
const CONTEXT_VALUE: &str = "contextValue";
const FIELD_RESOLVER: &str = "fieldResolver";
const EXECUTE: &str = "execute";
const OVERRIDE: &str = "override";

/// Keys an `override` may return.
pub const ALLOWED_OVERRIDE_OPTIONS: &[&str] = &[
    SCHEMA,
    VALIDATION_RULES,
    ROOT_VALUE,
    CONTEXT_VALUE,
    FIELD_RESOLVER,
    EXECUTE,
];

/// Keys of the options the layer is built with.
pub const ALLOWED_STATIC_OPTIONS: &[&str] = &[
    SCHEMA,
    VALIDATION_RULES,
    ROOT_VALUE,
    CONTEXT_VALUE,
    FIELD_RESOLVER,
    EXECUTE,
    OVERRIDE,
];

/// A validation rule, run after the default GraphQL validation rules.
pub trait ValidationRule: Send + Sync {
    /// Returns the errors found in `document`, if any.
    fn validate(&self, schema: &Valid<Schema>, document: &ast::Document) -> Vec<graphql::Error>;
}

/// A [`ValidationRule`] from a closure, see [`rule_fn`].
#[derive(Clone, Copy)]
pub struct RuleFn<F>(F);

/// Returns a [`ValidationRule`] calling `f`.
pub fn rule_fn<F>(f: F) -> RuleFn<F>
where
    F: Fn(&Valid<Schema>, &ast::Document) -> Vec<graphql::Error> + Send + Sync,
{
    RuleFn(f)
}

impl<F> ValidationRule for RuleFn<F>
where
    F: Fn(&Valid<Schema>, &ast::Document) -> Vec<graphql::Error> + Send + Sync,
{
    fn validate(&self, schema: &Valid<Schema>, document: &ast::Document) -> Vec<graphql::Error> {
        (self.0)(schema, document)
    }
}

/// Supplies options for one request, taking precedence over the static options.
///
/// Returning `Err` fails the request as an internal error, unless the error is an
/// exposed [`HttpError`](crate::error::HttpError).
#[async_trait::async_trait]
pub trait OverrideOptions: Send + Sync {
    async fn options(&self, request: &services::Request) -> Result<OptionValue, BoxError>;
}

/// An [`OverrideOptions`] from a closure, see [`override_fn`].
#[derive(Clone, Copy)]
pub struct OverrideFn<F>(F);

/// Returns an [`OverrideOptions`] calling `f`.
///
/// The returned future cannot borrow the request; copy what it needs first.
pub fn override_fn<F, Fut>(f: F) -> OverrideFn<F>
where
    F: Fn(&services::Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<OptionValue, BoxError>> + Send,
{
    OverrideFn(f)
}

#[async_trait::async_trait]
impl<F, Fut> OverrideOptions for OverrideFn<F>
where
    F: Fn(&services::Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<OptionValue, BoxError>> + Send,
{
    async fn options(&self, request: &services::Request) -> Result<OptionValue, BoxError> {
        (self.0)(request).await
    }
}

/// An untyped option value.
///
/// A JSON object is a map whose values are all JSON, so an `override` may simply
/// return `json!({ "rootValue": ... })`.
#[derive(Clone)]
pub enum OptionValue {
    Json(Value),
    Map(IndexMap<String, OptionValue>),
    List(Vec<OptionValue>),
    Schema(Arc<Schema>),
    Rule(Arc<dyn ValidationRule>),
    FieldResolver(Arc<dyn FieldResolver>),
    Execute(Arc<dyn Execute>),
    Override(Arc<dyn OverrideOptions>),
}

impl OptionValue {
    pub fn rule(rule: impl ValidationRule + 'static) -> Self {
        Self::Rule(Arc::new(rule))
    }

    pub fn field_resolver(field_resolver: impl FieldResolver + 'static) -> Self {
        Self::FieldResolver(Arc::new(field_resolver))
    }

    pub fn execute(execute: impl Execute + 'static) -> Self {
        Self::Execute(Arc::new(execute))
    }

    pub fn override_options(override_options: impl OverrideOptions + 'static) -> Self {
        Self::Override(Arc::new(override_options))
    }
}

impl fmt::Debug for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Map(entries) => f.debug_map().entries(entries.iter()).finish(),
            Self::List(items) => f.debug_list().entries(items.iter()).finish(),
            Self::Schema(_) => f.write_str("Schema"),
            Self::Rule(_) => f.write_str("Rule"),
            Self::FieldResolver(_) => f.write_str("FieldResolver"),
            Self::Execute(_) => f.write_str("Execute"),
            Self::Override(_) => f.write_str("Override"),
        }
    }
}

impl From<Value> for OptionValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Schema> for OptionValue {
    fn from(schema: Schema) -> Self {
        Self::Schema(Arc::new(schema))
    }
}

impl From<Valid<Schema>> for OptionValue {
    fn from(schema: Valid<Schema>) -> Self {
        Self::Schema(Arc::new(schema.into_inner()))
    }
}

impl From<Arc<Schema>> for OptionValue {
    fn from(schema: Arc<Schema>) -> Self {
        Self::Schema(schema)
    }
}

impl From<Vec<OptionValue>> for OptionValue {
    fn from(items: Vec<OptionValue>) -> Self {
        Self::List(items)
    }
}

impl From<IndexMap<String, OptionValue>> for OptionValue {
    fn from(entries: IndexMap<String, OptionValue>) -> Self {
        Self::Map(entries)
    }
}

impl<K> FromIterator<(K, OptionValue)> for OptionValue
where
    K: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, OptionValue)>>(iter: T) -> Self {
        Self::Map(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<ExecuteOptions> for OptionValue {
    fn from(options: ExecuteOptions) -> Self {
        Self::Map(options.entries)
    }
}

/// Typed construction of execute options.
///
/// ```ignore
/// let options = ExecuteOptions::new()
///     .schema(schema)
///     .root_value(json!({ "test": "ok" }))
///     .field_resolver(resolver_fn(|source, info| DefaultFieldResolver.resolve(source, info)));
/// ```
#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    entries: IndexMap<String, OptionValue>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn schema(self, schema: impl Into<Arc<Schema>>) -> Self {
        self.with(SCHEMA, OptionValue::Schema(schema.into()))
    }

    /// Adds a rule run after the default validation rules.
    pub fn validation_rule(mut self, rule: impl ValidationRule + 'static) -> Self {
        let rule = OptionValue::rule(rule);
        match self.entries.get_mut(VALIDATION_RULES) {
            Some(OptionValue::List(rules)) => rules.push(rule),
            _ => {
                self.entries
                    .insert(VALIDATION_RULES.to_owned(), OptionValue::List(vec![rule]));
            }
        }
        self
    }

    pub fn root_value(self, root_value: Value) -> Self {
        self.with(ROOT_VALUE, OptionValue::Json(root_value))
    }

    pub fn context_value(self, context_value: Value) -> Self {
        self.with(CONTEXT_VALUE, OptionValue::Json(context_value))
    }

    pub fn field_resolver(self, field_resolver: impl FieldResolver + 'static) -> Self {
        self.with(FIELD_RESOLVER, OptionValue::field_resolver(field_resolver))
    }

    pub fn execute(self, execute: impl Execute + 'static) -> Self {
        self.with(EXECUTE, OptionValue::execute(execute))
    }

    /// Sets the per request options supplier. Not valid in options it returns.
    pub fn override_options(self, override_options: impl OverrideOptions + 'static) -> Self {
        self.with(OVERRIDE, OptionValue::override_options(override_options))
    }

    fn with(mut self, key: &str, value: OptionValue) -> Self {
        self.entries.insert(key.to_owned(), value);
        self
    }
}

/// Checks that `options` is a map with only `allowed` keys, and returns its entries.
pub fn check_options(
    options: OptionValue,
    allowed: &[&str],
    label: &str,
) -> Result<IndexMap<String, OptionValue>, ConfigurationError> {
    let entries = match options {
        OptionValue::Map(entries) => entries,
        OptionValue::Json(Value::Object(object)) => object
            .into_iter()
            .map(|(key, value)| (key.as_str().to_owned(), OptionValue::Json(value)))
            .collect(),
        _ => {
            return Err(ConfigurationError::NotEnumerable {
                label: label.to_owned(),
            });
        }
    };

    let invalid: Vec<String> = entries
        .keys()
        .filter(|key| !allowed.contains(&key.as_str()))
        .cloned()
        .collect();
    if !invalid.is_empty() {
        return Err(ConfigurationError::InvalidKeys {
            label: label.to_owned(),
            keys: OptionKeys(invalid),
        });
    }
    Ok(entries)
}

/// Options checked key by key. A field is `None` when its key was absent.
#[derive(Clone, Default)]
struct PartialOptions {
    schema: Option<Arc<Valid<Schema>>>,
    validation_rules: Option<Vec<Arc<dyn ValidationRule>>>,
    root_value: Option<Value>,
    context_value: Option<Value>,
    field_resolver: Option<Arc<dyn FieldResolver>>,
    execute: Option<Arc<dyn Execute>>,
    override_options: Option<Arc<dyn OverrideOptions>>,
}

impl PartialOptions {
    /// Checks entries in a fixed key order, so the first error reported does not depend
    /// on the order keys were given in.
    fn from_entries(
        mut entries: IndexMap<String, OptionValue>,
        label: &str,
    ) -> Result<Self, PipelineError> {
        let mut options = Self::default();
        for key in ALLOWED_STATIC_OPTIONS {
            let Some(value) = entries.shift_remove(*key) else {
                continue;
            };
            let label = format!("{label} `{key}` option");
            match *key {
                SCHEMA => options.schema = Some(check_schema(value, &label)?),
                VALIDATION_RULES => options.validation_rules = Some(check_rules(value, &label)?),
                ROOT_VALUE => options.root_value = Some(check_json(value, &label)?),
                CONTEXT_VALUE => options.context_value = Some(check_json(value, &label)?),
                FIELD_RESOLVER => match value {
                    OptionValue::FieldResolver(field_resolver) => {
                        options.field_resolver = Some(field_resolver)
                    }
                    _ => return Err(ConfigurationError::NotFunction { label }.into()),
                },
                EXECUTE => match value {
                    OptionValue::Execute(execute) => options.execute = Some(execute),
                    _ => return Err(ConfigurationError::NotFunction { label }.into()),
                },
                OVERRIDE => match value {
                    OptionValue::Override(override_options) => {
                        options.override_options = Some(override_options)
                    }
                    _ => return Err(ConfigurationError::NotFunction { label }.into()),
                },
                _ => {}
            }
        }
        Ok(options)
    }

    /// Key by key overlay, `other` wins.
    fn overlay(self, other: Self) -> Self {
        Self {
            schema: other.schema.or(self.schema),
            validation_rules: other.validation_rules.or(self.validation_rules),
            root_value: other.root_value.or(self.root_value),
            context_value: other.context_value.or(self.context_value),
            field_resolver: other.field_resolver.or(self.field_resolver),
            execute: other.execute.or(self.execute),
            override_options: None,
        }
    }
}

fn check_rules(
    value: OptionValue,
    label: &str,
) -> Result<Vec<Arc<dyn ValidationRule>>, ConfigurationError> {
    let items = match value {
        OptionValue::List(items) => items,
        OptionValue::Json(Value::Array(items)) => {
            items.into_iter().map(OptionValue::Json).collect()
        }
        _ => {
            return Err(ConfigurationError::ValidationRulesNotList {
                label: label.to_owned(),
            });
        }
    };
    items
        .into_iter()
        .map(|item| match item {
            OptionValue::Rule(rule) => Ok(rule),
            _ => Err(ConfigurationError::ValidationRulesNotFunctions {
                label: label.to_owned(),
            }),
        })
        .collect()
}

fn check_json(value: OptionValue, label: &str) -> Result<Value, ConfigurationError> {
    match value {
        OptionValue::Json(value) => Ok(value),
        _ => Err(ConfigurationError::NotJson {
            label: label.to_owned(),
        }),
    }
}

/// The options one request executes with.
#[derive(Clone)]
pub struct RequestOptions {
    pub schema: Arc<Valid<Schema>>,
    /// Run after the default rules.
    pub validation_rules: Vec<Arc<dyn ValidationRule>>,
    pub root_value: Value,
    pub context_value: Value,
    pub field_resolver: Option<Arc<dyn FieldResolver>>,
    pub execute: Arc<dyn Execute>,
}

/// Merges the static options with the options an `override` supplies for a request.
#[derive(Clone)]
pub struct OptionsResolver {
    static_options: PartialOptions,
    override_options: Option<Arc<dyn OverrideOptions>>,
}

impl fmt::Debug for OptionsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionsResolver")
            .field("has_schema", &self.static_options.schema.is_some())
            .field("has_override", &self.override_options.is_some())
            .finish_non_exhaustive()
    }
}

impl OptionsResolver {
    /// Checks the static options.
    ///
    /// A schema is only required once options are resolved for a request, as an
    /// `override` may supply it.
    pub fn new(options: impl Into<OptionValue>) -> Result<Self, PipelineError> {
        let entries = check_options(options.into(), ALLOWED_STATIC_OPTIONS, STATIC_LABEL)?;
        let mut static_options = PartialOptions::from_entries(entries, STATIC_LABEL)?;
        let override_options = static_options.override_options.take();
        Ok(Self {
            static_options,
            override_options,
        })
    }

    /// Resolves the options for one request.
    ///
    /// A new set of options is built for each request; the static options are never
    /// modified.
    pub async fn resolve(
        &self,
        request: &services::Request,
    ) -> Result<RequestOptions, PipelineError> {
        let mut options = self.static_options.clone();
        if let Some(override_options) = &self.override_options {
            let resolved = override_options
                .options(request)
                .instrument(tracing::info_span!("resolve_options"))
                .await
                .map_err(PipelineError::Raised)?;
            let entries = check_options(resolved, ALLOWED_OVERRIDE_OPTIONS, OVERRIDE_LABEL)?;
            options = options.overlay(PartialOptions::from_entries(entries, OVERRIDE_LABEL)?);
        }

        let schema = options.schema.ok_or(ConfigurationError::MissingSchema)?;
        Ok(RequestOptions {
            schema,
            validation_rules: options.validation_rules.unwrap_or_default(),
            root_value: options.root_value.unwrap_or(Value::Null),
            context_value: options.context_value.unwrap_or(Value::Null),
            field_resolver: options.field_resolver,
            execute: options
                .execute
                .unwrap_or_else(|| Arc::new(CompilerExecute) as Arc<dyn Execute>),
        })
    }
}
