use std::sync::Arc;

use apollo_compiler::Schema;
use apollo_compiler::validation::Valid;

use super::OptionValue;
use crate::error::AggregateError;
use crate::error::ConfigurationError;
use crate::error::PipelineError;

/// Checks that `value` is a schema passing GraphQL schema validation.
///
/// The supplied schema is left untouched; a validated copy is returned.
pub(crate) fn check_schema(
    value: OptionValue,
    label: &str,
) -> Result<Arc<Valid<Schema>>, PipelineError> {
    let OptionValue::Schema(schema) = value else {
        return Err(ConfigurationError::SchemaType {
            label: label.to_owned(),
        }
        .into());
    };

    match Schema::clone(&schema).validate() {
        Ok(schema) => Ok(Arc::new(schema)),
        Err(invalid) => {
            let errors = invalid.errors.iter().map(|diagnostic| diagnostic.to_json());
            match AggregateError::schema_validation(label, errors) {
                Some(error) => {
                    tracing::debug!(%label, "invalid GraphQL schema: {}", invalid.errors);
                    Err(error.into())
                }
                None => Ok(Arc::new(Valid::assume_valid(invalid.partial))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_valid_schema() {
        let schema = Schema::parse("type Query { test: String }", "schema.graphql").unwrap();
        let checked = check_schema(schema.into(), "label").unwrap();
        assert!(checked.types.contains_key("Query"));
    }

    #[test]
    fn collects_every_schema_error() {
        let schema = Schema::parse(
            "type Query { a: Missing b: AlsoMissing }",
            "schema.graphql",
        )
        .unwrap();
        let Err(PipelineError::Aggregate(error)) = check_schema(schema.into(), "label") else {
            panic!("expected schema validation errors");
        };
        assert_eq!(error.errors().len(), 2);
        assert!(error.errors().iter().all(|e| e.original_error.is_none()));
    }
}
