use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;

use crate::error::RequestError;
use crate::json_ext::Object;

/// A GraphQL `Request` used to represent a client request body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// The GraphQL operation (e.g., query, mutation) string.
    pub query: String,

    /// The (optional) GraphQL operation name.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operation_name: Option<String>,

    /// The (optional) GraphQL variables in the form of a JSON object.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub variables: Object,
}

#[buildstructor::buildstructor]
impl Request {
    /// This is the constructor (or builder) to use when constructing a GraphQL
    /// `Request`.
    #[builder(visibility = "pub")]
    fn new(
        query: String,
        operation_name: Option<String>,
        // Skip the `Object` type alias in order to use buildstructor's map special-casing
        variables: JsonMap<ByteString, Value>,
    ) -> Self {
        Self {
            query,
            operation_name,
            variables,
        }
    }

    /// Extracts a GraphQL request from a parsed request body.
    ///
    /// `operationName` and `variables` may be absent or `null`.
    pub fn from_body(body: &Value) -> Result<Self, RequestError> {
        let object = body.as_object().ok_or(RequestError::BodyNotObject)?;

        let query = match object.get("query") {
            None => return Err(RequestError::QueryMissing),
            Some(Value::String(query)) => query.as_str().to_owned(),
            Some(_) => return Err(RequestError::QueryNotString),
        };

        let operation_name = match object.get("operationName") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(name.as_str().to_owned()),
            Some(_) => return Err(RequestError::OperationNameNotString),
        };

        let variables = match object.get("variables") {
            None | Some(Value::Null) => Object::new(),
            Some(Value::Object(variables)) => variables.clone(),
            Some(_) => return Err(RequestError::VariablesNotObject),
        };

        Ok(Self {
            query,
            operation_name,
            variables,
        })
    }
}
