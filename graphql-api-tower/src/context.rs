//! Request context shared by every layer handling the same request.
//!
//! A [`Context`] holds two things:
//! * serializable entries which layers use to pass data to each other, and which error
//!   subscribers can read, such as [`OPERATION_NAME`]
//! * the parts of the outgoing response (status, body, content type), which layers
//!   update in place before the response is rendered.
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;

use dashmap::DashMap;
use http::HeaderValue;
use http::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json_bytes::Value;
use tower::BoxError;

/// The `operationName` of the request body, when it has one.
pub const OPERATION_NAME: &str = "graphql_api_tower::operation_name";

/// Holds [`Context`] entries.
pub(crate) type Entries = Arc<DashMap<String, Value>>;

/// The outgoing response, as built up by the layers of the stack.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponseParts {
    /// The HTTP status. When unset, it is derived from the presence of a body.
    pub status: Option<StatusCode>,

    /// The JSON response body.
    pub body: Option<Value>,

    /// The `content-type` header value.
    pub content_type: Option<HeaderValue>,
}

/// Context for a request.
///
/// Cloning a context is cheap; clones share the same entries and response parts.
#[derive(Clone, Debug, Default)]
pub struct Context {
    entries: Entries,
    response: Arc<parking_lot::Mutex<ResponseParts>>,
}

impl Context {
    pub fn new() -> Self {
        Default::default()
    }

    /// Get a value from the context using the provided key.
    ///
    /// Semantics:
    ///  - If the operation fails, that's because we can't deserialize the value.
    ///  - If the operation succeeds, the value is an [`Option`].
    pub fn get<K, V>(&self, key: K) -> Result<Option<V>, BoxError>
    where
        K: Into<String>,
        V: DeserializeOwned,
    {
        self.entries
            .get(&key.into())
            .map(|v| serde_json_bytes::from_value(v.value().clone()))
            .transpose()
            .map_err(|e| e.into())
    }

    /// Insert a value into the context using the provided key and value.
    ///
    /// Semantics:
    ///  - If the operation fails, then the pair has not been inserted.
    ///  - If the operation succeeds, the result is the old value as an [`Option`].
    pub fn insert<K, V>(&self, key: K, value: V) -> Result<Option<V>, BoxError>
    where
        K: Into<String>,
        V: DeserializeOwned + Serialize,
    {
        match serde_json_bytes::to_value(value) {
            Ok(value) => self
                .entries
                .insert(key.into(), value)
                .map(serde_json_bytes::from_value)
                .transpose()
                .map_err(|e| e.into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Locks the response parts for reading or mutation.
    ///
    /// The lock is released once the closure completes; do not hold it across an
    /// `.await`.
    pub fn with_response<T>(&self, func: impl FnOnce(&mut ResponseGuard<'_>) -> T) -> T {
        let mut guard = ResponseGuard {
            guard: self.response.lock(),
        };
        func(&mut guard)
    }

    /// A copy of the current response parts.
    pub fn response_parts(&self) -> ResponseParts {
        self.response.lock().clone()
    }
}

/// Locked access to [`ResponseParts`].
pub struct ResponseGuard<'a> {
    guard: parking_lot::MutexGuard<'a, ResponseParts>,
}

impl Deref for ResponseGuard<'_> {
    type Target = ResponseParts;

    fn deref(&self) -> &ResponseParts {
        &self.guard
    }
}

impl DerefMut for ResponseGuard<'_> {
    fn deref_mut(&mut self) -> &mut ResponseParts {
        &mut self.guard
    }
}
