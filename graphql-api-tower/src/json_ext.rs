//! JSON helpers shared by the GraphQL types.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
pub use serde_json_bytes::Value;

/// A JSON object.
pub type Object = Map<ByteString, Value>;

/// One segment of a response [`Path`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    /// An index into a list.
    Index(usize),

    /// A field name or alias.
    Key(String),
}

/// A path into the `data` of a GraphQL response, serialized as a JSON array
/// such as `["user", "friends", 0, "name"]`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T> From<Vec<T>> for Path
where
    T: Into<PathElement>,
{
    fn from(elements: Vec<T>) -> Self {
        Path(elements.into_iter().map(Into::into).collect())
    }
}

impl From<&str> for PathElement {
    fn from(key: &str) -> Self {
        PathElement::Key(key.to_owned())
    }
}

impl From<String> for PathElement {
    fn from(key: String) -> Self {
        PathElement::Key(key)
    }
}

impl From<usize> for PathElement {
    fn from(index: usize) -> Self {
        PathElement::Index(index)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in &self.0 {
            write!(f, "/")?;
            match element {
                PathElement::Index(index) => write!(f, "{index}")?,
                PathElement::Key(key) => write!(f, "{key}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn path_serializes_as_array() {
        let path = Path::from(vec![
            PathElement::from("user"),
            PathElement::from(0),
            PathElement::from("name"),
        ]);
        assert_eq!(
            serde_json_bytes::to_value(&path).unwrap(),
            json!(["user", 0, "name"])
        );
        assert_eq!(path.to_string(), "/user/0/name");
    }

    #[test]
    fn path_deserializes_indexes_before_keys() {
        let path: Path = serde_json_bytes::from_value(json!(["a", 1])).unwrap();
        assert_eq!(
            path,
            Path(vec![PathElement::Key("a".into()), PathElement::Index(1)])
        );
    }
}
