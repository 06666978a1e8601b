//! Logic for loading configuration in to an object model
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use displaydoc::Display;
use schemars::JsonSchema;
use schemars::r#gen::SchemaSettings;
use schemars::schema::RootSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error, Display)]
#[non_exhaustive]
pub enum ReadConfigError {
    /// could not read configuration: {0}
    Io(#[from] std::io::Error),
    /// could not deserialize configuration: {0}
    Deserialize(#[from] serde_yaml::Error),
    /// could not convert the root value: {0}
    RootValue(#[from] serde_json::Error),
}

/// The configuration of the GraphQL server.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    /// Configuration options pertaining to the http server component.
    #[serde(default)]
    pub server: Server,

    /// Limits applied to incoming requests.
    #[serde(default)]
    pub limits: Limits,

    /// Path of the GraphQL schema definition (SDL) file.
    /// May also be given on the command line.
    #[serde(default)]
    pub schema_file: Option<PathBuf>,

    /// Source value of the root fields, passed as the `rootValue` execute option.
    #[serde(default)]
    pub root_value: Option<serde_json::Value>,
}

impl Configuration {
    pub fn read(path: &Path) -> Result<Self, ReadConfigError> {
        let config = fs::read_to_string(path)?;
        config.parse()
    }

    /// The `root_value` as a response JSON value.
    pub fn root_value(&self) -> Result<Option<serde_json_bytes::Value>, ReadConfigError> {
        self.root_value
            .as_ref()
            .map(serde_json_bytes::to_value)
            .transpose()
            .map_err(ReadConfigError::from)
    }
}

impl FromStr for Configuration {
    type Err = ReadConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(s)?)
    }
}

/// Configuration options pertaining to the http server component.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Server {
    /// The socket address and port to listen on
    /// Defaults to 127.0.0.1:4000
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// The HTTP path on which GraphQL requests will be served.
    /// default: "/"
    #[serde(default = "default_graphql_path")]
    pub path: String,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_graphql_path(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4000))
}

fn default_graphql_path() -> String {
    String::from("/")
}

/// Limits applied to incoming requests.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    /// Largest accepted request body, in bytes.
    /// default: 2000000
    #[serde(default = "default_http_max_request_bytes")]
    pub http_max_request_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            http_max_request_bytes: default_http_max_request_bytes(),
        }
    }
}

fn default_http_max_request_bytes() -> usize {
    2_000_000
}

/// Generate a JSON schema for the configuration.
pub fn generate_config_schema() -> RootSchema {
    let settings = SchemaSettings::draft07().with(|s| {
        s.option_nullable = true;
        s.option_add_null_type = false;
        s.inline_subschemas = true;
    });
    settings
        .into_generator()
        .into_root_schema_for::<Configuration>()
}
