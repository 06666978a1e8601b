//! GraphQL execution and error handling layers for tower services.
//!
//! A typical stack, outermost first:
//! [`ErrorHandlerLayer`](services::ErrorHandlerLayer),
//! [`BodyParserLayer`](services::BodyParserLayer),
//! [`ExecuteLayer`](services::ExecuteLayer) and [`respond`](services::respond).

#![warn(unreachable_pub)]

pub mod axum_factory;
pub mod configuration;
mod context;
pub mod error;
mod executable;
pub mod execution;
pub mod graphql;
pub mod json_ext;
pub mod options;
pub mod services;

pub use configuration::Configuration;
pub use context::Context;
pub use context::OPERATION_NAME;
pub use context::ResponseGuard;
pub use context::ResponseParts;
pub use executable::main;
pub use options::ExecuteOptions;
pub use options::OptionValue;
