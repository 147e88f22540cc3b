//! Shared types for the KohakuRiver control plane: the data model crossing
//! the Host/Runner HTTP boundary, the error taxonomy both sides map to HTTP
//! responses, and the snowflake task-id generator.

pub mod error;
pub mod model;
pub mod snowflake;

pub use error::ErrorKind;
pub use model::*;
pub use snowflake::{Snowflake, SnowflakeError};
