pub mod error;
pub mod types;
pub mod value;

pub use error::{DataError, ResolutionError, Result, SchemaError};
pub use types::{Column, EntityId, Row, Snapshot};
pub use value::{DataType, Value};
