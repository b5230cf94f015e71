pub mod error;
pub mod types;
pub mod value;

pub use error::{InterruptReason, ProxyError, Result};
pub use types::{Row, estimated_row_bytes};
pub use value::Value;
