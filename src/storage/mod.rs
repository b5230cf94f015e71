pub mod persistence;

pub use persistence::{read_json, write_json_atomic};
