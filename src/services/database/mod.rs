// Database abstraction layer
pub mod adapter;
pub mod postgresql;

pub use adapter::{DatabaseAdapter, DatabaseError};
pub use postgresql::PostgreSQLAdapter;
