pub mod conversation;
pub mod error;
pub mod intent;
pub mod query;
pub mod response;
pub mod schema;

pub use conversation::*;
pub use error::*;
pub use intent::*;
pub use query::*;
pub use response::*;
pub use schema::*;
