pub mod chat_service;
pub mod connection_pool;
pub mod database;
pub mod intent_router;
pub mod llm_service;
pub mod orchestrator;
pub mod query_service;
pub mod query_synthesizer;
pub mod schema_catalog;
pub mod session_manager;

pub use chat_service::*;
pub use connection_pool::*;
pub use intent_router::*;
pub use llm_service::*;
pub use orchestrator::*;
pub use query_service::*;
pub use query_synthesizer::*;
pub use schema_catalog::*;
pub use session_manager::*;
