pub mod conversation;
pub mod schema;

use std::sync::Arc;

use crate::services::{SchemaCatalogService, SessionManager};

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub catalog: Arc<SchemaCatalogService>,
}
