use crate::config::SessionConfig;
use crate::models::{ConversationTurn, TurnResponse};
use crate::services::orchestrator::{Orchestrator, Session, SessionState, TurnCancelled};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(Uuid),

    #[error("Turn was cancelled")]
    Cancelled,

    #[error("Session limit of {0} reached")]
    TooManySessions(usize),
}

impl From<TurnCancelled> for SessionError {
    fn from(_: TurnCancelled) -> Self {
        SessionError::Cancelled
    }
}

/// Registry entry for one session
pub struct SessionHandle {
    id: Uuid,
    created_at: DateTime<Utc>,
    // Held for the whole turn, so turns of one session run one at a time
    session: tokio::sync::Mutex<Session>,
    in_flight: parking_lot::Mutex<Option<CancellationToken>>,
    last_active: parking_lot::Mutex<Instant>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// Cancel the running turn, if any
    pub fn cancel(&self) -> bool {
        match self.in_flight.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionHistory {
    pub id: Uuid,
    pub state: SessionState,
    pub turns: Vec<ConversationTurn>,
}

/// In-memory session registry.
///
/// Sessions run in parallel with each other; turns within a session are
/// serialized by the session's own lock. Idle sessions are evicted after
/// `idle_ttl`, and the registry never holds more than `max_sessions`.
pub struct SessionManager {
    orchestrator: Arc<Orchestrator>,
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
    idle_ttl: Duration,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &SessionConfig) -> Self {
        Self {
            orchestrator,
            sessions: RwLock::new(HashMap::new()),
            idle_ttl: config.idle_ttl(),
            max_sessions: config.max_sessions.max(1),
        }
    }

    pub fn create(&self) -> Result<SessionInfo, SessionError> {
        if self.len() >= self.max_sessions {
            self.evict_idle();
        }
        if self.len() >= self.max_sessions && !self.evict_least_recent() {
            tracing::warn!("Session limit of {} reached; every session is busy", self.max_sessions);
            return Err(SessionError::TooManySessions(self.max_sessions));
        }

        let session = Session::new(self.orchestrator.config().history_capacity);
        let info = SessionInfo {
            id: session.id(),
            created_at: session.created_at(),
        };
        let handle = Arc::new(SessionHandle {
            id: info.id,
            created_at: info.created_at,
            session: tokio::sync::Mutex::new(session),
            in_flight: parking_lot::Mutex::new(None),
            last_active: parking_lot::Mutex::new(Instant::now()),
        });
        self.sessions.write().insert(info.id, handle);
        tracing::info!("Created session {}", info.id);
        Ok(info)
    }

    pub fn get(&self, id: Uuid) -> Result<Arc<SessionHandle>, SessionError> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound(id))
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Run one turn. Waits for any earlier turn of the same session.
    ///
    /// Dropping the returned future abandons the turn like `cancel` does.
    pub async fn submit_turn(&self, id: Uuid, message: &str) -> Result<TurnResponse, SessionError> {
        let handle = self.get(id)?;
        handle.touch();
        let mut session = handle.session.lock().await;

        let token = CancellationToken::new();
        *handle.in_flight.lock() = Some(token.clone());
        let _clear = InFlightGuard(&handle);

        let response = self.orchestrator.handle_turn(&mut session, message, &token).await;
        handle.touch();
        Ok(response?)
    }

    pub fn cancel(&self, id: Uuid) -> Result<bool, SessionError> {
        let cancelled = self.get(id)?.cancel();
        if cancelled {
            tracing::info!("Cancelled in-flight turn of session {}", id);
        }
        Ok(cancelled)
    }

    pub async fn history(&self, id: Uuid) -> Result<SessionHistory, SessionError> {
        let handle = self.get(id)?;
        handle.touch();
        let session = handle.session.lock().await;
        Ok(SessionHistory {
            id,
            state: session.state().clone(),
            turns: session.context().turns().cloned().collect(),
        })
    }

    /// Drop a session, cancelling its running turn
    pub fn remove(&self, id: Uuid) -> Result<(), SessionError> {
        let handle = self.sessions.write().remove(&id).ok_or(SessionError::NotFound(id))?;
        handle.cancel();
        tracing::info!("Removed session {} (created {})", id, handle.created_at.to_rfc3339());
        Ok(())
    }

    /// A session is busy while a request holds its handle
    fn is_busy(handle: &Arc<SessionHandle>) -> bool {
        Arc::strong_count(handle) > 1 || handle.in_flight.lock().is_some()
    }

    /// Drop sessions idle for longer than the TTL. Returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, handle| Self::is_busy(handle) || handle.idle_for() < self.idle_ttl);
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::info!("Evicted {} idle sessions", evicted);
        }
        evicted
    }

    /// Make room by dropping the least recently used session that is not busy
    fn evict_least_recent(&self) -> bool {
        let mut sessions = self.sessions.write();
        let oldest = sessions
            .values()
            .filter(|handle| !Self::is_busy(handle))
            .max_by_key(|handle| handle.idle_for())
            .map(|handle| handle.id);
        match oldest {
            Some(id) => {
                sessions.remove(&id);
                tracing::info!("Evicted least recently used session {}", id);
                true
            }
            None => false,
        }
    }

    /// Sweep idle sessions on a fixed interval until `shutdown` fires
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Session sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.evict_idle();
                    }
                }
            }
        })
    }
}

/// Clears the in-flight token when the turn ends or is dropped
struct InFlightGuard<'a>(&'a SessionHandle);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *self.0.in_flight.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::services::intent_router::IntentRouter;
    use crate::services::llm_service::LlmService;
    use crate::services::query_service::QueryService;
    use crate::services::query_synthesizer::QuerySynthesizer;
    use crate::services::schema_catalog::SchemaCatalogService;
    use crate::test_support::{bookings_catalog, ExecutionMode, FakeAdapter, RecordingChat, ScriptedLlm};
    use crate::validation::SqlValidator;
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::assert_ok;

    async fn manager(adapter: FakeAdapter) -> (Arc<SessionManager>, Arc<ScriptedLlm>) {
        manager_with(adapter, SessionConfig::default()).await
    }

    async fn manager_with(adapter: FakeAdapter, sessions: SessionConfig) -> (Arc<SessionManager>, Arc<ScriptedLlm>) {
        let adapter = Arc::new(adapter.with_catalog(bookings_catalog()));
        let catalog = Arc::new(SchemaCatalogService::new(adapter.clone(), None, "bookings", 0));
        catalog.load().await.unwrap();

        let config = PipelineConfig::default();
        let llm = Arc::new(ScriptedLlm::new());
        let llm_service = LlmService::with_backoff(llm.clone(), Duration::from_millis(1));
        let orchestrator = Orchestrator::new(
            catalog,
            IntentRouter::new(llm_service.clone(), config.confidence_threshold, config.history_window),
            QuerySynthesizer::new(llm_service, &config),
            SqlValidator::default(),
            QueryService::new(adapter, config.row_cap),
            Arc::new(RecordingChat::new()),
            config,
        );
        (Arc::new(SessionManager::new(Arc::new(orchestrator), &sessions)), llm)
    }

    fn script_query(llm: &ScriptedLlm) {
        llm.push_text(json!({"intent": "run_query", "confidence": 0.9}).to_string());
        llm.push_text(
            json!({"candidates": [{"sql": "SELECT book_ref FROM bookings WHERE total_amount > 500", "confidence": 0.9}]})
                .to_string(),
        );
    }

    #[tokio::test]
    async fn test_turns_are_recorded_per_session() {
        let (manager, llm) = manager(FakeAdapter::new().with_rows(2)).await;
        let first = manager.create().unwrap();
        let second = manager.create().unwrap();
        assert_eq!(manager.len(), 2);

        llm.push_text(json!({"intent": "chat", "confidence": 0.9}).to_string());
        let response = assert_ok!(manager.submit_turn(first.id, "hi").await);
        assert_eq!(response.chat_text(), Some("chat: hi"));

        assert_eq!(manager.history(first.id).await.unwrap().turns.len(), 1);
        assert!(manager.history(second.id).await.unwrap().turns.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let (manager, _) = manager(FakeAdapter::new()).await;
        let id = Uuid::new_v4();
        assert_eq!(
            manager.submit_turn(id, "hi").await.unwrap_err(),
            SessionError::NotFound(id)
        );
        assert_eq!(manager.remove(id), Err(SessionError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_cancel_stops_running_turn() {
        let (manager, llm) = manager(FakeAdapter::new().with_mode(ExecutionMode::Hang)).await;
        script_query(&llm);
        let info = manager.create().unwrap();
        assert!(!manager.cancel(info.id).unwrap());

        let running = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.submit_turn(info.id, "bookings over 500").await })
        };

        let mut cancelled = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if manager.cancel(info.id).unwrap() {
                cancelled = true;
                break;
            }
        }
        assert!(cancelled);
        assert_eq!(running.await.unwrap(), Err(SessionError::Cancelled));

        let history = manager.history(info.id).await.unwrap();
        assert!(history.turns.is_empty());
        assert!(!manager.cancel(info.id).unwrap());
    }

    #[tokio::test]
    async fn test_turns_of_one_session_run_in_order() {
        let (manager, llm) = manager(FakeAdapter::new().with_rows(1)).await;
        for _ in 0..3 {
            script_query(&llm);
        }
        let info = manager.create().unwrap();

        let turns: Vec<_> = (0..3)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.submit_turn(info.id, "bookings over 500").await })
            })
            .collect();

        let mut indices = Vec::new();
        for turn in turns {
            indices.push(turn.await.unwrap().unwrap().turn_index);
        }
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(manager.history(info.id).await.unwrap().turns.len(), 3);
    }

    #[tokio::test]
    async fn test_idle_sessions_are_evicted() {
        let sessions = SessionConfig {
            idle_ttl_secs: 0,
            ..SessionConfig::default()
        };
        let (manager, _) = manager_with(FakeAdapter::new(), sessions).await;
        let info = manager.create().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.evict_idle(), 1);
        assert!(manager.is_empty());
        assert!(matches!(manager.get(info.id), Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_recent_sessions_survive_sweep() {
        let (manager, _) = manager(FakeAdapter::new()).await;
        let info = manager.create().unwrap();
        assert_eq!(manager.evict_idle(), 0);
        assert!(manager.get(info.id).is_ok());
    }

    #[tokio::test]
    async fn test_busy_session_is_not_evicted() {
        let sessions = SessionConfig {
            idle_ttl_secs: 0,
            ..SessionConfig::default()
        };
        let (manager, _) = manager_with(FakeAdapter::new(), sessions).await;
        let info = manager.create().unwrap();

        let held = manager.get(info.id).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.evict_idle(), 0);
        drop(held);
        assert_eq!(manager.evict_idle(), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent_session() {
        let sessions = SessionConfig {
            max_sessions: 2,
            ..SessionConfig::default()
        };
        let (manager, _) = manager_with(FakeAdapter::new(), sessions).await;
        let oldest = manager.create().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = manager.create().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let third = manager.create().unwrap();

        assert_eq!(manager.len(), 2);
        assert!(manager.get(oldest.id).is_err());
        assert!(manager.get(second.id).is_ok());
        assert!(manager.get(third.id).is_ok());
    }

    #[tokio::test]
    async fn test_capacity_full_of_busy_sessions() {
        let sessions = SessionConfig {
            max_sessions: 1,
            ..SessionConfig::default()
        };
        let (manager, _) = manager_with(FakeAdapter::new(), sessions).await;
        let info = manager.create().unwrap();
        let _held = manager.get(info.id).unwrap();

        assert_eq!(manager.create().unwrap_err(), SessionError::TooManySessions(1));
    }

    #[tokio::test]
    async fn test_sweeper_runs_until_shutdown() {
        let sessions = SessionConfig {
            idle_ttl_secs: 0,
            ..SessionConfig::default()
        };
        let (manager, _) = manager_with(FakeAdapter::new(), sessions).await;
        manager.create().unwrap();

        let shutdown = CancellationToken::new();
        let sweeper = manager.clone().spawn_sweeper(Duration::from_millis(10), shutdown.clone());
        for _ in 0..50 {
            if manager.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.is_empty());

        shutdown.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_drops_session() {
        let (manager, _) = manager(FakeAdapter::new()).await;
        let info = manager.create().unwrap();
        manager.remove(info.id).unwrap();
        assert!(manager.is_empty());
        assert!(matches!(manager.get(info.id), Err(SessionError::NotFound(_))));
    }
}
