//! Deterministic doubles for the language model, the target database and
//! the chat collaborator.

use crate::models::{
    ColumnMeta, ColumnSchema, ConversationContext, ExecutionResult, ForeignKey, PipelineError, SchemaCatalog,
    TableSchema, ValidatedQuery, ValidationVerdict,
};
use crate::services::chat_service::ChatResponder;
use crate::services::database::{DatabaseAdapter, DatabaseError};
use crate::services::llm_service::{CompletionRequest, CompletionResponse, LlmClient};
use crate::validation::SqlValidator;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// bookings (wide), tickets (wide) and airports (small), tickets.book_ref -> bookings.book_ref
pub fn bookings_catalog() -> SchemaCatalog {
    let mut bookings = TableSchema::new(
        "bookings",
        vec![
            ColumnSchema::new("book_ref", "character", false).primary_key(),
            ColumnSchema::new("book_date", "timestamp with time zone", false),
            ColumnSchema::new("total_amount", "numeric", false),
        ],
    );
    bookings.row_count = Some(2_000_000);

    let mut tickets = TableSchema::new(
        "tickets",
        vec![
            ColumnSchema::new("ticket_no", "character", false).primary_key(),
            ColumnSchema::new("book_ref", "character", false),
            ColumnSchema::new("passenger_name", "text", false),
        ],
    );
    tickets.row_count = Some(3_000_000);

    let mut airports = TableSchema::new(
        "airports",
        vec![
            ColumnSchema::new("airport_code", "character", false).primary_key(),
            ColumnSchema::new("city", "text", false),
        ],
    );
    airports.row_count = Some(104);

    SchemaCatalog::new(
        "bookings",
        vec![bookings, tickets, airports],
        vec![ForeignKey {
            source_table: "tickets".into(),
            source_column: "book_ref".into(),
            target_table: "bookings".into(),
            target_column: "book_ref".into(),
            constraint_name: Some("tickets_book_ref_fkey".into()),
        }],
    )
}

/// Validate `sql` against `catalog`, panicking unless it is accepted
pub fn validated(sql: &str, catalog: &SchemaCatalog) -> ValidatedQuery {
    match SqlValidator::default().validate_sql(sql, catalog) {
        ValidationVerdict::Accept(query) => query,
        other => panic!("expected {} to validate, got {:?}", sql, other),
    }
}

enum Scripted {
    Text(String),
    Failure(String),
}

/// Language model that replays queued outputs in order and records every request
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.script.lock().push_back(Scripted::Text(text.into()));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.script.lock().push_back(Scripted::Failure(message.into()));
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait::async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, PipelineError> {
        self.requests.lock().push(request.clone());
        match self.script.lock().pop_front() {
            Some(Scripted::Text(text)) => Ok(CompletionResponse { text, usage: None }),
            Some(Scripted::Failure(message)) => Err(PipelineError::ModelUnavailable(message)),
            None => Err(PipelineError::ModelUnavailable("script exhausted".into())),
        }
    }

    fn provider(&self) -> &str {
        "scripted"
    }
}

/// How `FakeAdapter` answers queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    Normal,
    Hang,
    /// Hang on the first execution only
    HangOnce,
    EngineError(String),
    EngineErrorOnce(String),
    TransientOnce,
    TransientAlways,
    PoolExhausted,
}

/// In-memory database. Rows ignore the requested cap so the connector's own
/// enforcement is exercised.
pub struct FakeAdapter {
    catalog: Option<SchemaCatalog>,
    fail_catalog: AtomicBool,
    rows: usize,
    mode: ExecutionMode,
    executions: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self {
            catalog: None,
            fail_catalog: AtomicBool::new(false),
            rows: 0,
            mode: ExecutionMode::Normal,
            executions: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_catalog(mut self, catalog: SchemaCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Rows of (book_ref, total_amount), every amount above 500
    pub fn with_rows(mut self, rows: usize) -> Self {
        self.rows = rows;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn fail_catalog(&self, fail: bool) {
        self.fail_catalog.store(fail, Ordering::SeqCst);
    }

    pub fn execution_count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    fn result(&self) -> ExecutionResult {
        let rows = (0..self.rows)
            .map(|i| vec![json!(format!("B{:05}", i)), json!(510.0 + i as f64 * 10.0)])
            .collect();
        ExecutionResult::new(
            vec![
                ColumnMeta {
                    name: "book_ref".into(),
                    type_name: "bpchar".into(),
                },
                ColumnMeta {
                    name: "total_amount".into(),
                    type_name: "numeric".into(),
                },
            ],
            rows,
            1,
            false,
        )
    }
}

#[async_trait::async_trait]
impl DatabaseAdapter for FakeAdapter {
    async fn load_catalog(&self, _schema: &str, _sample_rows: usize) -> Result<SchemaCatalog, DatabaseError> {
        if self.fail_catalog.load(Ordering::SeqCst) {
            return Err(DatabaseError::Transient("connection refused".into()));
        }
        self.catalog
            .clone()
            .ok_or_else(|| DatabaseError::Other("no catalog configured".into()))
    }

    async fn execute_read_only(
        &self,
        query: &ValidatedQuery,
        _row_cap: usize,
        _timeout: Duration,
    ) -> Result<ExecutionResult, DatabaseError> {
        let first = self.executions.fetch_add(1, Ordering::SeqCst) == 0;
        self.executed.lock().push(query.sql().to_string());

        match &self.mode {
            ExecutionMode::Hang => std::future::pending().await,
            ExecutionMode::HangOnce if first => std::future::pending().await,
            ExecutionMode::EngineError(message) => Err(DatabaseError::Engine(message.clone())),
            ExecutionMode::EngineErrorOnce(message) if first => Err(DatabaseError::Engine(message.clone())),
            ExecutionMode::TransientOnce if first => Err(DatabaseError::Transient("broken pipe".into())),
            ExecutionMode::TransientAlways => Err(DatabaseError::Transient("broken pipe".into())),
            ExecutionMode::PoolExhausted => Err(DatabaseError::PoolTimeout("timed out after 2000 ms".into())),
            _ => Ok(self.result()),
        }
    }

    fn database_type(&self) -> &str {
        "fake"
    }

    async fn test_connection(&self) -> Result<(), DatabaseError> {
        if self.fail_catalog.load(Ordering::SeqCst) {
            return Err(DatabaseError::Transient("connection refused".into()));
        }
        Ok(())
    }
}

/// Chat collaborator echoing the question back
pub struct RecordingChat {
    questions: Mutex<Vec<String>>,
}

impl RecordingChat {
    pub fn new() -> Self {
        Self {
            questions: Mutex::new(Vec::new()),
        }
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().clone()
    }
}

#[async_trait::async_trait]
impl ChatResponder for RecordingChat {
    async fn respond(&self, question: &str, _context: &ConversationContext) -> Result<String, PipelineError> {
        self.questions.lock().push(question.to_string());
        Ok(format!("chat: {}", question))
    }
}
