use crate::models::{ExecutionResult, PipelineError, ValidatedQuery};
use crate::services::database::{DatabaseAdapter, DatabaseError};
use std::sync::Arc;
use std::time::Duration;

/// Execution connector: runs validated queries against the pooled database
/// under a hard deadline and row cap.
///
/// Accepts only `ValidatedQuery`, which the validator alone can construct.
#[derive(Clone)]
pub struct QueryService {
    adapter: Arc<dyn DatabaseAdapter>,
    row_cap: usize,
}

impl QueryService {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, row_cap: usize) -> Self {
        Self { adapter, row_cap }
    }

    /// Execute with `deadline` as the hard timeout.
    ///
    /// A transient connection fault is retried once; a pool wait timeout is not.
    /// Engine errors come back as `QueryRejectedByEngine` with the message verbatim.
    pub async fn execute(&self, query: &ValidatedQuery, deadline: Duration) -> Result<ExecutionResult, PipelineError> {
        let started = tokio::time::Instant::now();
        let hard_deadline = started + deadline;

        tracing::info!("Executing query: {}", query.sql());

        let mut retried = false;
        loop {
            let remaining = hard_deadline.saturating_duration_since(tokio::time::Instant::now());
            let outcome = tokio::time::timeout_at(
                hard_deadline,
                self.adapter.execute_read_only(query, self.row_cap, remaining),
            )
            .await;

            let result = match outcome {
                Err(_) => {
                    tracing::error!("Query exceeded deadline of {} ms", deadline.as_millis());
                    return Err(PipelineError::ExecutionTimeout(deadline.as_millis() as u64));
                }
                Ok(result) => result,
            };

            match result {
                Ok(result) => {
                    let result = result.enforce_row_cap(self.row_cap);
                    tracing::info!(
                        "Query returned {} rows in {} ms{}",
                        result.row_count,
                        result.execution_time_ms,
                        if result.truncated { " (truncated)" } else { "" }
                    );
                    return Ok(result);
                }
                Err(DatabaseError::Transient(msg)) if !retried => {
                    tracing::warn!("Transient connection fault, retrying once: {}", msg);
                    retried = true;
                }
                Err(e) => return Err(Self::map_error(e, deadline)),
            }
        }
    }

    fn map_error(error: DatabaseError, deadline: Duration) -> PipelineError {
        match error {
            DatabaseError::Engine(message) => {
                tracing::warn!("Query rejected by engine: {}", message);
                PipelineError::QueryRejectedByEngine(message)
            }
            DatabaseError::StatementTimeout(_) => {
                tracing::error!("Query cancelled by statement_timeout");
                PipelineError::ExecutionTimeout(deadline.as_millis() as u64)
            }
            DatabaseError::PoolTimeout(msg) | DatabaseError::Transient(msg) | DatabaseError::Other(msg) => {
                tracing::error!("Connection failure: {}", msg);
                PipelineError::ConnectionFailure(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bookings_catalog, validated, ExecutionMode, FakeAdapter};
    use tokio_test::{assert_err, assert_ok};

    fn service(adapter: Arc<FakeAdapter>, row_cap: usize) -> QueryService {
        QueryService::new(adapter, row_cap)
    }

    #[tokio::test]
    async fn test_rows_are_capped_and_flagged() {
        let adapter = Arc::new(FakeAdapter::new().with_rows(25));
        let connector = service(adapter, 10);
        let query = validated("SELECT book_ref FROM bookings", &bookings_catalog());

        let result = assert_ok!(connector.execute(&query, Duration::from_secs(5)).await);
        assert_eq!(result.row_count, 10);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_small_results_are_not_truncated() {
        let adapter = Arc::new(FakeAdapter::new().with_rows(3));
        let connector = service(adapter, 10);
        let query = validated("SELECT book_ref FROM bookings", &bookings_catalog());

        let result = connector.execute(&query, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.row_count, 3);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_slow_query_times_out() {
        let adapter = Arc::new(FakeAdapter::new().with_mode(ExecutionMode::Hang));
        let connector = service(adapter, 10);
        let query = validated("SELECT book_ref FROM bookings", &bookings_catalog());

        let result = connector.execute(&query, Duration::from_millis(50)).await;
        assert_eq!(result, Err(PipelineError::ExecutionTimeout(50)));
    }

    #[tokio::test]
    async fn test_engine_error_is_verbatim() {
        let adapter = Arc::new(
            FakeAdapter::new().with_mode(ExecutionMode::EngineError(
                "operator does not exist: character = integer".into(),
            )),
        );
        let connector = service(adapter, 10);
        let query = validated("SELECT book_ref FROM bookings", &bookings_catalog());

        let result = connector.execute(&query, Duration::from_secs(5)).await;
        assert_eq!(
            result,
            Err(PipelineError::QueryRejectedByEngine(
                "operator does not exist: character = integer".into()
            ))
        );
    }

    #[tokio::test]
    async fn test_transient_fault_is_retried_once() {
        let adapter = Arc::new(FakeAdapter::new().with_rows(2).with_mode(ExecutionMode::TransientOnce));
        let connector = service(adapter.clone(), 10);
        let query = validated("SELECT book_ref FROM bookings", &bookings_catalog());

        let result = connector.execute(&query, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.row_count, 2);
        assert_eq!(adapter.execution_count(), 2);
    }

    #[tokio::test]
    async fn test_persistent_transient_fault_is_connection_failure() {
        let adapter = Arc::new(FakeAdapter::new().with_mode(ExecutionMode::TransientAlways));
        let connector = service(adapter.clone(), 10);
        let query = validated("SELECT book_ref FROM bookings", &bookings_catalog());

        let result = connector.execute(&query, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(PipelineError::ConnectionFailure(_))));
        assert_eq!(adapter.execution_count(), 2);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_is_not_retried() {
        let adapter = Arc::new(FakeAdapter::new().with_mode(ExecutionMode::PoolExhausted));
        let connector = service(adapter.clone(), 10);
        let query = validated("SELECT book_ref FROM bookings", &bookings_catalog());

        let error = assert_err!(connector.execute(&query, Duration::from_secs(5)).await);
        assert!(matches!(error, PipelineError::ConnectionFailure(_)));
        assert_eq!(adapter.execution_count(), 1);
    }
}
