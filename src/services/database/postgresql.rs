// PostgreSQL adapter using connection pooling for optimal resource management
use crate::models::{
    ColumnMeta, ColumnSchema, ExecutionResult, ForeignKey, SchemaCatalog, TableSchema, ValidatedQuery,
};
use crate::services::database::adapter::{DatabaseAdapter, DatabaseError};
use deadpool_postgres::{Pool, PoolError};
use futures::TryStreamExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_postgres::types::Type;
use tokio_postgres::{CancelToken, NoTls, Row};
use url::Url;

/// SQLSTATE raised when `statement_timeout` cancels a query
const QUERY_CANCELED: &str = "57014";

pub struct PostgreSQLAdapter {
    pool: Pool,
}

impl PostgreSQLAdapter {
    pub fn new(pool: Pool, connection_url: &str) -> Result<Self, DatabaseError> {
        // Validate PostgreSQL URL format
        let url = Url::parse(connection_url)
            .map_err(|e| DatabaseError::Other(format!("Invalid PostgreSQL URL: {}", e)))?;

        if url.scheme() != "postgresql" && url.scheme() != "postgres" {
            return Err(DatabaseError::Other(
                "URL must use postgresql:// or postgres:// scheme".to_string(),
            ));
        }

        Ok(Self { pool })
    }

    async fn get_client(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        self.pool.get().await.map_err(classify_pool_error)
    }
}

#[async_trait::async_trait]
impl DatabaseAdapter for PostgreSQLAdapter {
    async fn load_catalog(&self, schema: &str, sample_rows: usize) -> Result<SchemaCatalog, DatabaseError> {
        let mut client = self.get_client().await?;
        let transaction = client
            .build_transaction()
            .read_only(true)
            .start()
            .await
            .map_err(classify_pg_error)?;

        let mut tables = get_tables(&transaction, schema).await?;
        let mut columns = get_columns(&transaction, schema).await?;
        let primary_keys = get_primary_keys(&transaction, schema).await?;
        let foreign_keys = get_foreign_keys(&transaction, schema).await?;

        transaction.rollback().await.map_err(classify_pg_error)?;

        for table in tables.iter_mut() {
            let mut table_columns = columns.remove(&table.name).unwrap_or_default();
            if let Some(keys) = primary_keys.get(&table.name) {
                for column in table_columns.iter_mut() {
                    if keys.contains(&column.name) {
                        column.is_primary_key = true;
                    }
                }
            }
            table.columns = table_columns;

            // Sampled outside the transaction so one failing table does not abort the rest
            if sample_rows > 0 && !table.columns.is_empty() {
                table.sample_rows = get_sample_rows(&client, schema, &table.name, sample_rows).await;
            }
        }

        tracing::info!(
            "Loaded catalog for schema {}: {} tables, {} foreign keys",
            schema,
            tables.len(),
            foreign_keys.len()
        );

        Ok(SchemaCatalog::new(schema, tables, foreign_keys))
    }

    async fn execute_read_only(
        &self,
        query: &ValidatedQuery,
        row_cap: usize,
        timeout: Duration,
    ) -> Result<ExecutionResult, DatabaseError> {
        // Get a connection from the pool
        let mut client = self.get_client().await?;

        // Dropped before completion means the caller gave up; stop the statement on the server too
        let mut cancel_guard = CancelOnDrop::new(server_cancel(client.cancel_token()));
        let outcome = run_read_only(&mut client, query, row_cap, timeout).await;
        cancel_guard.disarm();
        outcome
    }

    fn database_type(&self) -> &str {
        "postgresql"
    }

    async fn test_connection(&self) -> Result<(), DatabaseError> {
        let client = self.get_client().await?;
        client.simple_query("SELECT 1").await.map_err(classify_pg_error)?;
        Ok(())
    }
}

async fn run_read_only(
    client: &mut deadpool_postgres::Object,
    query: &ValidatedQuery,
    row_cap: usize,
    timeout: Duration,
) -> Result<ExecutionResult, DatabaseError> {
    let start_time = Instant::now();

    let transaction = client
        .build_transaction()
        .read_only(true)
        .start()
        .await
        .map_err(classify_pg_error)?;
    transaction
        .batch_execute(&statement_timeout_sql(timeout))
        .await
        .map_err(classify_pg_error)?;

    let statement = transaction.prepare(query.sql()).await.map_err(classify_pg_error)?;
    let columns: Vec<ColumnMeta> = statement
        .columns()
        .iter()
        .map(|column| ColumnMeta {
            name: column.name().to_string(),
            type_name: column.type_().name().to_string(),
        })
        .collect();

    // One row past the cap tells us whether the result was truncated
    let fetch_limit = i32::try_from(row_cap.saturating_add(1)).unwrap_or(i32::MAX);
    let portal = transaction.bind(&statement, &[]).await.map_err(classify_pg_error)?;

    let mut rows = Vec::new();
    let mut truncated = false;
    {
        let stream = transaction
            .query_portal_raw(&portal, fetch_limit)
            .await
            .map_err(classify_pg_error)?;
        futures::pin_mut!(stream);
        while let Some(row) = stream.try_next().await.map_err(classify_pg_error)? {
            if rows.len() >= row_cap {
                truncated = true;
                break;
            }
            rows.push(decode_row(&row));
        }
    }

    transaction.rollback().await.map_err(classify_pg_error)?;

    let execution_time_ms = start_time.elapsed().as_millis() as u64;
    Ok(ExecutionResult::new(columns, rows, execution_time_ms, truncated))
}

/// Runs its action when dropped unless disarmed first
struct CancelOnDrop<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> CancelOnDrop<F> {
    fn new(action: F) -> Self {
        Self { action: Some(action) }
    }

    fn disarm(&mut self) {
        self.action = None;
    }
}

impl<F: FnOnce()> Drop for CancelOnDrop<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

/// Ask the server to cancel whatever the connection is running
fn server_cancel(token: CancelToken) -> impl FnOnce() {
    move || {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            match token.cancel_query(NoTls).await {
                Ok(()) => tracing::debug!("Cancelled abandoned statement"),
                Err(e) => tracing::warn!("Failed to cancel abandoned statement: {}", e),
            }
        });
    }
}

async fn get_tables(client: &tokio_postgres::Transaction<'_>, schema: &str) -> Result<Vec<TableSchema>, DatabaseError> {
    let rows = client
        .query(
            r#"
            SELECT
                c.relname,
                obj_description(c.oid, 'pg_class'),
                CASE WHEN c.relkind IN ('r', 'p', 'm') THEN c.reltuples::bigint ELSE NULL END
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1
                AND c.relkind IN ('r', 'p', 'v', 'm')
                AND NOT c.relispartition
            ORDER BY c.relname
            "#,
            &[&schema],
        )
        .await
        .map_err(|e| DatabaseError::Other(format!("Failed to get tables: {}", e)))?;

    Ok(rows
        .iter()
        .map(|row| {
            let mut table = TableSchema::new(row.get::<_, String>(0), Vec::new());
            table.description = row.get::<_, Option<String>>(1);
            // reltuples is -1 until the table has been analyzed
            table.row_count = row.get::<_, Option<i64>>(2).filter(|count| *count >= 0);
            table
        })
        .collect())
}

async fn get_columns(
    client: &tokio_postgres::Transaction<'_>,
    schema: &str,
) -> Result<HashMap<String, Vec<ColumnSchema>>, DatabaseError> {
    let rows = client
        .query(
            r#"
            SELECT
                c.table_name,
                c.column_name,
                c.data_type,
                c.is_nullable,
                col_description(format('%I.%I', c.table_schema, c.table_name)::regclass, c.ordinal_position::int)
            FROM information_schema.columns c
            WHERE c.table_schema = $1
            ORDER BY c.table_name, c.ordinal_position
            "#,
            &[&schema],
        )
        .await
        .map_err(|e| DatabaseError::Other(format!("Failed to get columns: {}", e)))?;

    let mut columns: HashMap<String, Vec<ColumnSchema>> = HashMap::new();
    for row in rows {
        let table_name: String = row.get(0);
        let mut column = ColumnSchema::new(
            row.get::<_, String>(1),
            row.get::<_, String>(2),
            row.get::<_, String>(3) == "YES",
        );
        column.description = row.get::<_, Option<String>>(4);
        columns.entry(table_name).or_default().push(column);
    }
    Ok(columns)
}

async fn get_primary_keys(
    client: &tokio_postgres::Transaction<'_>,
    schema: &str,
) -> Result<HashMap<String, Vec<String>>, DatabaseError> {
    let rows = client
        .query(
            r#"
            SELECT ku.table_name, ku.column_name
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage ku
                ON tc.constraint_name = ku.constraint_name
                AND tc.table_schema = ku.table_schema
            WHERE tc.constraint_type = 'PRIMARY KEY'
                AND tc.table_schema = $1
            "#,
            &[&schema],
        )
        .await
        .map_err(|e| DatabaseError::Other(format!("Failed to get primary keys: {}", e)))?;

    let mut keys: HashMap<String, Vec<String>> = HashMap::new();
    for row in rows {
        keys.entry(row.get(0)).or_default().push(row.get(1));
    }
    Ok(keys)
}

async fn get_foreign_keys(
    client: &tokio_postgres::Transaction<'_>,
    schema: &str,
) -> Result<Vec<ForeignKey>, DatabaseError> {
    let rows = client
        .query(
            r#"
            SELECT
                tc.constraint_name,
                kcu.table_name,
                kcu.column_name,
                ccu.table_name,
                ccu.column_name
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
                ON ccu.constraint_name = tc.constraint_name
                AND ccu.constraint_schema = tc.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
                AND tc.table_schema = $1
            ORDER BY kcu.table_name, kcu.column_name
            "#,
            &[&schema],
        )
        .await
        .map_err(|e| DatabaseError::Other(format!("Failed to get foreign keys: {}", e)))?;

    Ok(rows
        .iter()
        .map(|row| ForeignKey {
            constraint_name: row.get(0),
            source_table: row.get(1),
            source_column: row.get(2),
            target_table: row.get(3),
            target_column: row.get(4),
        })
        .collect())
}

async fn get_sample_rows(client: &tokio_postgres::Client, schema: &str, table: &str, limit: usize) -> Vec<Value> {
    let sql = format!(
        "SELECT * FROM {}.{} LIMIT {}",
        quote_ident(schema),
        quote_ident(table),
        limit
    );
    let rows = match client.query(sql.as_str(), &[]).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!("Failed to sample rows from {}.{}: {}", schema, table, e);
            return Vec::new();
        }
    };

    rows.iter()
        .map(|row| {
            let mut row_obj = serde_json::Map::new();
            for (idx, column) in row.columns().iter().enumerate() {
                row_obj.insert(column.name().to_string(), decode_value(row, idx));
            }
            Value::Object(row_obj)
        })
        .collect()
}

fn statement_timeout_sql(timeout: Duration) -> String {
    format!("SET LOCAL statement_timeout = {}", timeout.as_millis().max(1))
}

/// Quote an identifier for interpolation into catalog queries
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn classify_pool_error(e: PoolError) -> DatabaseError {
    match e {
        PoolError::Timeout(_) => DatabaseError::PoolTimeout(format!("Failed to get connection from pool: {}", e)),
        PoolError::Backend(inner) => classify_pg_error(inner),
        other => DatabaseError::Other(format!("Failed to get connection from pool: {}", other)),
    }
}

fn classify_pg_error(e: tokio_postgres::Error) -> DatabaseError {
    if let Some(db_error) = e.as_db_error() {
        if db_error.code().code() == QUERY_CANCELED {
            return DatabaseError::StatementTimeout(db_error.message().to_string());
        }
        return DatabaseError::Engine(db_error.message().to_string());
    }

    let io_fault = std::error::Error::source(&e)
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .is_some();
    if e.is_closed() || io_fault {
        DatabaseError::Transient(e.to_string())
    } else {
        DatabaseError::Other(e.to_string())
    }
}

fn decode_row(row: &Row) -> Vec<Value> {
    (0..row.columns().len()).map(|idx| decode_value(row, idx)).collect()
}

fn json_or_null<T: Into<Value>>(value: Result<Option<T>, tokio_postgres::Error>) -> Value {
    match value {
        Ok(Some(v)) => v.into(),
        _ => Value::Null,
    }
}

fn decode_value(row: &Row, idx: usize) -> Value {
    let column_type = row.columns()[idx].type_();
    match *column_type {
        Type::BOOL => json_or_null(row.try_get::<_, Option<bool>>(idx)),
        Type::INT2 => json_or_null(row.try_get::<_, Option<i16>>(idx)),
        Type::INT4 => json_or_null(row.try_get::<_, Option<i32>>(idx)),
        Type::INT8 => json_or_null(row.try_get::<_, Option<i64>>(idx)),
        Type::FLOAT4 => json_or_null(row.try_get::<_, Option<f32>>(idx)),
        Type::FLOAT8 => json_or_null(row.try_get::<_, Option<f64>>(idx)),
        Type::NUMERIC => match row.try_get::<_, Option<Decimal>>(idx) {
            Ok(Some(v)) => decimal_to_json(v),
            _ => Value::Null,
        },
        Type::TIMESTAMP => match row.try_get::<_, Option<chrono::NaiveDateTime>>(idx) {
            Ok(Some(v)) => json!(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            _ => Value::Null,
        },
        Type::TIMESTAMPTZ => match row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx) {
            Ok(Some(v)) => json!(v.to_rfc3339()),
            _ => Value::Null,
        },
        Type::DATE => match row.try_get::<_, Option<chrono::NaiveDate>>(idx) {
            Ok(Some(v)) => json!(v.to_string()),
            _ => Value::Null,
        },
        Type::TIME => match row.try_get::<_, Option<chrono::NaiveTime>>(idx) {
            Ok(Some(v)) => json!(v.to_string()),
            _ => Value::Null,
        },
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<Value>>(idx)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        Type::UUID => match row.try_get::<_, Option<uuid::Uuid>>(idx) {
            Ok(Some(v)) => json!(v.to_string()),
            _ => Value::Null,
        },
        _ => {
            // For all other types try to get as string representation
            match row.try_get::<_, Option<String>>(idx) {
                Ok(Some(v)) => json!(v),
                Ok(None) => Value::Null,
                Err(_) => json!(format!("<{}>", column_type.name())),
            }
        }
    }
}

fn decimal_to_json(value: Decimal) -> Value {
    value
        .to_f64()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| json!(value.to_string()))
}
