use crate::models::{PipelineError, SchemaCatalog};
use crate::services::database::DatabaseAdapter;
use crate::storage::SqliteStorage;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Schema catalog service: loads metadata from the target database and
/// publishes it as an immutable snapshot.
///
/// Readers get an `Arc` to the current snapshot and never block on a
/// refresh. A failed refresh keeps the last good snapshot.
pub struct SchemaCatalogService {
    adapter: Arc<dyn DatabaseAdapter>,
    storage: Option<Arc<SqliteStorage>>,
    schema_name: String,
    sample_rows: usize,
    current: RwLock<Option<Arc<SchemaCatalog>>>,
    // Serializes loads so versions are published in order
    load_lock: tokio::sync::Mutex<()>,
}

impl SchemaCatalogService {
    pub fn new(
        adapter: Arc<dyn DatabaseAdapter>,
        storage: Option<Arc<SqliteStorage>>,
        schema_name: impl Into<String>,
        sample_rows: usize,
    ) -> Self {
        Self {
            adapter,
            storage,
            schema_name: schema_name.into(),
            sample_rows,
            current: RwLock::new(None),
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    /// Latest published snapshot
    pub fn current(&self) -> Result<Arc<SchemaCatalog>, PipelineError> {
        self.current.read().clone().ok_or_else(|| {
            PipelineError::CatalogUnavailable(format!(
                "No schema snapshot loaded for {}",
                self.schema_name
            ))
        })
    }

    /// Read metadata from the database and publish it as the new snapshot
    pub async fn load(&self) -> Result<Arc<SchemaCatalog>, PipelineError> {
        let _guard = self.load_lock.lock().await;

        let catalog = self
            .adapter
            .load_catalog(&self.schema_name, self.sample_rows)
            .await
            .map_err(|e| PipelineError::CatalogUnavailable(e.to_string()))?;

        if catalog.is_empty() {
            return Err(PipelineError::CatalogUnavailable(format!(
                "Schema {} has no tables",
                self.schema_name
            )));
        }

        let published = self.publish(catalog);

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_snapshot(&published).await {
                tracing::warn!("Failed to persist schema snapshot: {}", e);
            }
        }

        Ok(published)
    }

    /// Refresh the snapshot; on failure the previous one stays current
    pub async fn refresh(&self) -> Result<Arc<SchemaCatalog>, PipelineError> {
        match self.load().await {
            Ok(catalog) => {
                tracing::info!(
                    "Schema catalog refreshed to version {} ({} tables)",
                    catalog.version,
                    catalog.tables.len()
                );
                Ok(catalog)
            }
            Err(e) => {
                let kept = self.current.read().as_ref().map(|c| c.version);
                match kept {
                    Some(version) => tracing::warn!("Schema refresh failed, keeping version {}: {}", version, e),
                    None => tracing::warn!("Schema refresh failed and no snapshot is available: {}", e),
                }
                Err(e)
            }
        }
    }

    /// Startup load: live metadata first, the last persisted snapshot otherwise
    pub async fn warm_start(&self) -> Result<Arc<SchemaCatalog>, PipelineError> {
        let live_error = match self.load().await {
            Ok(catalog) => return Ok(catalog),
            Err(e) => e,
        };
        tracing::warn!("Live schema load failed: {}", live_error);

        let Some(storage) = &self.storage else {
            return Err(live_error);
        };

        match storage.load_latest_snapshot(&self.schema_name).await {
            Ok(Some(snapshot)) => {
                tracing::info!(
                    "Using persisted schema snapshot version {} from {}",
                    snapshot.version,
                    snapshot.retrieved_at.to_rfc3339()
                );
                Ok(self.publish(snapshot))
            }
            Ok(None) => Err(live_error),
            Err(e) => {
                tracing::error!("Failed to read persisted schema snapshot: {}", e);
                Err(live_error)
            }
        }
    }

    /// Swap in a new snapshot; its version is always above the previous one
    pub fn publish(&self, mut catalog: SchemaCatalog) -> Arc<SchemaCatalog> {
        let mut current = self.current.write();
        let previous = current.as_ref().map(|c| c.version).unwrap_or(0);
        catalog.version = catalog.version.max(previous + 1);
        let published = Arc::new(catalog);
        *current = Some(published.clone());
        published
    }

    /// Refresh on a fixed interval until `shutdown` fires
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; startup already loaded
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Schema refresh task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let _ = self.refresh().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bookings_catalog, FakeAdapter};

    #[tokio::test]
    async fn test_current_before_load_is_unavailable() {
        let service = SchemaCatalogService::new(Arc::new(FakeAdapter::new()), None, "bookings", 0);
        assert!(matches!(
            service.current(),
            Err(PipelineError::CatalogUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_load_publishes_increasing_versions() {
        let adapter = Arc::new(FakeAdapter::new().with_catalog(bookings_catalog()));
        let service = SchemaCatalogService::new(adapter, None, "bookings", 0);

        let first = service.load().await.unwrap();
        let second = service.load().await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(service.current().unwrap().version, 2);
        // Holders of the old snapshot still see it unchanged
        assert!(first.table("bookings").is_some());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_snapshot() {
        let adapter = Arc::new(FakeAdapter::new().with_catalog(bookings_catalog()));
        let service = SchemaCatalogService::new(adapter.clone(), None, "bookings", 0);
        service.load().await.unwrap();

        adapter.fail_catalog(true);
        let result = service.refresh().await;
        assert!(matches!(result, Err(PipelineError::CatalogUnavailable(_))));
        assert_eq!(service.current().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_warm_start_falls_back_to_persisted_snapshot() {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());

        let healthy = Arc::new(FakeAdapter::new().with_catalog(bookings_catalog()));
        let first = SchemaCatalogService::new(healthy, Some(storage.clone()), "bookings", 0);
        first.load().await.unwrap();

        let broken = Arc::new(FakeAdapter::new());
        broken.fail_catalog(true);
        let restarted = SchemaCatalogService::new(broken, Some(storage), "bookings", 0);
        let catalog = restarted.warm_start().await.unwrap();
        assert!(catalog.table("tickets").is_some());
        assert!(restarted.current().is_ok());
    }

    #[tokio::test]
    async fn test_warm_start_without_any_snapshot_fails() {
        let broken = Arc::new(FakeAdapter::new());
        broken.fail_catalog(true);
        let service = SchemaCatalogService::new(broken, None, "bookings", 0);
        assert!(matches!(
            service.warm_start().await,
            Err(PipelineError::CatalogUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_task_stops_on_shutdown() {
        let adapter = Arc::new(FakeAdapter::new().with_catalog(bookings_catalog()));
        let service = Arc::new(SchemaCatalogService::new(adapter, None, "bookings", 0));
        service.load().await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = service.clone().spawn_refresh(Duration::from_millis(10), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(service.current().unwrap().version > 1);
    }
}
