//! Service wiring: which catalog store and mailer the handlers talk to.

use std::sync::Arc;

use kpcyber_infra::config::{AppConfig, StorageBackend};
use kpcyber_infra::mailer::{LogMailer, Mailer};
use kpcyber_infra::store::{
    CatalogStore, InMemoryCatalogStore, PostgresCatalogStore, SqliteCatalogStore, StoreError,
};

/// Shared handler dependencies (cheap to clone).
#[derive(Clone)]
pub struct AppServices {
    pub catalog: Arc<dyn CatalogStore>,
    pub mailer: Arc<dyn Mailer>,
}

impl AppServices {
    pub fn new(catalog: Arc<dyn CatalogStore>, mailer: Arc<dyn Mailer>) -> Self {
        Self { catalog, mailer }
    }

    /// In-memory wiring (dev/test).
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryCatalogStore::new()),
            Arc::new(LogMailer::default()),
        )
    }
}

/// Connect the configured backend and make sure its schema exists.
pub async fn build_services(config: &AppConfig) -> Result<AppServices, StoreError> {
    let catalog: Arc<dyn CatalogStore> = match &config.storage {
        StorageBackend::Memory => {
            tracing::warn!("STORAGE_BACKEND=memory; catalog data is lost on restart");
            Arc::new(InMemoryCatalogStore::new())
        }
        StorageBackend::Sqlite { path } => Arc::new(SqliteCatalogStore::connect(path).await?),
        StorageBackend::Postgres { url } => Arc::new(PostgresCatalogStore::connect(url).await?),
    };

    catalog.init_schema().await?;
    tracing::info!(backend = config.storage.kind(), "catalog store ready");

    Ok(AppServices::new(
        catalog,
        Arc::new(LogMailer::new(config.contact_inbox.clone())),
    ))
}
