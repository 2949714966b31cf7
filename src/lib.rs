// Library exports for binary tools and tests
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use sqlx::PgPool;

use config::Config;
use db::catalog::PgCatalog;
use db::provision::SchemaProvisioner;
use db::router::TenantRouter;
use services::uploads::UploadDirs;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub router: Arc<TenantRouter<PgCatalog>>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Arc<Config>) -> Self {
        let router = TenantRouter::new(SchemaProvisioner::new(
            Arc::new(PgCatalog::new(pool.clone())),
            UploadDirs::new(&config.uploads_dir),
        ));
        Self {
            db: pool,
            router: Arc::new(router),
            config,
        }
    }
}
