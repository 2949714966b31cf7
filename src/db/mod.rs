pub mod catalog;
pub mod provision;
pub mod repair;
pub mod router;
pub mod session;
pub mod tables;
pub mod tenant;

#[cfg(test)]
pub(crate) mod testing;

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

use crate::config::Config;
use crate::services::metrics;
use tenant::SearchPath;

/// Sizing and timeouts of the process-wide pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub statement_timeout: Duration,
    pub idle_timeout: Duration,
    pub require_ssl: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout: Duration::from_secs(10),
            statement_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            require_ssl: false,
        }
    }
}

impl From<&Config> for PoolSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_connections: config.db_max_connections,
            connect_timeout: Duration::from_secs(config.db_connect_timeout_secs),
            statement_timeout: Duration::from_secs(config.db_statement_timeout_secs),
            require_ssl: config.is_production(),
            ..Self::default()
        }
    }
}

impl PoolSettings {
    fn connect_options(&self, database_url: &str) -> anyhow::Result<PgConnectOptions> {
        let mut options = PgConnectOptions::from_str(database_url)?.options([(
            "statement_timeout",
            format!("{}ms", self.statement_timeout.as_millis()),
        )]);
        if self.require_ssl {
            options = options.ssl_mode(PgSslMode::Require);
        }
        Ok(options)
    }
}

pub async fn create_pool(database_url: &str, settings: &PoolSettings) -> anyhow::Result<PgPool> {
    let options = settings.connect_options(database_url)?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.connect_timeout)
        .idle_timeout(Some(settings.idle_timeout))
        // A connection never goes back to the pool still pinned to a tenant.
        .after_release(|conn, _meta| {
            Box::pin(async move {
                let sql = SearchPath::public().to_sql();
                match sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&sql)).await {
                    Ok(_) => Ok(true),
                    Err(e) => {
                        tracing::warn!("dropping pooled connection, search_path reset failed: {e}");
                        Ok(false)
                    }
                }
            })
        })
        .connect_with(options)
        .await?;

    tracing::info!(
        max_connections = settings.max_connections,
        statement_timeout_ms = settings.statement_timeout.as_millis() as u64,
        require_ssl = settings.require_ssl,
        "database pool ready"
    );
    Ok(pool)
}

/// Errors implying the underlying connection can no longer be trusted.
pub fn is_fatal(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // 08xxx connection exceptions, 57P0x operator intervention
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("08") || code.starts_with("57P")),
        _ => false,
    }
}

pub(crate) fn note_fatal(err: &sqlx::Error) {
    metrics::POOL_FATAL_ERRORS.inc();
    tracing::error!(fatal = true, "pool connection error: {err}");
}
