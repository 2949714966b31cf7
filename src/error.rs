use thiserror::Error;

use crate::db::tenant::TenantId;

/// Errors surfaced by the tenant routing and provisioning layer.
#[derive(Debug, Error)]
pub enum TenancyError {
    #[error("invalid tenant id: {0}")]
    InvalidTenantId(String),

    #[error("unknown tenant: {0}")]
    UnknownTenant(TenantId),

    #[error("tenant {0} is an admin and has no client schema")]
    AdminTenant(TenantId),

    /// Creating the namespace itself failed; nothing was provisioned.
    #[error("failed to create schema {schema}: {source}")]
    SchemaCreation {
        schema: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl TenancyError {
    /// True when the error means the serving connection itself is unusable.
    pub fn is_fatal(&self) -> bool {
        match self {
            TenancyError::Database(e) | TenancyError::SchemaCreation { source: e, .. } => {
                crate::db::is_fatal(e)
            }
            _ => false,
        }
    }
}

pub type TenancyResult<T> = Result<T, TenancyError>;
