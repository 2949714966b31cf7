use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json,
};
use serde_json::{json, Value};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;

use crate::{
    db::session::TenantSession,
    error::TenancyError,
    middleware::auth::{bearer_token, decode_access_token},
    AppState,
};

/// A pooled connection already routed for the caller.
///
/// Requests without an Authorization header are anonymous and land on
/// `public`; authenticated requests are pinned to their tenant's namespace.
/// Handlers run their tenant-scoped SQL through [`TenantDb::executor`] and
/// finish with [`TenantSession::release`].
pub struct TenantDb(pub TenantSession<PoolConnection<Postgres>>);

impl std::ops::Deref for TenantDb {
    type Target = TenantSession<PoolConnection<Postgres>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for TenantDb {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromRequestParts<AppState> for TenantDb {
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let tenant = match bearer_token(parts).map_err(|(status, msg)| (status, Json(json!({ "error": msg }))))? {
            None => None,
            Some(token) => {
                let user = decode_access_token(token, &state.config.jwt_secret).map_err(|_| {
                    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Invalid or expired token" })))
                })?;
                Some(user.user_id)
            }
        };

        state
            .router
            .session(tenant)
            .await
            .map(TenantDb)
            .map_err(routing_rejection)
    }
}

/// Maps routing failures to a response that never names a schema.
pub fn routing_rejection(err: TenancyError) -> (StatusCode, Json<Value>) {
    match err {
        TenancyError::UnknownTenant(_) | TenancyError::InvalidTenantId(_) | TenancyError::AdminTenant(_) => {
            (StatusCode::FORBIDDEN, Json(json!({ "error": "Unknown tenant" })))
        }
        other => {
            tracing::error!("tenant routing failed: {other}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "Database error" })))
        }
    }
}
