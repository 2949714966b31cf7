use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use crate::{
    db::{
        provision::ProvisionReport,
        repair::{repair_client_schemas, repair_database_functions},
        tenant::TenantId,
    },
    error::TenancyError,
    middleware::tenant::{routing_rejection, TenantDb},
    models::auth::AuthenticatedUser,
    AppState,
};

fn require_admin(user: &AuthenticatedUser) -> Result<(), (StatusCode, Json<Value>)> {
    if user.is_admin() {
        Ok(())
    } else {
        Err((StatusCode::FORBIDDEN, Json(json!({ "error": "Admin role required" }))))
    }
}

/// Provisioning names its target explicitly, so an unknown id is a 404
/// rather than the 403 of request routing.
fn provisioning_rejection(err: TenancyError) -> (StatusCode, Json<Value>) {
    match err {
        TenancyError::UnknownTenant(_) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": "Tenant not found" })))
        }
        TenancyError::AdminTenant(_) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "Admin accounts have no client schema" })),
        ),
        other => routing_rejection(other),
    }
}

fn parse_tenant(raw: i64) -> Result<TenantId, (StatusCode, Json<Value>)> {
    TenantId::new(raw).map_err(|_| (StatusCode::BAD_REQUEST, Json(json!({ "error": "Invalid tenant id" }))))
}

fn report_json(report: &ProvisionReport) -> Value {
    json!({
        "tenant": report.tenant,
        "schema": report.schema,
        "outcome": format!("{:?}", report.outcome),
        "cloned_tables": report.cloned_tables,
        "created_tables": report.created_tables.iter().map(|t| t.name()).collect::<Vec<_>>(),
        "warnings": report.warnings.iter().map(|w| json!({
            "step": w.step.to_string(),
            "detail": w.detail,
        })).collect::<Vec<_>>(),
    })
}

// ─── Current routing ──────────────────────────────────────────────────────────

/// GET /tenant/schema: namespace and live search path of the caller's session.
pub async fn current_schema(mut db: TenantDb) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let live = db.live_search_path().await.map_err(routing_rejection)?;
    let body = json!({
        "namespace": db.namespace().name(),
        "search_path": live,
    });
    db.0.release().await.map_err(routing_rejection)?;
    Ok(Json(body))
}

// ─── Tenant provisioning (admin) ──────────────────────────────────────────────

pub async fn provision_tenant(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    require_admin(&user)?;
    let tenant = parse_tenant(id)?;

    let report = state
        .router
        .provisioner()
        .provision_client(tenant)
        .await
        .map_err(provisioning_rejection)?;

    Ok((StatusCode::CREATED, Json(report_json(&report))))
}

pub async fn drop_tenant(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    require_admin(&user)?;
    let tenant = parse_tenant(id)?;

    state
        .router
        .provisioner()
        .drop_client_schema(tenant)
        .await
        .map_err(routing_rejection)?;

    Ok(Json(json!({ "message": "Tenant schema dropped" })))
}

// ─── Repair (admin) ───────────────────────────────────────────────────────────

pub async fn repair(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    require_admin(&user)?;

    let provisioner = state.router.provisioner();
    let functions = repair_database_functions(provisioner.catalog().as_ref()).await;
    let schemas = repair_client_schemas(provisioner)
        .await
        .map_err(routing_rejection)?;

    Ok(Json(json!({
        "functions": {
            "success": functions.success,
            "confirmed": functions.confirmed,
            "missing": functions.missing,
            "failed_steps": functions.failed_steps,
        },
        "schemas": {
            "reconciled": schemas.reports.len(),
            "healed_tables": schemas.healed_tables(),
            "failures": schemas.failures.iter().map(|(t, e)| json!({ "tenant": t, "error": e })).collect::<Vec<_>>(),
        },
    })))
}
