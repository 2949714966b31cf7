//! Idempotent reconciliation of state that can drift outside the app:
//! the legacy provisioning procedures and the tables of existing tenants.

use super::catalog::SchemaCatalog;
use super::provision::{ProvisionReport, ProvisionStep, SchemaProvisioner};
use super::tables::EssentialTable;
use super::tenant::{Namespace, TenantId};
use crate::error::TenancyResult;

/// Stored procedures backing the legacy in-database provisioning path.
pub const ADMIN_FUNCTIONS: [AdminFunction; 2] =
    [AdminFunction::CreateClientSchema, AdminFunction::SetupUserEnvironment];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminFunction {
    CreateClientSchema,
    SetupUserEnvironment,
}

impl AdminFunction {
    pub fn name(&self) -> &'static str {
        match self {
            AdminFunction::CreateClientSchema => "create_client_schema",
            AdminFunction::SetupUserEnvironment => "setup_user_environment",
        }
    }

    fn drop_sql(&self) -> String {
        format!("DROP FUNCTION IF EXISTS public.{}(integer)", self.name())
    }

    fn create_sql(&self) -> &'static str {
        match self {
            AdminFunction::CreateClientSchema => {
                r#"CREATE OR REPLACE FUNCTION public.create_client_schema(p_user_id integer)
RETURNS text
LANGUAGE plpgsql
AS $fn$
DECLARE
    v_schema text;
    r record;
BEGIN
    IF p_user_id IS NULL OR p_user_id <= 0 THEN
        RAISE EXCEPTION 'invalid tenant id %', p_user_id;
    END IF;
    v_schema := 'client_' || p_user_id;
    IF EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = v_schema) THEN
        RETURN v_schema;
    END IF;
    EXECUTE format('CREATE SCHEMA %I', v_schema);
    EXECUTE format('GRANT USAGE, CREATE ON SCHEMA %I TO %I', v_schema, current_user);
    FOR r IN
        SELECT c.relname
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = 'template' AND c.relkind = 'r'
    LOOP
        EXECUTE format('CREATE TABLE IF NOT EXISTS %I.%I (LIKE template.%I INCLUDING ALL)',
                       v_schema, r.relname, r.relname);
    END LOOP;
    RETURN v_schema;
END;
$fn$"#
            }
            AdminFunction::SetupUserEnvironment => {
                r#"CREATE OR REPLACE FUNCTION public.setup_user_environment(p_user_id integer)
RETURNS text
LANGUAGE plpgsql
AS $fn$
DECLARE
    v_role text;
    v_schema text;
BEGIN
    SELECT role::text INTO v_role FROM public.users WHERE id = p_user_id;
    IF v_role IS NULL THEN
        PERFORM set_config('search_path', 'public', false);
        RAISE EXCEPTION 'unknown user %', p_user_id;
    END IF;
    IF v_role = 'admin' THEN
        PERFORM set_config('search_path', 'public, admin_views', false);
        RETURN 'public';
    END IF;
    v_schema := public.create_client_schema(p_user_id);
    PERFORM set_config('search_path', quote_ident(v_schema) || ', public', false);
    RETURN v_schema;
END;
$fn$"#
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FunctionRepairReport {
    /// Both procedures were confirmed present in the catalog afterwards.
    pub success: bool,
    pub confirmed: Vec<&'static str>,
    pub missing: Vec<&'static str>,
    pub failed_steps: Vec<String>,
}

/// Drops and recreates the administrative procedures, then checks the
/// catalog for both. Step failures are logged and recorded; the routine
/// itself never fails.
pub async fn repair_database_functions<C: SchemaCatalog>(catalog: &C) -> FunctionRepairReport {
    let mut report = FunctionRepairReport::default();

    for function in ADMIN_FUNCTIONS {
        let name = function.name();
        if let Err(e) = catalog.execute(&function.drop_sql()).await {
            tracing::warn!("Could not drop function {name}: {e}");
            report.failed_steps.push(format!("drop {name}: {e}"));
        }
        match catalog.execute(function.create_sql()).await {
            Ok(()) => tracing::info!("Recreated function {name}"),
            Err(e) => {
                tracing::warn!("Could not create function {name}: {e}");
                report.failed_steps.push(format!("create {name}: {e}"));
            }
        }
    }

    for function in ADMIN_FUNCTIONS {
        let name = function.name();
        match catalog.function_exists(name).await {
            Ok(true) => report.confirmed.push(name),
            Ok(false) => report.missing.push(name),
            Err(e) => {
                tracing::warn!("Could not verify function {name}: {e}");
                report.failed_steps.push(format!("verify {name}: {e}"));
                report.missing.push(name);
            }
        }
    }

    report.success = report.missing.is_empty();
    if report.success {
        tracing::info!("Database functions repaired");
    } else {
        tracing::warn!(
            "Database functions partially repaired: {}/{} present (missing: {})",
            report.confirmed.len(),
            ADMIN_FUNCTIONS.len(),
            report.missing.join(", ")
        );
    }
    report
}

#[derive(Debug, Default)]
pub struct SchemaRepairSummary {
    pub reports: Vec<ProvisionReport>,
    pub failures: Vec<(TenantId, String)>,
}

impl SchemaRepairSummary {
    pub fn healed_tables(&self) -> usize {
        self.reports.iter().map(|r| r.created_tables.len()).sum()
    }
}

/// Reconciles the essential tables and `property_coordinates` of one tenant.
pub async fn repair_client_schema<C: SchemaCatalog>(
    provisioner: &SchemaProvisioner<C>,
    tenant: TenantId,
) -> TenancyResult<ProvisionReport> {
    let mut report = provisioner.create_client_schema(tenant).await?;
    let coordinates = EssentialTable::PropertyCoordinates;
    match provisioner.ensure_table(&report.schema, coordinates).await {
        Ok(true) => report.created_tables.push(coordinates),
        Ok(false) => {}
        Err(e) => report.warn(ProvisionStep::Table(coordinates), e),
    }
    Ok(report)
}

/// Reconciles every existing `client_*` namespace. Only listing the
/// namespaces can fail the call; per-tenant failures land in the summary.
pub async fn repair_client_schemas<C: SchemaCatalog>(
    provisioner: &SchemaProvisioner<C>,
) -> TenancyResult<SchemaRepairSummary> {
    let mut summary = SchemaRepairSummary::default();

    for schema in provisioner.catalog().client_schemas().await? {
        let Some(Namespace::Client(tenant)) = Namespace::parse(&schema) else {
            tracing::warn!("Skipping unrecognised tenant schema: {schema}");
            continue;
        };
        match repair_client_schema(provisioner, tenant).await {
            Ok(report) => summary.reports.push(report),
            Err(e) => {
                tracing::error!("Could not repair {schema}: {e}");
                summary.failures.push((tenant, e.to_string()));
            }
        }
    }

    tracing::info!(
        tenants = summary.reports.len(),
        healed = summary.healed_tables(),
        failures = summary.failures.len(),
        "Tenant schemas reconciled"
    );
    Ok(summary)
}
