/// Recreate the admin database functions and reconcile tenant schemas.
/// Safe to run repeatedly, e.g. after a restore or a failed deploy.
///
/// Usage: repair-db [--functions] [--schemas] [--tenant ID]
///   --functions  : Only recreate admin functions
///   --schemas    : Only reconcile client schemas
///   --tenant ID  : Reconcile a single tenant schema

use std::sync::Arc;

use clap::Parser;

use estate_tenancy::{
    config,
    db::{self, catalog::PgCatalog, provision::SchemaProvisioner, repair, tenant::TenantId, PoolSettings},
    services::uploads::UploadDirs,
};

#[derive(Parser)]
#[command(name = "repair-db", about = "Repair admin functions and tenant schemas")]
struct Args {
    /// Only recreate the admin functions
    #[arg(long)]
    functions: bool,

    /// Only reconcile client schemas
    #[arg(long)]
    schemas: bool,

    /// Tenant id to reconcile (all client schemas if not specified)
    #[arg(long)]
    tenant: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let run_all = !args.functions && !args.schemas && args.tenant.is_none();

    let database_url = config::required("DATABASE_URL")?;
    let settings = PoolSettings {
        max_connections: 2,
        require_ssl: config::is_production_env(&config::app_env()),
        ..PoolSettings::default()
    };
    let pool = db::create_pool(&database_url, &settings).await?;

    let provisioner = SchemaProvisioner::new(
        Arc::new(PgCatalog::new(pool)),
        UploadDirs::new(config::uploads_dir()),
    );

    let mut ok = true;

    if run_all || args.functions {
        let report = repair::repair_database_functions(provisioner.catalog().as_ref()).await;
        if report.success {
            tracing::info!("Admin functions confirmed: {}", report.confirmed.join(", "));
        } else {
            ok = false;
            tracing::error!(
                missing = ?report.missing,
                failed = ?report.failed_steps,
                "Admin function repair incomplete"
            );
        }
    }

    if let Some(raw) = args.tenant {
        let tenant = TenantId::new(raw)?;
        provisioner.require_client(tenant).await?;
        let report = repair::repair_client_schema(&provisioner, tenant).await?;
        ok &= report.is_complete();
        tracing::info!(
            "Reconciled {} ({} tables healed, {} warnings)",
            report.schema,
            report.created_tables.len(),
            report.warnings.len()
        );
    } else if run_all || args.schemas {
        let summary = repair::repair_client_schemas(&provisioner).await?;
        for (tenant, err) in &summary.failures {
            tracing::error!("Error repairing tenant {}: {}", tenant, err);
        }
        ok &= summary.failures.is_empty();
        tracing::info!(
            "Schema repair completed for {} tenants, {} tables healed",
            summary.reports.len(),
            summary.healed_tables()
        );
    }

    if !ok {
        anyhow::bail!("repair finished with errors");
    }
    Ok(())
}
