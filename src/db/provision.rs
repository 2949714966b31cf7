use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::catalog::SchemaCatalog;
use super::tables::{EssentialTable, ESSENTIAL_TABLES};
use super::tenant::{schema_name, TenantId, TEMPLATE_SCHEMA};
use crate::error::{TenancyError, TenancyResult};
use crate::services::{metrics, uploads::UploadDirs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The namespace did not exist and was created by this call.
    Created,
    /// The namespace already existed; only missing pieces were reconciled.
    AlreadyPresent,
}

/// Provisioning sub-step that may fail without aborting the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    Grant,
    CloneTemplate,
    Table(EssentialTable),
    Directories,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionStep::Grant => f.write_str("grant"),
            ProvisionStep::CloneTemplate => f.write_str("clone_template"),
            ProvisionStep::Table(t) => write!(f, "table:{}", t.name()),
            ProvisionStep::Directories => f.write_str("directories"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionWarning {
    pub step: ProvisionStep,
    pub detail: String,
}

/// What a provisioning run did, including every swallowed sub-step failure.
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub tenant: TenantId,
    pub schema: String,
    pub outcome: ProvisionOutcome,
    pub cloned_tables: Vec<String>,
    pub created_tables: Vec<EssentialTable>,
    pub warnings: Vec<ProvisionWarning>,
}

impl ProvisionReport {
    fn new(tenant: TenantId, outcome: ProvisionOutcome) -> Self {
        Self {
            tenant,
            schema: schema_name(tenant),
            outcome,
            cloned_tables: Vec::new(),
            created_tables: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub(crate) fn warn(&mut self, step: ProvisionStep, err: impl fmt::Display) {
        tracing::warn!(schema = %self.schema, %step, "provisioning step failed: {err}");
        metrics::PROVISION_WARNINGS
            .with_label_values(&[&step.to_string()])
            .inc();
        self.warnings.push(ProvisionWarning {
            step,
            detail: err.to_string(),
        });
    }

    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn has_warning(&self, step: ProvisionStep) -> bool {
        self.warnings.iter().any(|w| w.step == step)
    }
}

/// Creates and reconciles per-tenant namespaces and their upload trees.
pub struct SchemaProvisioner<C> {
    catalog: Arc<C>,
    uploads: UploadDirs,
    /// One gate per namespace, so tasks of this process queue here instead of
    /// each holding a pooled connection while waiting on the catalog lock.
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<C: SchemaCatalog> SchemaProvisioner<C> {
    pub fn new(catalog: Arc<C>, uploads: UploadDirs) -> Self {
        Self {
            catalog,
            uploads,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<C> {
        &self.catalog
    }

    pub fn uploads(&self) -> &UploadDirs {
        &self.uploads
    }

    /// Ensures `client_<id>` exists with every essential table and the
    /// tenant's upload tree.
    ///
    /// Only the catalog lookup and the schema creation itself can fail the
    /// call. Grants, template cloning, essential tables and directories are
    /// attempted independently and reported as warnings. On an already
    /// complete namespace the call performs lookups only. Anything that
    /// writes runs under the namespace's provisioning lock, and exactly one
    /// concurrent caller observes [`ProvisionOutcome::Created`].
    pub async fn create_client_schema(&self, tenant: TenantId) -> TenancyResult<ProvisionReport> {
        let schema = schema_name(tenant);

        let mut report = if self.is_reconciled(&schema).await? {
            ProvisionReport::new(tenant, ProvisionOutcome::AlreadyPresent)
        } else {
            self.reconcile_exclusive(tenant, &schema).await?
        };

        if let Err(e) = self.uploads.ensure_client_directories(tenant).await {
            report.warn(ProvisionStep::Directories, e);
        }

        match report.outcome {
            ProvisionOutcome::Created => tracing::info!(
                cloned = report.cloned_tables.len(),
                warnings = report.warnings.len(),
                "Provisioned tenant schema: {schema}"
            ),
            ProvisionOutcome::AlreadyPresent if !report.created_tables.is_empty() => tracing::info!(
                healed = ?report.created_tables.iter().map(|t| t.name()).collect::<Vec<_>>(),
                "Reconciled tenant schema: {schema}"
            ),
            ProvisionOutcome::AlreadyPresent => {}
        }

        Ok(report)
    }

    /// Provisions `tenant` only if it is a known, non-admin user.
    pub async fn provision_client(&self, tenant: TenantId) -> TenancyResult<ProvisionReport> {
        self.require_client(tenant).await?;
        self.create_client_schema(tenant).await
    }

    /// Fails unless `tenant` exists in `public.users` without the admin role.
    pub async fn require_client(&self, tenant: TenantId) -> TenancyResult<()> {
        match self.catalog.tenant_role(tenant).await? {
            None => Err(TenancyError::UnknownTenant(tenant)),
            Some(role) if role.is_admin() => Err(TenancyError::AdminTenant(tenant)),
            Some(_) => Ok(()),
        }
    }

    /// Lookups only. A failing table check counts as incomplete so that the
    /// locked pass reports it.
    async fn is_reconciled(&self, schema: &str) -> TenancyResult<bool> {
        if !self.catalog.schema_exists(schema).await? {
            return Ok(false);
        }
        for table in ESSENTIAL_TABLES {
            if !matches!(self.catalog.table_exists(schema, table.name()).await, Ok(true)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Takes the in-process gate, then the catalog lock, for `schema`.
    async fn lock(&self, schema: &str) -> TenancyResult<(OwnedMutexGuard<()>, C::Lock)> {
        let gate = {
            let mut gates = self.gates.lock().await;
            Arc::clone(gates.entry(schema.to_string()).or_default())
        };
        let gate = gate.lock_owned().await;
        let lock = self.catalog.lock_schema(schema).await?;
        Ok((gate, lock))
    }

    async fn unlock(&self, schema: &str, (gate, lock): (OwnedMutexGuard<()>, C::Lock)) {
        if let Err(e) = self.catalog.unlock_schema(lock).await {
            tracing::warn!("Could not release provisioning lock for {schema}: {e}");
        }
        drop(gate);
    }

    async fn reconcile_exclusive(&self, tenant: TenantId, schema: &str) -> TenancyResult<ProvisionReport> {
        let held = self.lock(schema).await?;
        let result = self.reconcile(tenant, schema).await;
        self.unlock(schema, held).await;
        result
    }

    /// Existence is checked again here: another provisioner may have
    /// finished while this one waited for the lock.
    async fn reconcile(&self, tenant: TenantId, schema: &str) -> TenancyResult<ProvisionReport> {
        let mut report = if self.catalog.schema_exists(schema).await? {
            ProvisionReport::new(tenant, ProvisionOutcome::AlreadyPresent)
        } else {
            self.catalog
                .create_schema(schema)
                .await
                .map_err(|e| match e {
                    TenancyError::Database(source) => TenancyError::SchemaCreation {
                        schema: schema.to_string(),
                        source,
                    },
                    other => other,
                })?;
            metrics::SCHEMAS_PROVISIONED.inc();

            let mut report = ProvisionReport::new(tenant, ProvisionOutcome::Created);
            if let Err(e) = self.catalog.grant_schema_privileges(schema).await {
                report.warn(ProvisionStep::Grant, e);
            }
            match self.catalog.clone_schema(TEMPLATE_SCHEMA, schema).await {
                Ok(tables) => report.cloned_tables = tables,
                Err(e) => report.warn(ProvisionStep::CloneTemplate, e),
            }
            report
        };

        for table in ESSENTIAL_TABLES {
            match self.create_if_missing(schema, table).await {
                Ok(true) => report.created_tables.push(table),
                Ok(false) => {}
                Err(e) => report.warn(ProvisionStep::Table(table), e),
            }
        }

        Ok(report)
    }

    /// Creates `table` in `schema` when the catalog does not list it.
    /// Returns whether it had to be created. Creation happens under the
    /// namespace's provisioning lock.
    pub async fn ensure_table(&self, schema: &str, table: EssentialTable) -> TenancyResult<bool> {
        if self.catalog.table_exists(schema, table.name()).await? {
            return Ok(false);
        }
        let held = self.lock(schema).await?;
        let result = self.create_if_missing(schema, table).await;
        self.unlock(schema, held).await;
        result
    }

    /// Caller holds the provisioning lock.
    async fn create_if_missing(&self, schema: &str, table: EssentialTable) -> TenancyResult<bool> {
        if self.catalog.table_exists(schema, table.name()).await? {
            return Ok(false);
        }
        self.catalog.create_table(schema, table).await?;
        metrics::TABLES_HEALED.with_label_values(&[table.name()]).inc();
        Ok(true)
    }

    /// Drops the tenant namespace and everything in it, then its upload tree.
    /// A failing directory removal is logged; the namespace is already gone.
    pub async fn drop_client_schema(&self, tenant: TenantId) -> TenancyResult<()> {
        let schema = schema_name(tenant);
        self.catalog.drop_schema(&schema).await?;
        if let Err(e) = self.uploads.remove_client_directories(tenant).await {
            tracing::warn!("Could not delete upload directory for {schema}: {e}");
        }
        tracing::info!("Dropped tenant schema: {schema}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::MemoryCatalog;
    use crate::services::uploads::CLIENT_SUBDIRS;

    fn provisioner(catalog: &MemoryCatalog, root: &std::path::Path) -> SchemaProvisioner<MemoryCatalog> {
        SchemaProvisioner::new(Arc::new(catalog.clone()), UploadDirs::new(root))
    }

    fn id(n: i64) -> TenantId {
        TenantId::new(n).unwrap()
    }

    #[tokio::test]
    async fn new_tenant_gets_schema_tables_and_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::new();
        let p = provisioner(&catalog, tmp.path());

        let report = p.create_client_schema(id(42)).await.unwrap();

        assert_eq!(report.outcome, ProvisionOutcome::Created);
        assert_eq!(report.schema, "client_42");
        assert!(report.is_complete(), "{:?}", report.warnings);
        let tables = catalog.tables("client_42");
        for table in ESSENTIAL_TABLES {
            assert!(tables.contains(table.name()), "missing {}", table.name());
        }
        assert!(tables.contains("properties"));
        assert_eq!(report.cloned_tables, ["maintenance_requests", "properties"]);
        assert!(tmp.path().join("client_42/documents").is_dir());
        for sub in CLIENT_SUBDIRS {
            assert!(tmp.path().join("client_42").join(sub).is_dir());
        }
    }

    #[tokio::test]
    async fn creation_runs_in_order_before_table_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::new();
        provisioner(&catalog, tmp.path())
            .create_client_schema(id(3))
            .await
            .unwrap();

        let log = catalog.log();
        assert_eq!(
            &log[..6],
            [
                "check schema client_3",
                "lock schema client_3",
                "check schema client_3",
                "create_schema client_3",
                "grant client_3",
                "clone template -> client_3",
            ]
        );
        let unlocked = log.iter().position(|op| op == "unlock schema client_3").unwrap();
        let last_table = log
            .iter()
            .position(|op| op == "create_table client_3.form_field_options")
            .unwrap();
        assert!(last_table < unlocked);
    }

    #[tokio::test]
    async fn second_call_is_a_read_only_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::new();
        let p = provisioner(&catalog, tmp.path());

        p.create_client_schema(id(42)).await.unwrap();
        catalog.clear_log();
        let report = p.create_client_schema(id(42)).await.unwrap();

        assert_eq!(report.outcome, ProvisionOutcome::AlreadyPresent);
        assert!(report.created_tables.is_empty());
        assert!(report.is_complete());
        assert!(catalog.writes().is_empty(), "{:?}", catalog.writes());
    }

    #[tokio::test]
    async fn clone_failure_still_yields_essential_tables() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::new();
        catalog.fail_on("clone ");
        let report = provisioner(&catalog, tmp.path())
            .create_client_schema(id(8))
            .await
            .unwrap();

        assert_eq!(report.outcome, ProvisionOutcome::Created);
        assert!(report.has_warning(ProvisionStep::CloneTemplate));
        assert!(report.cloned_tables.is_empty());
        assert_eq!(report.created_tables, ESSENTIAL_TABLES);
        assert!(!catalog.tables("client_8").contains("properties"));
    }

    #[tokio::test]
    async fn one_failing_table_does_not_stop_the_others() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::new();
        catalog.fail_on("create_table client_9.form_responses");
        let report = provisioner(&catalog, tmp.path())
            .create_client_schema(id(9))
            .await
            .unwrap();

        assert_eq!(report.warnings.len(), 1);
        assert!(report.has_warning(ProvisionStep::Table(EssentialTable::FormResponses)));
        let tables = catalog.tables("client_9");
        assert!(!tables.contains("form_responses"));
        assert!(tables.contains("form_fields"));
        assert!(tables.contains("form_field_options"));
        assert!(tmp.path().join("client_9/photos").is_dir());
    }

    #[tokio::test]
    async fn schema_creation_failure_propagates_and_skips_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::new();
        catalog.fail_on("create_schema");
        let err = provisioner(&catalog, tmp.path())
            .create_client_schema(id(11))
            .await
            .unwrap_err();

        assert!(matches!(err, TenancyError::SchemaCreation { ref schema, .. } if schema == "client_11"));
        assert!(!catalog.has_schema("client_11"));
        assert!(!tmp.path().join("client_11").exists());
    }

    #[tokio::test]
    async fn missing_table_is_healed_without_touching_others() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::new();
        let p = provisioner(&catalog, tmp.path());
        p.create_client_schema(id(42)).await.unwrap();

        let mut conn = {
            use crate::db::catalog::{SchemaCatalog, ScopedConnection};
            let mut conn = catalog.acquire().await.unwrap();
            conn.set_search_path(&crate::db::tenant::SearchPath::scoped(
                crate::db::tenant::Namespace::Client(id(42)),
            ))
            .await
            .unwrap();
            conn
        };
        conn.insert("links", "home").unwrap();
        catalog.drop_table("client_42", "form_fields");

        let report = p.create_client_schema(id(42)).await.unwrap();

        assert_eq!(report.outcome, ProvisionOutcome::AlreadyPresent);
        assert_eq!(report.created_tables, [EssentialTable::FormFields]);
        assert!(catalog.tables("client_42").contains("form_fields"));
        assert_eq!(catalog.rows("client_42", "links"), ["home"]);
    }

    #[tokio::test]
    async fn directory_failure_is_a_warning() {
        let tmp = tempfile::tempdir().unwrap();
        let blocked = tmp.path().join("uploads");
        std::fs::write(&blocked, b"").unwrap();
        let catalog = MemoryCatalog::new();

        let report = provisioner(&catalog, &blocked)
            .create_client_schema(id(12))
            .await
            .unwrap();

        assert!(report.has_warning(ProvisionStep::Directories));
        assert!(catalog.has_schema("client_12"));
    }

    #[tokio::test]
    async fn drop_removes_schema_and_uploads() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::new();
        let p = provisioner(&catalog, tmp.path());
        p.create_client_schema(id(13)).await.unwrap();

        p.drop_client_schema(id(13)).await.unwrap();

        assert!(!catalog.has_schema("client_13"));
        assert!(!tmp.path().join("client_13").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_calls_create_the_schema_once() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::new();
        let p = Arc::new(provisioner(&catalog, tmp.path()));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let p = Arc::clone(&p);
            tasks.spawn(async move { p.create_client_schema(id(50)).await });
        }
        let mut created = 0;
        while let Some(joined) = tasks.join_next().await {
            let report = joined.unwrap().unwrap();
            assert!(report.is_complete(), "{:?}", report.warnings);
            if report.outcome == ProvisionOutcome::Created {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        let log = catalog.log();
        let count = |op: &str| log.iter().filter(|l| *l == op).count();
        assert_eq!(count("create_schema client_50"), 1);
        assert_eq!(count("clone template -> client_50"), 1);
        assert_eq!(count("create_table client_50.links"), 1);
        assert_eq!(count("lock schema client_50"), count("unlock schema client_50"));
    }

    #[tokio::test]
    async fn healing_takes_the_lock_but_a_complete_schema_does_not() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::new();
        let p = provisioner(&catalog, tmp.path());
        p.create_client_schema(id(21)).await.unwrap();

        catalog.clear_log();
        p.create_client_schema(id(21)).await.unwrap();
        assert!(!catalog.log().iter().any(|op| op.starts_with("lock schema")));

        catalog.drop_table("client_21", "links");
        catalog.clear_log();
        p.create_client_schema(id(21)).await.unwrap();
        assert!(catalog.log().contains(&"lock schema client_21".to_string()));
    }

    #[tokio::test]
    async fn failed_creation_still_releases_the_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::new();
        catalog.fail_on("create_schema");

        assert!(provisioner(&catalog, tmp.path())
            .create_client_schema(id(22))
            .await
            .is_err());
        assert!(catalog.log().contains(&"unlock schema client_22".to_string()));
    }

    #[tokio::test]
    async fn unknown_tenants_get_no_schema() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::new();

        let err = provisioner(&catalog, tmp.path())
            .provision_client(id(999))
            .await
            .unwrap_err();

        assert!(matches!(err, TenancyError::UnknownTenant(t) if t == id(999)));
        assert!(!catalog.has_schema("client_999"));
        assert!(!tmp.path().join("client_999").exists());
    }

    #[tokio::test]
    async fn admins_get_no_client_schema() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::new().with_user(1, "admin");

        let err = provisioner(&catalog, tmp.path())
            .provision_client(id(1))
            .await
            .unwrap_err();

        assert!(matches!(err, TenancyError::AdminTenant(t) if t == id(1)));
        assert!(!catalog.has_schema("client_1"));
    }

    #[tokio::test]
    async fn known_clients_are_provisioned() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::new().with_user(30, "client");

        let report = provisioner(&catalog, tmp.path())
            .provision_client(id(30))
            .await
            .unwrap();

        assert_eq!(report.outcome, ProvisionOutcome::Created);
        assert!(catalog.has_schema("client_30"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ensure_table_creates_once() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::new();
        let p = Arc::new(provisioner(&catalog, tmp.path()));
        p.create_client_schema(id(60)).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let p = Arc::clone(&p);
            tasks.spawn(async move {
                p.ensure_table("client_60", EssentialTable::PropertyCoordinates).await
            });
        }
        let mut created = 0;
        while let Some(joined) = tasks.join_next().await {
            if joined.unwrap().unwrap() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        let creates = catalog
            .log()
            .iter()
            .filter(|op| *op == "create_table client_60.property_coordinates")
            .count();
        assert_eq!(creates, 1);
    }
}
