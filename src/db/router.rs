use super::catalog::{SchemaCatalog, ScopedConnection};
use super::provision::SchemaProvisioner;
use super::session::TenantSession;
use super::tables::EssentialTable;
use super::tenant::{Namespace, SearchPath, TenantId, TenantRole};
use crate::error::{TenancyError, TenancyResult};
use crate::services::metrics;

/// Pins connections to the namespace of the tenant a request belongs to.
///
/// Nothing is cached between calls: the role lookup and namespace checks run
/// again for every session, since a recycled connection may have served any
/// other tenant before.
pub struct TenantRouter<C> {
    provisioner: SchemaProvisioner<C>,
}

impl<C: SchemaCatalog> TenantRouter<C> {
    pub fn new(provisioner: SchemaProvisioner<C>) -> Self {
        Self { provisioner }
    }

    pub fn provisioner(&self) -> &SchemaProvisioner<C> {
        &self.provisioner
    }

    fn catalog(&self) -> &C {
        self.provisioner.catalog()
    }

    async fn resolve_role(&self, tenant: TenantId) -> TenancyResult<TenantRole> {
        self.catalog()
            .tenant_role(tenant)
            .await?
            .ok_or(TenancyError::UnknownTenant(tenant))
    }

    /// Points `conn` at the tenant's namespace and returns the namespace
    /// unqualified names now resolve into.
    ///
    /// Admins get `public, admin_views`. Everyone else gets
    /// `client_<id>, public`, with the namespace provisioned or repaired
    /// first and `property_coordinates` ensured. On any failure the
    /// connection is put back on `public` before the error is returned.
    pub async fn set_user_schema(&self, conn: &mut C::Conn, tenant: TenantId) -> TenancyResult<Namespace> {
        self.pin(conn, tenant).await.map(|(namespace, _)| namespace)
    }

    async fn pin(&self, conn: &mut C::Conn, tenant: TenantId) -> TenancyResult<(Namespace, SearchPath)> {
        match self.pin_unchecked(conn, tenant).await {
            Ok(pinned) => Ok(pinned),
            Err(e) => {
                tracing::error!(%tenant, "routing failed, resetting search_path to public: {e}");
                self.fail_safe(conn, &e).await;
                Err(e)
            }
        }
    }

    async fn pin_unchecked(&self, conn: &mut C::Conn, tenant: TenantId) -> TenancyResult<(Namespace, SearchPath)> {
        let role = self.resolve_role(tenant).await?;

        if role.is_admin() {
            let path = SearchPath::admin();
            conn.set_search_path(&path).await?;
            return Ok((Namespace::Public, path));
        }

        let namespace = Namespace::Client(tenant);
        self.provisioner.create_client_schema(tenant).await?;
        let path = SearchPath::scoped(namespace);
        conn.set_search_path(&path).await?;
        self.provisioner
            .ensure_table(&namespace.name(), EssentialTable::PropertyCoordinates)
            .await?;
        Ok((namespace, path))
    }

    async fn fail_safe(&self, conn: &mut C::Conn, err: &TenancyError) {
        metrics::SEARCH_PATH_RESETS.inc();
        if err.is_fatal() {
            conn.mark_broken();
            return;
        }
        if let Err(reset_err) = self.reset_to_public_schema(conn).await {
            tracing::error!("search_path reset failed, evicting connection: {reset_err}");
            conn.mark_broken();
        }
    }

    /// Unconditionally puts `conn` on the `public` search path.
    pub async fn reset_to_public_schema(&self, conn: &mut C::Conn) -> TenancyResult<()> {
        conn.set_search_path(&SearchPath::public()).await
    }

    /// Request entry point: a fresh connection pinned for `tenant`, or to
    /// `public` for anonymous access.
    pub async fn session(&self, tenant: Option<TenantId>) -> TenancyResult<TenantSession<C::Conn>> {
        let mut conn = self.catalog().acquire().await?;

        let Some(tenant) = tenant else {
            self.reset_to_public_schema(&mut conn).await?;
            metrics::ROUTED_SESSIONS.with_label_values(&["anonymous"]).inc();
            return Ok(TenantSession::new(conn, Namespace::Public, SearchPath::public()));
        };

        let (namespace, path) = self.pin(&mut conn, tenant).await?;
        let kind = match namespace {
            Namespace::Public => "admin",
            Namespace::Client(_) => "client",
        };
        metrics::ROUTED_SESSIONS.with_label_values(&[kind]).inc();
        Ok(TenantSession::new(conn, namespace, path))
    }

    /// The client-scoped query facade: a session pinned to
    /// `<namespace>, public`, where the namespace is `public` for admins.
    pub async fn client_db(&self, tenant: TenantId) -> TenancyResult<TenantSession<C::Conn>> {
        let role = self.resolve_role(tenant).await?;
        let namespace = Namespace::for_role(tenant, &role);
        if let Namespace::Client(_) = namespace {
            self.provisioner.create_client_schema(tenant).await?;
        }

        let mut conn = self.catalog().acquire().await?;
        let path = SearchPath::scoped(namespace);
        if let Err(e) = conn.set_search_path(&path).await {
            self.fail_safe(&mut conn, &e).await;
            return Err(e);
        }
        metrics::ROUTED_SESSIONS.with_label_values(&["facade"]).inc();
        Ok(TenantSession::new(conn, namespace, path))
    }
}
