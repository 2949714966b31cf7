use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, Postgres};

use super::catalog::ScopedConnection;
use super::tenant::{Namespace, SearchPath};
use crate::error::TenancyResult;

/// A pooled connection pinned to one tenant's namespace.
///
/// The session exclusively owns its connection, so the search path set by
/// the router is the one every statement issued through it sees. Call
/// [`TenantSession::release`] when done: it puts the connection back on the
/// public search path before returning it to the pool.
pub struct TenantSession<Conn: ScopedConnection> {
    conn: Conn,
    namespace: Namespace,
    search_path: SearchPath,
}

impl<Conn: ScopedConnection> TenantSession<Conn> {
    pub(crate) fn new(conn: Conn, namespace: Namespace, search_path: SearchPath) -> Self {
        Self {
            conn,
            namespace,
            search_path,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// The path the router pinned on this session's connection.
    pub fn search_path(&self) -> &SearchPath {
        &self.search_path
    }

    pub fn connection(&mut self) -> &mut Conn {
        &mut self.conn
    }

    /// Asks the server for the connection's current `search_path`.
    pub async fn live_search_path(&mut self) -> TenancyResult<String> {
        self.conn.show_search_path().await
    }

    /// Resets the search path to `public` and hands the connection back.
    /// If the reset fails the connection is evicted instead of recycled.
    pub async fn release(mut self) -> TenancyResult<()> {
        let result = self.conn.set_search_path(&SearchPath::public()).await;
        if let Err(e) = &result {
            tracing::warn!(namespace = %self.namespace, "evicting connection, release failed: {e}");
            self.conn.mark_broken();
        }
        result
    }
}

impl TenantSession<PoolConnection<Postgres>> {
    /// Executor for `sqlx` queries scoped to this session's namespace.
    pub fn executor(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}
