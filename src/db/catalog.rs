//! The pool-facing seam of the tenancy layer.
//!
//! Provisioning, routing and repair only talk to the database through
//! [`SchemaCatalog`] (pool-level catalog and DDL work) and
//! [`ScopedConnection`] (one exclusively held connection whose search path a
//! session pins). [`PgCatalog`] is the Postgres implementation.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Executor, PgPool, Postgres, Row};

use super::tables::EssentialTable;
use super::tenant::{quote_ident, SearchPath, TenantId, TenantRole};
use crate::error::TenancyResult;

/// A pooled connection whose search path can be pinned.
#[async_trait]
pub trait ScopedConnection: Send {
    async fn set_search_path(&mut self, path: &SearchPath) -> TenancyResult<()>;

    /// The connection's live `search_path` as reported by the server.
    async fn show_search_path(&mut self) -> TenancyResult<String>;

    /// Ask the pool to discard this connection instead of recycling it.
    fn mark_broken(&mut self);
}

/// Catalog lookups and DDL against the shared pool.
#[async_trait]
pub trait SchemaCatalog: Send + Sync + 'static {
    type Conn: ScopedConnection;

    /// Held while a namespace is created or reconciled.
    type Lock: Send;

    async fn acquire(&self) -> TenancyResult<Self::Conn>;

    /// Waits until the caller is the only provisioner of `schema`, across
    /// every process sharing the database.
    async fn lock_schema(&self, schema: &str) -> TenancyResult<Self::Lock>;

    async fn unlock_schema(&self, lock: Self::Lock) -> TenancyResult<()>;

    /// Role of a tenant from `public.users`, `None` when the id is unknown.
    async fn tenant_role(&self, tenant: TenantId) -> TenancyResult<Option<TenantRole>>;

    async fn schema_exists(&self, schema: &str) -> TenancyResult<bool>;

    async fn create_schema(&self, schema: &str) -> TenancyResult<()>;

    async fn drop_schema(&self, schema: &str) -> TenancyResult<()>;

    /// Grants usage and default privileges on `schema` to the running role.
    async fn grant_schema_privileges(&self, schema: &str) -> TenancyResult<()>;

    /// Copies sequences, tables and foreign keys of `template` into `target`.
    /// Returns the names of the tables cloned.
    async fn clone_schema(&self, template: &str, target: &str) -> TenancyResult<Vec<String>>;

    async fn table_exists(&self, schema: &str, table: &str) -> TenancyResult<bool>;

    async fn create_table(&self, schema: &str, table: EssentialTable) -> TenancyResult<()>;

    /// Names of every `client_*` namespace currently in the catalog.
    async fn client_schemas(&self) -> TenancyResult<Vec<String>>;

    async fn function_exists(&self, name: &str) -> TenancyResult<bool>;

    /// Runs a standalone administrative statement (function DDL and the like).
    async fn execute(&self, sql: &str) -> TenancyResult<()>;
}

/// Postgres-backed catalog over the process-wide pool.
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Session-level advisory lock on a namespace name, held on its own
/// connection. A lock dropped without [`SchemaCatalog::unlock_schema`] closes
/// that connection, which ends the session and releases the lock.
pub struct PgSchemaLock {
    conn: PoolConnection<Postgres>,
    schema: String,
    held: bool,
}

impl Drop for PgSchemaLock {
    fn drop(&mut self) {
        if self.held {
            self.conn.close_on_drop();
        }
    }
}

/// Points `REFERENCES template.x` in a constraint definition at `target`.
/// References into any other schema are left alone.
pub(crate) fn retarget_references(definition: &str, template: &str, target: &str) -> String {
    let to = format!("REFERENCES {}.", quote_ident(target));
    definition
        .replace(&format!("REFERENCES {}.", quote_ident(template)), &to)
        .replace(&format!("REFERENCES {template}."), &to)
}

#[async_trait]
impl ScopedConnection for PoolConnection<Postgres> {
    async fn set_search_path(&mut self, path: &SearchPath) -> TenancyResult<()> {
        let sql = path.to_sql();
        let result = Executor::execute(&mut **self, sqlx::raw_sql(&sql)).await;
        if let Err(e) = &result {
            if super::is_fatal(e) {
                super::note_fatal(e);
                self.close_on_drop();
            }
        }
        result?;
        Ok(())
    }

    async fn show_search_path(&mut self) -> TenancyResult<String> {
        let path: String = sqlx::query_scalar("SELECT current_setting('search_path')")
            .fetch_one(&mut **self)
            .await?;
        Ok(path)
    }

    fn mark_broken(&mut self) {
        self.close_on_drop();
    }
}

#[async_trait]
impl SchemaCatalog for PgCatalog {
    type Conn = PoolConnection<Postgres>;
    type Lock = PgSchemaLock;

    async fn acquire(&self) -> TenancyResult<Self::Conn> {
        let conn = self.pool.acquire().await.inspect_err(|e| {
            if super::is_fatal(e) {
                super::note_fatal(e);
            }
        })?;
        Ok(conn)
    }

    async fn lock_schema(&self, schema: &str) -> TenancyResult<PgSchemaLock> {
        let mut conn = self.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock(hashtext($1))")
            .bind(schema)
            .execute(&mut *conn)
            .await?;
        Ok(PgSchemaLock {
            conn,
            schema: schema.to_string(),
            held: true,
        })
    }

    async fn unlock_schema(&self, mut lock: PgSchemaLock) -> TenancyResult<()> {
        sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(lock.schema.as_str())
            .execute(&mut *lock.conn)
            .await?;
        lock.held = false;
        Ok(())
    }

    async fn tenant_role(&self, tenant: TenantId) -> TenancyResult<Option<TenantRole>> {
        // Always schema-qualified: the caller's search path is irrelevant here.
        let role: Option<String> =
            sqlx::query_scalar("SELECT role::TEXT FROM public.users WHERE id = $1")
                .bind(tenant.get())
                .fetch_optional(&self.pool)
                .await?;
        Ok(role.map(TenantRole::from))
    }

    async fn schema_exists(&self, schema: &str) -> TenancyResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)")
                .bind(schema)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn create_schema(&self, schema: &str) -> TenancyResult<()> {
        sqlx::raw_sql(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn drop_schema(&self, schema: &str) -> TenancyResult<()> {
        sqlx::raw_sql(&format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(schema)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn grant_schema_privileges(&self, schema: &str) -> TenancyResult<()> {
        let role: String = sqlx::query_scalar("SELECT current_user::TEXT")
            .fetch_one(&self.pool)
            .await?;
        let s = quote_ident(schema);
        let r = quote_ident(&role);
        sqlx::raw_sql(&format!(
            "GRANT USAGE, CREATE ON SCHEMA {s} TO {r};
             ALTER DEFAULT PRIVILEGES IN SCHEMA {s} GRANT ALL ON TABLES TO {r};
             ALTER DEFAULT PRIVILEGES IN SCHEMA {s} GRANT ALL ON SEQUENCES TO {r}"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clone_schema(&self, template: &str, target: &str) -> TenancyResult<Vec<String>> {
        let sequences: Vec<String> = sqlx::query_scalar(
            "SELECT sequence_name::TEXT FROM information_schema.sequences
             WHERE sequence_schema = $1 ORDER BY sequence_name",
        )
        .bind(template)
        .fetch_all(&self.pool)
        .await?;

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT c.relname::TEXT
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1 AND c.relkind = 'r'
             ORDER BY c.relname",
        )
        .bind(template)
        .fetch_all(&self.pool)
        .await?;

        // Serial defaults copied by LIKE still point at the template's
        // sequences; they are re-pointed at the clones below.
        let serial_columns = sqlx::query(
            "SELECT table_name::TEXT AS table_name, column_name::TEXT AS column_name,
                    column_default::TEXT AS column_default
             FROM information_schema.columns
             WHERE table_schema = $1 AND column_default LIKE 'nextval(%'",
        )
        .bind(template)
        .fetch_all(&self.pool)
        .await?;

        let src = quote_ident(template);
        let dst = quote_ident(target);
        let mut tx = self.pool.begin().await?;

        // Constraint definitions come back schema-qualified on this path.
        Executor::execute(&mut *tx, sqlx::raw_sql("SET LOCAL search_path TO pg_catalog")).await?;

        for seq in &sequences {
            let sql = format!("CREATE SEQUENCE IF NOT EXISTS {dst}.{}", quote_ident(seq));
            Executor::execute(&mut *tx, sqlx::raw_sql(&sql)).await?;
        }

        for table in &tables {
            let t = quote_ident(table);
            let sql = format!("CREATE TABLE IF NOT EXISTS {dst}.{t} (LIKE {src}.{t} INCLUDING ALL)");
            Executor::execute(&mut *tx, sqlx::raw_sql(&sql)).await?;
        }

        for row in &serial_columns {
            let table: String = row.get("table_name");
            let column: String = row.get("column_name");
            let default: String = row.get("column_default");
            let Some(seq) = sequences.iter().find(|s| {
                default.contains(&format!("'{s}'"))
                    || default.contains(&format!(".{s}'"))
                    || default.contains(&format!(".\"{s}\"'"))
            }) else {
                continue;
            };
            let sql = format!(
                "ALTER TABLE {dst}.{t} ALTER COLUMN {c} SET DEFAULT nextval('{dst}.{q}');
                 ALTER SEQUENCE {dst}.{q} OWNED BY {dst}.{t}.{c}",
                t = quote_ident(&table),
                c = quote_ident(&column),
                q = quote_ident(seq),
            );
            Executor::execute(&mut *tx, sqlx::raw_sql(&sql)).await?;
        }

        // LIKE never copies foreign keys; add them once every table exists.
        let foreign_keys = sqlx::query(
            "SELECT cl.relname::TEXT AS table_name, con.conname::TEXT AS constraint_name,
                    pg_get_constraintdef(con.oid) AS definition
             FROM pg_constraint con
             JOIN pg_class cl ON cl.oid = con.conrelid
             JOIN pg_namespace n ON n.oid = cl.relnamespace
             WHERE n.nspname = $1 AND con.contype = 'f'
             ORDER BY cl.relname, con.conname",
        )
        .bind(template)
        .fetch_all(&mut *tx)
        .await?;

        for row in &foreign_keys {
            let table: String = row.get("table_name");
            let name: String = row.get("constraint_name");
            let definition: String = row.get("definition");
            let sql = format!(
                "ALTER TABLE {dst}.{} ADD CONSTRAINT {} {}",
                quote_ident(&table),
                quote_ident(&name),
                retarget_references(&definition, template, target),
            );
            Executor::execute(&mut *tx, sqlx::raw_sql(&sql)).await?;
        }

        tx.commit().await?;
        Ok(tables)
    }

    async fn table_exists(&self, schema: &str, table: &str) -> TenancyResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (
               SELECT 1 FROM information_schema.tables
               WHERE table_schema = $1 AND table_name = $2
             )",
        )
        .bind(schema)
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn create_table(&self, schema: &str, table: EssentialTable) -> TenancyResult<()> {
        sqlx::raw_sql(&table.ddl(schema)).execute(&self.pool).await?;
        Ok(())
    }

    async fn client_schemas(&self) -> TenancyResult<Vec<String>> {
        let schemas: Vec<String> = sqlx::query_scalar(
            r"SELECT nspname::TEXT FROM pg_namespace
              WHERE nspname ~ '^client_[1-9][0-9]*$'
              ORDER BY length(nspname), nspname",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(schemas)
    }

    async fn function_exists(&self, name: &str) -> TenancyResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (
               SELECT 1 FROM pg_proc p
               JOIN pg_namespace n ON n.oid = p.pronamespace
               WHERE p.proname = $1 AND n.nspname = 'public'
             )",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn execute(&self, sql: &str) -> TenancyResult<()> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }
}
