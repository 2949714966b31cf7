//! In-memory [`SchemaCatalog`] used by unit tests.
//!
//! Connections carry their own search path like physical Postgres
//! connections do, and go back to a shared idle list on drop, so tests can
//! observe exactly what a recycled connection looks like.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::catalog::{SchemaCatalog, ScopedConnection};
use super::tables::EssentialTable;
use super::tenant::{SearchPath, TenantId, TenantRole, TEMPLATE_SCHEMA};
use crate::error::{TenancyError, TenancyResult};

#[derive(Default)]
struct State {
    users: HashMap<i32, String>,
    schemas: BTreeMap<String, BTreeSet<String>>,
    functions: BTreeSet<String>,
    rows: HashMap<(String, String), Vec<String>>,
    log: Vec<String>,
    failing: Vec<String>,
    idle: Vec<(u32, SearchPath)>,
    next_conn: u32,
}

impl State {
    /// Records `op` and fails it if a registered failure pattern matches.
    fn run(&mut self, op: String) -> TenancyResult<()> {
        let fails = self.failing.iter().any(|pat| op.contains(pat.as_str()));
        self.log.push(op.clone());
        if fails {
            return Err(TenancyError::Database(sqlx::Error::Decode(
                format!("injected failure: {op}").into(),
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<Mutex<State>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        let catalog = Self::default();
        {
            let mut s = catalog.lock();
            s.schemas.insert("public".into(), BTreeSet::from(["users".to_string()]));
            s.schemas.insert(
                TEMPLATE_SCHEMA.into(),
                BTreeSet::from(["properties".to_string(), "maintenance_requests".to_string()]),
            );
        }
        catalog
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn with_user(self, id: i32, role: &str) -> Self {
        self.lock().users.insert(id, role.to_string());
        self
    }

    /// Every operation whose log line contains `pattern` fails from now on.
    pub fn fail_on(&self, pattern: &str) {
        self.lock().failing.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    pub fn has_schema(&self, schema: &str) -> bool {
        self.lock().schemas.contains_key(schema)
    }

    pub fn tables(&self, schema: &str) -> BTreeSet<String> {
        self.lock().schemas.get(schema).cloned().unwrap_or_default()
    }

    pub fn drop_table(&self, schema: &str, table: &str) {
        let mut s = self.lock();
        if let Some(tables) = s.schemas.get_mut(schema) {
            tables.remove(table);
        }
        s.rows.remove(&(schema.to_string(), table.to_string()));
    }

    pub fn drop_function(&self, name: &str) {
        self.lock().functions.remove(name);
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.lock().functions.contains(name)
    }

    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Log entries that changed catalog state.
    pub fn writes(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|op| !op.starts_with("check ") && !op.starts_with("lookup ") && !op.starts_with("acquire"))
            .collect()
    }

    pub fn rows(&self, schema: &str, table: &str) -> Vec<String> {
        self.lock()
            .rows
            .get(&(schema.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

pub struct MemoryConn {
    id: u32,
    path: SearchPath,
    broken: bool,
    state: Arc<Mutex<State>>,
}

impl MemoryConn {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &SearchPath {
        &self.path
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn resolve(&self, s: &State, table: &str) -> Option<String> {
        self.path
            .schemas()
            .iter()
            .find(|schema| s.schemas.get(*schema).is_some_and(|t| t.contains(table)))
            .cloned()
    }

    /// Unqualified `INSERT INTO <table>` through the current search path.
    pub fn insert(&mut self, table: &str, value: &str) -> TenancyResult<String> {
        let mut s = self.state.lock().unwrap();
        let schema = self.resolve(&s, table).ok_or_else(|| {
            TenancyError::Database(sqlx::Error::Decode(format!("relation \"{table}\" does not exist").into()))
        })?;
        s.rows
            .entry((schema.clone(), table.to_string()))
            .or_default()
            .push(value.to_string());
        Ok(schema)
    }

    /// Unqualified `SELECT * FROM <table>` through the current search path.
    pub fn select(&self, table: &str) -> TenancyResult<Vec<String>> {
        let s = self.state.lock().unwrap();
        let schema = self.resolve(&s, table).ok_or_else(|| {
            TenancyError::Database(sqlx::Error::Decode(format!("relation \"{table}\" does not exist").into()))
        })?;
        Ok(s.rows.get(&(schema, table.to_string())).cloned().unwrap_or_default())
    }
}

impl Drop for MemoryConn {
    fn drop(&mut self) {
        if self.broken {
            return;
        }
        if let Ok(mut s) = self.state.lock() {
            s.idle.push((self.id, self.path.clone()));
        }
    }
}

#[async_trait]
impl ScopedConnection for MemoryConn {
    async fn set_search_path(&mut self, path: &SearchPath) -> TenancyResult<()> {
        self.state
            .lock()
            .unwrap()
            .run(format!("conn {} set_search_path {path}", self.id))?;
        self.path = path.clone();
        Ok(())
    }

    async fn show_search_path(&mut self) -> TenancyResult<String> {
        Ok(self.path.to_string())
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }
}

#[async_trait]
impl SchemaCatalog for MemoryCatalog {
    type Conn = MemoryConn;
    type Lock = String;

    async fn acquire(&self) -> TenancyResult<MemoryConn> {
        let mut s = self.lock();
        let (id, path) = match s.idle.pop() {
            Some(idle) => idle,
            None => {
                s.next_conn += 1;
                (s.next_conn, SearchPath::public())
            }
        };
        s.run(format!("acquire conn {id}"))?;
        Ok(MemoryConn {
            id,
            path,
            broken: false,
            state: Arc::clone(&self.state),
        })
    }

    async fn lock_schema(&self, schema: &str) -> TenancyResult<String> {
        self.lock().run(format!("lock schema {schema}"))?;
        Ok(schema.to_string())
    }

    async fn unlock_schema(&self, schema: String) -> TenancyResult<()> {
        self.lock().run(format!("unlock schema {schema}"))
    }

    async fn tenant_role(&self, tenant: TenantId) -> TenancyResult<Option<TenantRole>> {
        let mut s = self.lock();
        s.run(format!("lookup role {tenant}"))?;
        Ok(s.users.get(&tenant.get()).cloned().map(TenantRole::from))
    }

    async fn schema_exists(&self, schema: &str) -> TenancyResult<bool> {
        let mut s = self.lock();
        s.run(format!("check schema {schema}"))?;
        Ok(s.schemas.contains_key(schema))
    }

    async fn create_schema(&self, schema: &str) -> TenancyResult<()> {
        let mut s = self.lock();
        s.run(format!("create_schema {schema}"))?;
        s.schemas.entry(schema.to_string()).or_default();
        Ok(())
    }

    async fn drop_schema(&self, schema: &str) -> TenancyResult<()> {
        let mut s = self.lock();
        s.run(format!("drop_schema {schema}"))?;
        s.schemas.remove(schema);
        s.rows.retain(|(sch, _), _| sch != schema);
        Ok(())
    }

    async fn grant_schema_privileges(&self, schema: &str) -> TenancyResult<()> {
        self.lock().run(format!("grant {schema}"))
    }

    async fn clone_schema(&self, template: &str, target: &str) -> TenancyResult<Vec<String>> {
        let mut s = self.lock();
        s.run(format!("clone {template} -> {target}"))?;
        let tables = s.schemas.get(template).cloned().unwrap_or_default();
        s.schemas.entry(target.to_string()).or_default().extend(tables.iter().cloned());
        Ok(tables.into_iter().collect())
    }

    async fn table_exists(&self, schema: &str, table: &str) -> TenancyResult<bool> {
        let mut s = self.lock();
        s.run(format!("check table {schema}.{table}"))?;
        Ok(s.schemas.get(schema).is_some_and(|t| t.contains(table)))
    }

    async fn create_table(&self, schema: &str, table: EssentialTable) -> TenancyResult<()> {
        let mut s = self.lock();
        s.run(format!("create_table {schema}.{}", table.name()))?;
        s.schemas
            .entry(schema.to_string())
            .or_default()
            .insert(table.name().to_string());
        Ok(())
    }

    async fn client_schemas(&self) -> TenancyResult<Vec<String>> {
        let mut s = self.lock();
        s.run("lookup client schemas".to_string())?;
        Ok(s.schemas
            .keys()
            .filter(|name| name.starts_with("client_"))
            .cloned()
            .collect())
    }

    async fn function_exists(&self, name: &str) -> TenancyResult<bool> {
        let mut s = self.lock();
        s.run(format!("check function {name}"))?;
        Ok(s.functions.contains(name))
    }

    async fn execute(&self, sql: &str) -> TenancyResult<()> {
        let mut s = self.lock();
        let statement = sql.split_whitespace().collect::<Vec<_>>().join(" ");
        s.run(format!("execute {statement}"))?;

        if let Some(rest) = statement.strip_prefix("DROP FUNCTION IF EXISTS public.") {
            let name = rest.split('(').next().unwrap_or_default().to_string();
            s.functions.remove(&name);
        } else if let Some(rest) = statement.strip_prefix("CREATE OR REPLACE FUNCTION public.") {
            let name = rest.split('(').next().unwrap_or_default().to_string();
            s.functions.insert(name);
        }
        Ok(())
    }
}
