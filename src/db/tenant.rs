use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TenancyError;

/// Shared namespace used by admins and anonymous requests.
pub const PUBLIC_SCHEMA: &str = "public";
/// Reference namespace whose structure is cloned into every new tenant.
pub const TEMPLATE_SCHEMA: &str = "template";
/// Admin-only auxiliary namespace appended to the admin search path.
pub const ADMIN_VIEWS_SCHEMA: &str = "admin_views";

const CLIENT_PREFIX: &str = "client_";

/// A validated tenant identifier (a row id in `public.users`).
///
/// Only positive integers are accepted, so a `TenantId` can be spliced into
/// a schema name without further escaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i32")]
pub struct TenantId(i32);

impl TenantId {
    pub fn new(raw: i64) -> Result<Self, TenancyError> {
        match i32::try_from(raw) {
            Ok(id) if id > 0 => Ok(Self(id)),
            _ => Err(TenancyError::InvalidTenantId(raw.to_string())),
        }
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl TryFrom<i64> for TenantId {
    type Error = TenancyError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<TenantId> for i32 {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

impl std::str::FromStr for TenantId {
    type Err = TenancyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: i64 = s
            .trim()
            .parse()
            .map_err(|_| TenancyError::InvalidTenantId(s.to_string()))?;
        Self::new(raw)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role column of `public.users`. Anything other than `admin` is isolated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantRole {
    Admin,
    Client(String),
}

impl TenantRole {
    pub fn is_admin(&self) -> bool {
        matches!(self, TenantRole::Admin)
    }
}

impl From<String> for TenantRole {
    fn from(role: String) -> Self {
        if role.eq_ignore_ascii_case("admin") {
            TenantRole::Admin
        } else {
            TenantRole::Client(role)
        }
    }
}

impl fmt::Display for TenantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantRole::Admin => write!(f, "admin"),
            TenantRole::Client(role) => write!(f, "{role}"),
        }
    }
}

/// The partition a request's unqualified table names resolve into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Public,
    Client(TenantId),
}

impl Namespace {
    pub fn for_role(tenant: TenantId, role: &TenantRole) -> Self {
        if role.is_admin() {
            Namespace::Public
        } else {
            Namespace::Client(tenant)
        }
    }

    pub fn name(&self) -> String {
        match self {
            Namespace::Public => PUBLIC_SCHEMA.to_string(),
            Namespace::Client(id) => schema_name(*id),
        }
    }

    /// Parses `public` or `client_<id>`; any other name is rejected.
    pub fn parse(name: &str) -> Option<Self> {
        if name == PUBLIC_SCHEMA {
            return Some(Namespace::Public);
        }
        let digits = name.strip_prefix(CLIENT_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) || digits.starts_with('0') {
            return None;
        }
        digits.parse().ok().map(Namespace::Client)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Returns the PostgreSQL schema name for a tenant id.
pub fn schema_name(tenant: TenantId) -> String {
    format!("{CLIENT_PREFIX}{tenant}")
}

/// Quotes an SQL identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Ordered list of namespaces consulted for unqualified table references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath(Vec<String>);

impl SearchPath {
    pub fn public() -> Self {
        Self(vec![PUBLIC_SCHEMA.to_string()])
    }

    /// `public, admin_views`
    pub fn admin() -> Self {
        Self(vec![PUBLIC_SCHEMA.to_string(), ADMIN_VIEWS_SCHEMA.to_string()])
    }

    /// `<namespace>, public`, collapsed to `public` for the public namespace.
    pub fn scoped(namespace: Namespace) -> Self {
        match namespace {
            Namespace::Public => Self::public(),
            Namespace::Client(_) => Self(vec![namespace.name(), PUBLIC_SCHEMA.to_string()]),
        }
    }

    pub fn schemas(&self) -> &[String] {
        &self.0
    }

    /// The namespace unqualified `CREATE TABLE` and `INSERT` land in.
    pub fn primary(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or(PUBLIC_SCHEMA)
    }

    pub fn is_public(&self) -> bool {
        self.0.len() == 1 && self.0[0] == PUBLIC_SCHEMA
    }

    pub fn to_sql(&self) -> String {
        let quoted: Vec<String> = self.0.iter().map(|s| quote_ident(s)).collect();
        format!("SET search_path TO {}", quoted.join(", "))
    }
}

impl fmt::Display for SearchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}
