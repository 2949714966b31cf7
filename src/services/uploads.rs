use std::path::{Path, PathBuf};

use crate::db::tenant::{schema_name, TenantId};

/// Subdirectories every tenant upload tree carries.
pub const CLIENT_SUBDIRS: [&str; 5] = ["logos", "backgrounds", "link-images", "documents", "photos"];

/// Per-tenant upload tree rooted at the configured uploads directory:
/// `<root>/client_<id>/{logos,backgrounds,link-images,documents,photos}`.
#[derive(Debug, Clone)]
pub struct UploadDirs {
    root: PathBuf,
}

impl UploadDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn client_dir(&self, tenant: TenantId) -> PathBuf {
        self.root.join(schema_name(tenant))
    }

    /// Creates the tenant tree; existing directories are left untouched.
    pub async fn ensure_client_directories(&self, tenant: TenantId) -> std::io::Result<PathBuf> {
        let base = self.client_dir(tenant);
        for sub in CLIENT_SUBDIRS {
            tokio::fs::create_dir_all(base.join(sub)).await?;
        }
        tracing::debug!("Upload directories ready: {}", base.display());
        Ok(base)
    }

    /// Removes the tenant tree if present.
    pub async fn remove_client_directories(&self, tenant: TenantId) -> std::io::Result<()> {
        let base = self.client_dir(tenant);
        match tokio::fs::remove_dir_all(&base).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
