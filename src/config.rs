use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// `production` requires SSL on database connections.
    pub app_env: String,
    pub jwt_secret: String,
    pub uploads_dir: String,
    pub host: String,
    pub port: u16,
    pub db_max_connections: u32,
    pub db_connect_timeout_secs: u64,
    pub db_statement_timeout_secs: u64,
    /// Reconcile every tenant schema before serving requests.
    pub repair_on_startup: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            app_env: app_env(),
            jwt_secret: required("JWT_SECRET")?,
            uploads_dir: uploads_dir(),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()?,
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".into())
                .parse()?,
            db_connect_timeout_secs: env::var("DB_CONNECT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".into())
                .parse()?,
            db_statement_timeout_secs: env::var("DB_STATEMENT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".into())
                .parse()?,
            repair_on_startup: env::var("REPAIR_ON_STARTUP")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        })
    }

    pub fn is_production(&self) -> bool {
        is_production_env(&self.app_env)
    }
}

/// `APP_ENV`, falling back to `NODE_ENV`, then `development`.
pub fn app_env() -> String {
    env::var("APP_ENV")
        .or_else(|_| env::var("NODE_ENV"))
        .unwrap_or_else(|_| "development".into())
}

/// `production` requires SSL on database connections.
pub fn is_production_env(app_env: &str) -> bool {
    app_env.eq_ignore_ascii_case("production")
}

pub fn uploads_dir() -> String {
    env::var("UPLOADS_DIR").unwrap_or_else(|_| "uploads".into())
}

pub fn required(key: &str) -> anyhow::Result<String> {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Missing required env var: {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(app_env: &str) -> Config {
        Config {
            database_url: "postgres://localhost/estate".into(),
            app_env: app_env.into(),
            jwt_secret: "secret".into(),
            uploads_dir: "uploads".into(),
            host: "127.0.0.1".into(),
            port: 8080,
            db_max_connections: 10,
            db_connect_timeout_secs: 10,
            db_statement_timeout_secs: 30,
            repair_on_startup: false,
        }
    }

    #[test]
    fn only_production_requires_ssl() {
        assert!(config("production").is_production());
        assert!(config("PRODUCTION").is_production());
        assert!(!config("development").is_production());
        assert!(!config("test").is_production());
    }

    #[test]
    fn environment_names_are_matched_case_insensitively() {
        assert!(is_production_env("Production"));
        assert!(!is_production_env("staging"));
        assert!(!is_production_env(""));
    }

    #[test]
    fn missing_required_var_is_an_error() {
        let err = required("ESTATE_TEST_SURELY_UNSET_VAR").unwrap_err();
        assert!(err.to_string().contains("ESTATE_TEST_SURELY_UNSET_VAR"));
    }

    #[test]
    fn pool_settings_follow_config() {
        let settings = crate::db::PoolSettings::from(&config("production"));
        assert!(settings.require_ssl);
        assert_eq!(settings.max_connections, 10);
        assert_eq!(settings.statement_timeout.as_secs(), 30);
    }
}
