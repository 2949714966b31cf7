use std::sync::Arc;

use axum::{
    http::{header, Method},
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{AllowHeaders, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use estate_tenancy::{
    config::Config,
    db::{self, repair, PoolSettings},
    middleware::auth::JwtSecret,
    routes, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let config = Arc::new(config);

    let pool = db::create_pool(&config.database_url, &PoolSettings::from(config.as_ref())).await?;
    info!("Database connected");

    let state = AppState::new(pool, config.clone());

    if config.repair_on_startup {
        let provisioner = state.router.provisioner();
        let functions = repair::repair_database_functions(provisioner.catalog().as_ref()).await;
        let schemas = repair::repair_client_schemas(provisioner).await?;
        info!(
            functions_ok = functions.success,
            tenants = schemas.reports.len(),
            "Startup repair finished"
        );
    }

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(AllowHeaders::list([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT]))
        .allow_origin(Any);

    let jwt_secret = JwtSecret(config.jwt_secret.clone());

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics_handler))
        .route("/tenant/schema", get(routes::tenants::current_schema))
        // Admin
        .route("/admin/repair", post(routes::tenants::repair))
        .route("/admin/tenants/{id}/provision", post(routes::tenants::provision_tenant))
        .route("/admin/tenants/{id}", delete(routes::tenants::drop_tenant))
        .layer(axum::Extension(jwt_secret))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("tenancy API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
