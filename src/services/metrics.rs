use lazy_static::lazy_static;
use prometheus::{register_counter, register_counter_vec, Counter, CounterVec};

lazy_static! {
    // ── Provisioning ────────────────────────────────────────────────────────
    pub static ref SCHEMAS_PROVISIONED: Counter = register_counter!(
        "tenancy_schemas_provisioned_total",
        "Tenant namespaces created"
    ).unwrap();

    pub static ref TABLES_HEALED: CounterVec = register_counter_vec!(
        "tenancy_tables_healed_total",
        "Essential tables recreated in an existing or new namespace",
        &["table"]
    ).unwrap();

    pub static ref PROVISION_WARNINGS: CounterVec = register_counter_vec!(
        "tenancy_provision_warnings_total",
        "Provisioning sub-steps that failed and were skipped",
        &["step"]
    ).unwrap();

    // ── Routing ─────────────────────────────────────────────────────────────
    pub static ref ROUTED_SESSIONS: CounterVec = register_counter_vec!(
        "tenancy_routed_sessions_total",
        "Sessions handed out, by namespace kind",
        &["kind"]
    ).unwrap();

    pub static ref SEARCH_PATH_RESETS: Counter = register_counter!(
        "tenancy_search_path_resets_total",
        "Connections forced back to the public search path after a routing error"
    ).unwrap();

    pub static ref POOL_FATAL_ERRORS: Counter = register_counter!(
        "tenancy_pool_fatal_errors_total",
        "Pool errors that left a connection unusable"
    ).unwrap();
}
