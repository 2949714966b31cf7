pub mod metrics;
pub mod uploads;
