pub mod metrics;
pub mod route;
pub mod settings;
pub mod tracing_utils;
