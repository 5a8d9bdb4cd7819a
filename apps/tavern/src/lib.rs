pub mod backplane;
pub mod config;
pub mod metrics;
pub mod mux;
pub mod portal;
pub mod server;
pub mod store;
pub mod telemetry;
