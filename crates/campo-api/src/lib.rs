//! Sync endpoint for field devices: bearer-token tenancy, an atomic upload
//! merge, and a windowed snapshot download.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod store;

pub use config::AppConfig;
pub use routes::{app_router, AppState};
pub use store::ServerStore;
