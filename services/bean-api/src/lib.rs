pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod import;
pub mod metrics;
pub mod models;

pub use config::Config;
pub use errors::{ApiError, Result};
