pub mod analysis;
pub mod config;
pub mod error;
pub mod extraction;
pub mod models;
pub mod prescription;
pub mod service;
pub mod store;

pub use config::Config;
pub use error::{Result, ServiceError};
pub use models::*;
pub use service::{AppState, build_router, create_app};
