//! Axum HTTP API server.
//!
//! This crate provides:
//! - Task submission with up-front credit debit and cost estimates
//! - Task status, listing and deletion with refunds
//! - Credit balance lookup
//! - Health/readiness probes and Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod owner;
pub mod routes;
pub mod services;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use owner::{Owner, OWNER_HEADER};
pub use routes::create_router;
pub use services::{SubmissionService, TaskRequest};
pub use state::AppState;
