// HTTP surface: health and Prometheus metrics.

pub mod app;
pub mod routes;

pub use app::{build_app, AppState};
