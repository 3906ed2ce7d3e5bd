mod api;

pub use api::{BreakersResponse, HealthResponse, ReloadResponse};
