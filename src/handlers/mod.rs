mod admin;
mod health;
mod proxy;

pub use admin::{ADMIN_TOKEN_HEADER, list_breakers, reload_routes};
pub use health::{health_check, readiness_check};
pub use proxy::proxy;
