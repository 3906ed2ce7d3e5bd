//! HTTP middleware applied in front of the gateway pipeline.
//!
//! ```text
//! Request → Trace → CORS → Request ID → Client deadline → handler
//!                              ↓               ↓
//!                       X-Request-Id     ClientDeadline ext
//! ```
//!
//! Client IP resolution is not a layer: the proxy handler calls
//! [`ip::resolve_client_ip`] with the TCP peer address so that forwarding
//! headers are honoured only from trusted proxies.

pub mod ip;
pub mod request_id;
pub mod timeout;

pub use ip::{TrustedHop, TrustedProxies, UNKNOWN_IP, resolve_client_ip};
pub use request_id::{REQUEST_ID_HEADER, RequestId, RequestIdExt, RequestIdLayer};
pub use timeout::{ClientDeadline, REQUEST_TIMEOUT_HEADER, extract_client_deadline};
