//! HTTP boundary for the diagnostic classifier.
//!
//! `api_router()` returns a composable `Router` exposing `POST /predict`
//! and `GET /health`. The synchronous pipeline runs on the blocking pool;
//! the async layer only moves bytes and maps errors to status codes.

pub mod endpoints;
pub mod error;
pub mod router;
pub mod server;
pub mod types;

pub use error::ApiError;
pub use router::api_router;
pub use server::{serve, start_server_on, ServerHandle};
pub use types::ApiContext;
