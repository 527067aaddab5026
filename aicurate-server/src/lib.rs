//! HTTP surface of the AICurate mini app.
//!
//! The handlers are thin: each one parses the request, calls the matching
//! gateway from `aicurate-core` and maps its outcome to a status code and the
//! response body the mini app expects.

/// Command line and environment configuration.
pub mod cli;
/// Error bodies of the endpoints.
pub mod error;
/// Router and handlers.
pub mod routes;
/// State shared by the handlers.
pub mod state;

pub use routes::router;
pub use state::AppState;
