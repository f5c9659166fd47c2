//! Transport layer for the bridge.
//!
//! Currently provides the HTTP front door via axum.

pub mod http;

pub use http::{ServerConfig, serve};
