//! HTTP front door: `/health`, `/mcp` and a service descriptor on `/`.

mod routes;
mod server;

pub use routes::{Endpoints, ServiceDescriptor, routes};
pub use server::{ServerConfig, serve};
