//! Wire layer between the bridge and its stdio child.
//!
//! # Architecture
//!
//! - **protocol**: JSON-RPC 2.0 message types and inbound classification
//! - **codec**: Newline-delimited JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
