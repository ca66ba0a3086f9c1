// src/rpc/mod.rs
//! Agent-to-agent RPC over TCP.
//!
//! The wire format is a 4-byte length prefix followed by a JSON-encoded
//! [`Request`] or [`Response`]. Calls are point-to-point: the caller opens a
//! connection, sends one request, reads one response and closes the
//! connection again.
//!
//! [`Request`]: message::Request
//! [`Response`]: message::Response

pub mod client;
pub mod codec;
pub mod message;
pub mod server;

pub use client::RpcClient;
pub use message::{Request, Response};
pub use server::Dispatcher;
