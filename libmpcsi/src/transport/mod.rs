//! QUIC transport layer for CSI messages.
//!
//! The node agent talks to the plugin through [`NodeClient`]; the plugin
//! answers through [`CsiServer`].  Each request travels as one JSON encoded
//! [`CsiMessage`](crate::message::CsiMessage) on its own bi-directional
//! stream.

pub mod client;
pub mod server;

pub use client::{DEFAULT_REQUEST_TIMEOUT, NodeClient};
pub use server::CsiServer;
