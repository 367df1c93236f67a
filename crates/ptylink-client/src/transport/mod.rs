//! Relay transport implementations.
//!
//! The service only sees [`ptylink_core::RelayTransport`]; this module holds
//! the concrete WebSocket relay client used by the CLI.

pub mod websocket;

pub use websocket::WsRelayTransport;
