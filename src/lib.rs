//! Async WebSockets client and multi-service server for the Tokio stack.
//!
//! This library implements the [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455)
//! on top of a tokio TcpStream (optionally wrapped in TLS): it performs
//! handshakes, reads frames, parses masks, reassembles fragmented messages
//! and handles opcodes, including the permessage-deflate compression
//! extension.
//!
//! Clients call [`handshake::connect_async`] and get a connection that
//! streams inbound messages. Servers either accept a single socket with
//! [`handshake::accept_async`], or register behaviors under URL paths on a
//! [`server::WebSocketServer`], which multiplexes many sessions per service
//! with broadcast, broadping and lifecycle control.

mod compression;
pub mod config;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod frame;
pub mod handshake;
pub mod message;
mod read;
pub mod request;
pub mod server;
pub mod service;
pub mod session;
pub mod split;
pub mod stream;
mod utf8;
mod utils;
mod write;

#[cfg(test)]
mod tests;
