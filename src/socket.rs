//! XMLSocket client component.
//!
//! This module provides the client side of the XMLSocket protocol: a plain
//! TCP connection carrying text messages, each terminated by a single null
//! byte.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐            TCP             ┌─────────────────────┐
//! │  XmlSocketClient │  ◄──────────────────────►  │   XMLSocket peer    │
//! │  writer task     │     "<msg/>\0<msg/>\0"     │                     │
//! │  receive loop    │                            │                     │
//! └──────────────────┘                            └─────────────────────┘
//! ```
//!
//! Sends are queued to a per-connection writer task so frames never
//! interleave. Incoming bytes are reassembled by a `FrameDecoder` owned by
//! the receive loop.
//!
//! # Usage
//!
//! ```ignore
//! use xmlsocket::socket::{Endpoint, XmlSocketClient};
//!
//! let client = XmlSocketClient::new();
//! let endpoint: Endpoint = "127.0.0.1:9000".parse()?;
//! client.connect(endpoint, || println!("connected"), |err| eprintln!("{err}"))?;
//! ```

mod client;
mod framing;

pub use client::{ConnectionState, Endpoint, EndpointParseError, XmlSocketClient, XmlSocketError};
pub use framing::{encode_frame, FrameDecoder, DELIMITER};
