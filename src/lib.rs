//! XMLSocket client library.
//!
//! This library provides an asynchronous client for the XMLSocket protocol:
//!
//! - `socket` - connection lifecycle, message framing and reassembly
//! - `config` - client settings loaded from JSON
//!
//! # Example
//!
//! ```ignore
//! use xmlsocket::{ClientConfig, XmlSocketClient};
//!
//! let config = ClientConfig::load_or_default(&xmlsocket::default_config_path())?;
//! let client = XmlSocketClient::with_config(config);
//! client.connect("127.0.0.1:9000".parse::<xmlsocket::Endpoint>()?, on_connected, on_failed)?;
//! ```

pub mod config;
pub mod socket;

pub use config::{default_config_path, ClientConfig};
pub use socket::{
    encode_frame, ConnectionState, Endpoint, FrameDecoder, XmlSocketClient, XmlSocketError,
};
