//! LAN Chat
//!
//! Chat and peer-to-peer file transfer for a local network. Clients talk to
//! a central server over a small framed protocol; after a public-key
//! handshake every message is encrypted under a per-client session key.
//!
//! ## Features
//! - Binary and JSON wire formats with identical semantics
//! - RSA session key exchange, AES-CBC message encryption
//! - Chat relay and live user list
//! - Block-by-block file transfer relayed through the server, SHA-256 verified
//!
//! ## Usage
//!
//! ```bash
//! # Start a server with two accounts
//! lanchat server --user alice:password1 --user bob:password2
//!
//! # Chat, saving offered files into ./downloads
//! lanchat chat --login bob --password password2 --download-dir ./downloads
//!
//! # Send a file to bob
//! lanchat send --login alice --password password1 --to bob report.pdf
//! ```

pub mod client;
pub mod connection;
pub mod crypto;
pub mod protocol;
pub mod server;
pub mod transfer;
pub mod validation;

pub use client::{Client, ClientConfig, ClientEvent, ClientHandle, ClientState, TransferRef};
pub use protocol::{Message, MessageCatalog, MessageCodec, Protocol};
pub use server::{ClientId, MemoryAccountStore, Server, ServerConfig};
pub use transfer::TransferState;
