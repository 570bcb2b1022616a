//! TLS layers: the fingerprint-shaped client, the terminating server
//! config, and the frozen ClientHello profile they share.

pub mod client;
pub mod profile;
pub mod server;

pub use client::{TlsClient, Verify};
