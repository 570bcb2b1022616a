//! Reverse SOCKS5 proxy over a fingerprint-shaped TLS + WebSocket tunnel.
//!
//! The host process listens on a public TLS port and exposes a local SOCKS5
//! port; the agent process dials back into the host and performs all egress
//! on its own network. A single outbound TCP connection carries every
//! proxied session, multiplexed with yamux on top of WebSocket frames.

pub mod agent;
pub mod config;
pub mod dialer;
pub mod keygen;
pub mod mux;
pub mod server;
pub mod spy;
pub mod tls;
pub mod ws;
