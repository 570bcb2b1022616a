//! Server-side TLS: terminating config from operator-supplied PEM files,
//! plus the inbound half of the fingerprint-hello exchange.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_rustls::TlsAcceptor;

/// Sessions kept for resumption. A single agent reconnecting through its
/// cooldown is the only expected resumption client, so this stays small.
const RESUMPTION_CACHE_SESSIONS: usize = 8;

/// Largest leading hello record the server will swallow.
const MAX_HELLO_RECORD: usize = 16 * 1024;

/// Build a `TlsAcceptor` from PEM certificate and key files.
///
/// TLS 1.2 and 1.3 only (the rustls defaults).
pub fn build_tls_acceptor(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("TLS certificate and key do not form a usable pair")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config.session_storage =
        rustls::server::ServerSessionMemoryCache::new(RESUMPTION_CACHE_SESSIONS);

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let pem =
        fs::read(path).with_context(|| format!("reading TLS certificate {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "{} holds no certificates", path.display());
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path).with_context(|| format!("reading TLS key {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .with_context(|| format!("parsing {}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("{} holds no private key", path.display()))
}

/// Hex-encoded SHA-256 of the first certificate in a PEM file (lowercase,
/// no separators).
pub fn cert_sha256_fingerprint(cert_path: &Path) -> anyhow::Result<String> {
    let cert = load_certs(cert_path)?.swap_remove(0);
    Ok(hex::encode(Sha256::digest(cert.as_ref())))
}

/// Read and drop the fingerprint hello an agent writes ahead of its real
/// handshake. Connections that do not lead with a ClientHello record are
/// refused.
pub async fn discard_fingerprint_hello<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    if header[0] != 0x16 || header[1..3] != [0x03, 0x01] {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "connection did not start with a handshake record",
        ));
    }
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if len == 0 || len > MAX_HELLO_RECORD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "implausible hello record length",
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    if body.first() != Some(&0x01) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "leading record is not a client hello",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::profile::{encode_client_hello, HelloInputs};

    #[tokio::test]
    async fn discards_exactly_one_profile_hello() {
        let hello = encode_client_hello(&HelloInputs {
            server_name: "localhost",
            random: [7u8; 32],
            session_id: &[9u8; 32],
            x25519_key_share: [1u8; 32],
        });
        let mut wire = hello.clone();
        wire.extend_from_slice(b"after");

        let mut cursor = wire.as_slice();
        discard_fingerprint_hello(&mut cursor).await.unwrap();
        assert_eq!(cursor, b"after");
    }

    #[tokio::test]
    async fn refuses_plaintext_probes() {
        let mut cursor: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(discard_fingerprint_hello(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn refuses_truncated_records() {
        let hello = encode_client_hello(&HelloInputs {
            server_name: "localhost",
            random: [0u8; 32],
            session_id: &[],
            x25519_key_share: [0u8; 32],
        });
        let mut cursor = &hello[..hello.len() / 2];
        assert!(discard_fingerprint_hello(&mut cursor).await.is_err());
    }
}
