//! TLS client for the tunnel.
//!
//! The wire fingerprint is a hand-rolled hello: before the real handshake
//! starts, the exact record built by [`profile::encode_client_hello`] is
//! written onto the stream, so the first ClientHello any observer captures
//! is the frozen profile. The server consumes that record and the
//! BoringSSL handshake runs behind it on the same connection.

use std::path::PathBuf;

use anyhow::Context;
use boring::ssl::{SslConnector, SslMethod, SslVerifyMode, SslVersion};
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio_boring::SslStream;

use crate::dialer::BoxIo;

use super::profile::{self, HelloInputs};

/// Server-certificate verification policy.
#[derive(Debug, Clone)]
pub enum Verify {
    /// Verify against an operator-supplied CA bundle.
    CaBundle(PathBuf),
    /// Verify against the OS trust store.
    SystemRoots,
    /// No verification at all.
    Disabled,
}

impl Verify {
    pub fn from_flags(ca_bundle: Option<PathBuf>, skip_verify: bool) -> Self {
        if skip_verify {
            Self::Disabled
        } else if let Some(path) = ca_bundle {
            Self::CaBundle(path)
        } else {
            Self::SystemRoots
        }
    }
}

/// A reusable tunnel TLS connector.
pub struct TlsClient {
    connector: SslConnector,
    skip_verify: bool,
}

impl TlsClient {
    pub fn new(verify: Verify) -> anyhow::Result<Self> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())
            .context("failed to create TLS connector")?;

        builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
        builder.set_alpn_protos(&alpn_wire())?;

        let skip_verify = matches!(verify, Verify::Disabled);
        match verify {
            Verify::CaBundle(path) => {
                builder
                    .set_ca_file(&path)
                    .with_context(|| format!("failed to load CA bundle {}", path.display()))?;
            }
            Verify::SystemRoots => {
                builder
                    .set_default_verify_paths()
                    .context("failed to load system trust store")?;
            }
            Verify::Disabled => {
                builder.set_verify(SslVerifyMode::NONE);
            }
        }

        Ok(Self {
            connector: builder.build(),
            skip_verify,
        })
    }

    /// Run the TLS handshake over an already-connected stream.
    ///
    /// The frozen-profile hello record goes out first; the server drops
    /// it and answers the handshake that follows. `server_name` is sent
    /// as SNI and checked against the certificate unless verification is
    /// disabled. On failure the stream is dropped.
    pub async fn handshake(
        &self,
        server_name: &str,
        mut stream: BoxIo,
    ) -> anyhow::Result<SslStream<BoxIo>> {
        // Per-connection hello fields; everything else in the record is
        // fixed by the profile.
        let mut random = [0u8; 32];
        let mut session_id = [0u8; 32];
        let mut key_share = [0u8; 32];
        {
            let mut rng = rand::thread_rng();
            rng.fill(&mut random[..]);
            rng.fill(&mut session_id[..]);
            rng.fill(&mut key_share[..]);
        }

        let hello = profile::encode_client_hello(&HelloInputs {
            server_name,
            random,
            session_id: &session_id,
            x25519_key_share: key_share,
        });
        stream
            .write_all(&hello)
            .await
            .context("failed to send hello record")?;
        stream.flush().await.context("failed to send hello record")?;

        let mut config = self.connector.configure()?;
        if self.skip_verify {
            config.set_verify(SslVerifyMode::NONE);
            config.set_verify_hostname(false);
        }

        tokio_boring::connect(config, server_name, stream)
            .await
            .map_err(|e| anyhow::anyhow!("TLS handshake with {server_name} failed: {e}"))
    }
}

/// ALPN protocols in wire format, from the frozen profile.
fn alpn_wire() -> Vec<u8> {
    let mut wire = Vec::new();
    for proto in profile::ALPN_PROTOCOLS {
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    wire
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_wire_format() {
        assert_eq!(alpn_wire(), b"\x02h2\x08http/1.1");
    }

    #[test]
    fn verify_policy_resolution() {
        assert!(matches!(Verify::from_flags(None, true), Verify::Disabled));
        assert!(matches!(
            Verify::from_flags(Some("ca.pem".into()), true),
            Verify::Disabled
        ));
        assert!(matches!(
            Verify::from_flags(Some("ca.pem".into()), false),
            Verify::CaBundle(_)
        ));
        assert!(matches!(Verify::from_flags(None, false), Verify::SystemRoots));
    }
}
