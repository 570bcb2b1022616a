//! Agent process: dial the host through the proxy chain, bring the tunnel
//! up, and serve SOCKS5 egress on every multiplexed stream.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fast_socks5::server::{Config as SocksConfig, DenyAuthentication, Socks5Socket};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ClientArgs, GlobalOpts};
use crate::dialer::{self, BoxIo, DialOptions, ProxyHop};
use crate::mux::{self, Mode, TunnelStream};
use crate::spy::Spy;
use crate::tls::{TlsClient, Verify};
use crate::ws::{self, WsByteStream};

/// Keepalive ping period on the tunnel WebSocket.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How often to retry and how long to wait in between.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// A limit of N means N+1 connection attempts; 0 means retry forever.
    pub max_attempts: u32,
    pub delay: Duration,
}

struct AgentConfig {
    url: Url,
    hops: Vec<ProxyHop>,
    password: String,
    user_agent: String,
    dial_timeout: Duration,
    debug: bool,
}

pub async fn run(args: ClientArgs, global: GlobalOpts) -> anyhow::Result<()> {
    let url = Url::parse(&args.connect)
        .with_context(|| format!("invalid connect URL '{}'", args.connect))?;
    url.host_str()
        .ok_or_else(|| anyhow::anyhow!("connect URL '{url}' has no host"))?;

    let hops = args
        .proxies
        .iter()
        .map(|raw| ProxyHop::from_url(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let tls = TlsClient::new(Verify::from_flags(args.tls_cert.clone(), args.tls_skip_verify))?;

    let config = AgentConfig {
        url,
        hops,
        password: args.password,
        user_agent: args.user_agent,
        dial_timeout: Duration::from_millis(args.dial_timeout_ms),
        debug: global.debug,
    };
    let policy = ReconnectPolicy {
        max_attempts: args.reconnect_limit,
        delay: Duration::from_secs(args.reconnect_delay),
    };

    supervise(&policy, |attempt| {
        let config = &config;
        let tls = &tls;
        async move {
            debug!(attempt, "starting connection attempt");
            connect_and_run(config, tls).await
        }
    })
    .await;

    info!("reconnect limit reached, exiting");
    Ok(())
}

/// Reconnect supervisor: run attempts until the policy is exhausted.
///
/// The attempt counter is never reset by a successful session, so a
/// flapping link eventually runs out of retries.
pub async fn supervise<F, Fut>(policy: &ReconnectPolicy, mut attempt_fn: F)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut attempt: u32 = 0;
    loop {
        info!(
            attempt,
            limit = policy.max_attempts,
            "connecting to the server"
        );
        match attempt_fn(attempt).await {
            Ok(()) => info!("tunnel session ended"),
            Err(e) => warn!(error = %format_args!("{e:#}"), "connection attempt failed"),
        }

        attempt = attempt.saturating_add(1);
        if policy.max_attempts != 0 && attempt > policy.max_attempts {
            return;
        }

        info!(delay_secs = policy.delay.as_secs(), "sleeping before reconnect");
        tokio::time::sleep(policy.delay).await;
    }
}

/// One full session: dial, TLS, WebSocket, yamux (server role), then serve
/// SOCKS5 on every accepted stream until the session dies.
async fn connect_and_run(config: &AgentConfig, tls: &TlsClient) -> anyhow::Result<()> {
    let host = config
        .url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("connect URL has no host"))?;
    let port = config.url.port_or_known_default().unwrap_or(443);

    debug!(host, port, hops = config.hops.len(), "dialling");
    let opts = DialOptions {
        timeout: config.dial_timeout,
        user_agent: config.user_agent.clone(),
    };
    let mut stream: BoxIo = dialer::dial_chain(&config.hops, host, port, &opts).await?;
    if config.debug && config.hops.is_empty() {
        stream = Box::new(Spy::new(stream, "conn raw"));
    }

    info!("establishing TLS connection");
    let tls_stream = tls.handshake(host, stream).await?;
    let mut stream: BoxIo = Box::new(tls_stream);
    if config.debug {
        stream = Box::new(Spy::new(stream, "conn"));
    }

    info!("starting tunnel client");
    let websocket = ws::client_upgrade(stream, &config.url, &config.user_agent, &config.password)
        .await?;

    info!("starting tunnel session");
    let io = WsByteStream::new(websocket, Some(PING_INTERVAL));
    let (session, mut incoming) = mux::attach(io, Mode::Server);

    let socks_config: Arc<SocksConfig<DenyAuthentication>> = Arc::new(SocksConfig::default());

    info!("accepting connections to SOCKS5 server");
    while let Some(stream) = incoming.next().await {
        debug!("serving new SOCKS5 connection");
        let socks_config = Arc::clone(&socks_config);
        tokio::spawn(serve_socks(stream, socks_config));
    }

    drop(session);
    info!("tunnel session closed");
    Ok(())
}

/// Run the SOCKS5 responder on one tunnel stream.
///
/// Name resolution and egress happen here, on the agent's network. A
/// failed request answers with a SOCKS5 reply code and only ends this
/// stream, never the session.
async fn serve_socks(stream: TunnelStream, config: Arc<SocksConfig<DenyAuthentication>>) {
    let socket = Socks5Socket::new(stream.compat(), config);
    match socket.upgrade_to_socks5().await {
        Ok(_) => debug!("SOCKS5 connection finished"),
        Err(e) => debug!(error = %e, "SOCKS5 connection failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn supervisor_makes_limit_plus_one_attempts() {
        let attempts = AtomicU32::new(0);
        let policy = ReconnectPolicy {
            max_attempts: 2,
            delay: Duration::ZERO,
        };
        supervise(&policy, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("always refused")) }
        })
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn supervisor_counts_successful_sessions_against_the_limit() {
        let attempts = AtomicU32::new(0);
        let policy = ReconnectPolicy {
            max_attempts: 1,
            delay: Duration::ZERO,
        };
        supervise(&policy, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
