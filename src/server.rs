//! Host process: TLS listener, authenticated WebSocket endpoint, and the
//! local SOCKS5 port bridged onto tunnel streams.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::distributions::Alphanumeric;
use rand::Rng;
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info, warn};

use crate::config::{GlobalOpts, ServerArgs};
use crate::mux::{self, Mode, Session, TunnelStream};
use crate::tls;
use crate::ws::{self, WsByteStream};

/// Handshake phase (TLS accept + HTTP upgrade) deadline. After the
/// upgrade there is no idle timeout; liveness comes from keepalive pings.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Keepalive ping period on the tunnel WebSocket.
const PING_INTERVAL: Duration = Duration::from_secs(30);

struct HostState {
    password: String,
    socks_bind: IpAddr,
    socks_port: u16,
    /// Single-agent design: set while an AgentSession exists.
    agent_live: AtomicBool,
}

pub async fn run(args: ServerArgs, _global: GlobalOpts) -> anyhow::Result<()> {
    let password = if args.password.is_empty() {
        let generated = generate_password(64);
        info!("no password specified, generated password is {generated}");
        generated
    } else {
        args.password.clone()
    };

    let acceptor = tls::server::build_tls_acceptor(&args.tls_cert, &args.tls_key)?;

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to listen on {}", args.listen))?;
    info!(addr = %args.listen, "listening for agents using TLS");

    let state = Arc::new(HostState {
        password,
        socks_bind: args.socks_bind,
        socks_port: args.socks_port,
        agent_live: AtomicBool::new(false),
    });

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };
        let state = Arc::clone(&state);
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            handle_agent(state, acceptor, stream, peer).await;
        });
    }
}

/// One inbound TCP connection: TLS, authenticated upgrade, then the
/// SOCKS5 bridge loop for the lifetime of the agent session.
async fn handle_agent(
    state: Arc<HostState>,
    acceptor: tokio_rustls::TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
) {
    info!(peer = %peer, "new agent negotiation");
    let _ = stream.set_nodelay(true);

    // Agents lead with the fingerprint hello record; consume it before
    // handing the socket to rustls.
    let tls_stream = match timeout(HANDSHAKE_TIMEOUT, async {
        let mut stream = stream;
        tls::server::discard_fingerprint_hello(&mut stream).await?;
        acceptor.accept(stream).await
    })
    .await
    {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, "TLS handshake timed out");
            return;
        }
    };

    let claimed = AtomicBool::new(false);
    let callback = |request: &Request, response: Response| {
        if !authorized(request, &state.password) {
            debug!(peer = %peer, "invalid password");
            return Err(reject(StatusCode::FORBIDDEN));
        }
        // Single-agent: claim the slot before completing the upgrade.
        if state
            .agent_live
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(peer = %peer, "agent already connected, rejecting");
            return Err(reject(StatusCode::CONFLICT));
        }
        claimed.store(true, Ordering::SeqCst);
        Ok(response)
    };

    let upgrade = timeout(
        HANDSHAKE_TIMEOUT,
        tokio_tungstenite::accept_hdr_async_with_config(tls_stream, callback, Some(ws::ws_config())),
    )
    .await;

    let websocket = match upgrade {
        Ok(Ok(websocket)) => websocket,
        Ok(Err(e)) => {
            if claimed.load(Ordering::SeqCst) {
                state.agent_live.store(false, Ordering::SeqCst);
            }
            debug!(peer = %peer, error = %e, "websocket upgrade failed");
            return;
        }
        Err(_) => {
            if claimed.load(Ordering::SeqCst) {
                state.agent_live.store(false, Ordering::SeqCst);
            }
            warn!(peer = %peer, "websocket upgrade timed out");
            return;
        }
    };

    let _slot = SlotGuard(&state.agent_live);
    let started = std::time::Instant::now();
    info!(peer = %peer, "agent connected");

    let io = WsByteStream::new(websocket, Some(PING_INTERVAL));
    // Role inversion: the listener side opens streams.
    let (session, _incoming) = mux::attach(io, Mode::Client);

    if let Err(e) = listen_for_clients(&state, &session, peer).await {
        warn!(peer = %peer, error = %e, "SOCKS5 listener failed");
    }
    info!(peer = %peer, uptime_secs = started.elapsed().as_secs(), "agent session ended");
}

/// Clears the single-agent slot when the session scope exits.
struct SlotGuard<'a>(&'a AtomicBool);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Constant-time check of the `Authorization` header against the secret.
fn authorized(request: &Request, password: &str) -> bool {
    let Some(header) = request.headers().get("authorization") else {
        return false;
    };
    let presented = header.as_bytes();
    let expected = password.as_bytes();
    presented.len() == expected.len() && presented.ct_eq(expected).unwrap_u8() == 1
}

fn reject(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;
    response
}

/// Bind the local SOCKS5 listener, walking up from the configured port
/// until a bind succeeds.
pub async fn bind_socks_listener(
    bind: IpAddr,
    start_port: u16,
) -> anyhow::Result<(TcpListener, SocketAddr)> {
    let mut port = start_port;
    loop {
        let addr = SocketAddr::new(bind, port);
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok((listener, addr)),
            Err(e) => {
                warn!(addr = %addr, error = %e, "failed to bind, trying next port");
                port = port
                    .checked_add(1)
                    .ok_or_else(|| anyhow::anyhow!("no free SOCKS5 port above {start_port}"))?;
            }
        }
    }
}

/// Accept local SOCKS5 clients and bridge each onto its own tunnel
/// stream until the session goes away.
async fn listen_for_clients(
    state: &HostState,
    session: &Session,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let (listener, addr) = bind_socks_listener(state.socks_bind, state.socks_port).await?;
    info!(peer = %peer, addr = %addr, "waiting for SOCKS5 clients");

    loop {
        tokio::select! {
            _ = session.closed() => {
                info!(peer = %peer, "session closed, stopping SOCKS5 listener");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (local, client) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "failed to accept SOCKS5 client");
                        continue;
                    }
                };
                debug!(peer = %peer, client = %client, "got client, opening stream");
                match session.open_stream().await {
                    Ok(stream) => {
                        tokio::spawn(bridge(local, stream, peer, client));
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "failed to open stream");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Copy bytes both ways between a local client and its tunnel stream.
///
/// EOF in one direction shuts down the matching write half; the bridge
/// ends once both directions are drained.
async fn bridge(mut local: TcpStream, stream: TunnelStream, peer: SocketAddr, client: SocketAddr) {
    debug!(peer = %peer, client = %client, "forwarding connection");
    let mut remote = stream.compat();
    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok((to_agent, to_client)) => {
            debug!(peer = %peer, client = %client, to_agent, to_client, "done forwarding");
        }
        Err(e) => {
            debug!(peer = %peer, client = %client, error = %e, "forwarding ended with error");
        }
    }
}

/// Random alphanumeric password of the given length.
pub fn generate_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_password_is_alphanumeric() {
        let password = generate_password(64);
        assert_eq!(password.len(), 64);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn authorization_requires_exact_match() {
        let request = Request::builder()
            .uri("/")
            .header("Authorization", "secret")
            .body(())
            .unwrap();
        assert!(authorized(&request, "secret"));
        assert!(!authorized(&request, "secret2"));
        assert!(!authorized(&request, "Secret"));

        let missing = Request::builder().uri("/").body(()).unwrap();
        assert!(!authorized(&missing, "secret"));
    }

    #[tokio::test]
    async fn socks_port_auto_increments() {
        let bind: IpAddr = "127.0.0.1".parse().unwrap();
        // Occupy an ephemeral port, then ask the helper to start there.
        let occupied = TcpListener::bind((bind, 0)).await.unwrap();
        let start = occupied.local_addr().unwrap().port();

        let (_listener, addr) = bind_socks_listener(bind, start).await.unwrap();
        assert!(addr.port() > start);
        assert_eq!(addr.port(), start + 1);
    }
}
