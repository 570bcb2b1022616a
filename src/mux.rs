//! Stream multiplexing over the tunnel byte stream.
//!
//! Roles are deliberately inverted relative to the TCP direction: the
//! dialing agent runs the yamux *server* side and only accepts streams,
//! while the listening host runs the yamux *client* side and opens one
//! stream per local SOCKS5 connection. `attach` takes the role as a
//! parameter instead of inferring it from who dialed.

use std::collections::VecDeque;
use std::future;
use std::task::{Context, Poll};

use futures_util::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use yamux::ConnectionError;

pub use yamux::{Mode, Stream as TunnelStream};

type OpenReply = oneshot::Sender<Result<TunnelStream, ConnectionError>>;

/// Handle to a live multiplexed session. Cheap to clone; all clones talk
/// to the same driver task.
#[derive(Clone)]
pub struct Session {
    cmd_tx: mpsc::Sender<OpenReply>,
    closed_rx: watch::Receiver<bool>,
}

/// Inbound streams accepted from the peer.
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<TunnelStream>,
}

/// Layer a yamux session over `io` and spawn its driver task.
pub fn attach<I>(io: I, mode: Mode) -> (Session, Incoming)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection = yamux::Connection::new(io, yamux::Config::default(), mode);
    let (cmd_tx, cmd_rx) = mpsc::channel::<OpenReply>(16);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);

    tokio::spawn(drive(connection, cmd_rx, inbound_tx, closed_tx));

    (Session { cmd_tx, closed_rx }, Incoming { rx: inbound_rx })
}

impl Session {
    /// Open a new outbound stream on the session.
    pub async fn open_stream(&self) -> Result<TunnelStream, ConnectionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(reply_tx)
            .await
            .map_err(|_| ConnectionError::Closed)?;
        reply_rx.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Resolve once the session has terminated, for any reason.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Incoming {
    /// Next stream accepted from the peer; `None` once the session is down.
    pub async fn next(&mut self) -> Option<TunnelStream> {
        self.rx.recv().await
    }
}

/// Single-task driver: multiplexes open requests, inbound acceptance and
/// connection I/O over one `poll_fn`, then fires the close signal.
async fn drive<I>(
    mut connection: yamux::Connection<I>,
    mut cmd_rx: mpsc::Receiver<OpenReply>,
    inbound_tx: mpsc::UnboundedSender<TunnelStream>,
    closed_tx: watch::Sender<bool>,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut pending_opens: VecDeque<OpenReply> = VecDeque::new();
    let mut handles_gone = false;

    let result = future::poll_fn(|cx: &mut Context<'_>| -> Poll<Result<(), ConnectionError>> {
        // Pull in open requests from session handles.
        if !handles_gone {
            loop {
                match cmd_rx.poll_recv(cx) {
                    Poll::Ready(Some(reply)) => pending_opens.push_back(reply),
                    Poll::Ready(None) => {
                        handles_gone = true;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }

        // All handles dropped and nothing queued: close gracefully.
        if handles_gone && pending_opens.is_empty() {
            return connection.poll_close(cx);
        }

        // Service queued opens in order.
        while !pending_opens.is_empty() {
            match connection.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    if let Some(reply) = pending_opens.pop_front() {
                        let _ = reply.send(Ok(stream));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }

        // Drive connection I/O and hand off inbound streams.
        loop {
            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    // A dropped receiver resets the stream, which is the
                    // correct answer for a role that never accepts.
                    let _ = inbound_tx.send(stream);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    for reply in pending_opens {
        let _ = reply.send(Err(ConnectionError::Closed));
    }

    match result {
        Ok(()) => debug!("mux session closed"),
        Err(e) => warn!(error = %e, "mux session terminated"),
    }
    let _ = closed_tx.send(true);
}
