//! WebSocket framing adapter.
//!
//! [`WsByteStream`] turns a post-upgrade WebSocket connection into a plain
//! byte stream: every write becomes one binary frame, reads concatenate
//! incoming frame payloads, and control frames are handled transparently.
//! The multiplexer above never sees frame boundaries.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures_util::io::{AsyncRead, AsyncWrite};
use futures_util::{Sink, Stream};
use tokio::time::Interval;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use url::Url;

use crate::dialer::BoxIo;

/// Frame-size limits shared by both endpoints.
pub fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    }
}

/// Perform the client side of the WebSocket upgrade over an established
/// (already TLS-wrapped) stream.
///
/// The `Authorization` header carries the shared secret verbatim; `Origin`
/// repeats the connect URL with its scheme preserved.
pub async fn client_upgrade(
    stream: BoxIo,
    url: &Url,
    user_agent: &str,
    password: &str,
) -> anyhow::Result<WebSocketStream<BoxIo>> {
    // The operator configures an https URL; the upgrade itself speaks ws.
    let ws_url = match url.scheme() {
        "https" => url.as_str().replacen("https://", "wss://", 1),
        "http" => url.as_str().replacen("http://", "ws://", 1),
        _ => url.as_str().to_string(),
    };

    let mut request = ws_url.into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        http::header::USER_AGENT,
        http::HeaderValue::from_str(user_agent)?,
    );
    headers.insert(
        http::header::AUTHORIZATION,
        http::HeaderValue::from_str(password)?,
    );
    headers.insert(http::header::ORIGIN, http::HeaderValue::from_str(url.as_str())?);

    let (ws, response) =
        tokio_tungstenite::client_async_with_config(request, stream, Some(ws_config()))
            .await
            .map_err(|e| match e {
                WsError::Http(resp) => {
                    anyhow::anyhow!("websocket upgrade rejected: HTTP {}", resp.status())
                }
                e => anyhow::anyhow!("websocket upgrade failed: {e}"),
            })?;

    debug!(status = %response.status(), "websocket established");
    Ok(ws)
}

/// Byte-stream view of a WebSocket connection.
///
/// When a ping interval is set, a WebSocket ping is sent from within
/// `poll_read` on every tick; a failed ping surfaces as a read error and
/// tears the session above it down.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    read_buf: BytesMut,
    ping: Option<Interval>,
}

impl<S> WsByteStream<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    pub fn new(inner: WebSocketStream<S>, ping_interval: Option<Duration>) -> Self {
        let ping = ping_interval.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });
        Self {
            inner,
            read_buf: BytesMut::new(),
            ping,
        }
    }

    fn poll_keepalive(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        let Some(interval) = self.ping.as_mut() else {
            return Ok(());
        };
        if interval.poll_tick(cx).is_ready() {
            // Only send when the sink has capacity; a skipped ping is
            // recovered on the next tick.
            if let Poll::Ready(ready) = Pin::new(&mut self.inner).poll_ready(cx) {
                ready.map_err(ws_io_err)?;
                Pin::new(&mut self.inner)
                    .start_send(Message::Ping(Vec::new()))
                    .map_err(ws_io_err)?;
            }
            if let Poll::Ready(flushed) = Pin::new(&mut self.inner).poll_flush(cx) {
                flushed.map_err(ws_io_err)?;
            }
        }
        Ok(())
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.poll_keepalive(cx)?;

        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.len());
                buf[..n].copy_from_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(n));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.read_buf.extend_from_slice(&data),
                Some(Ok(Message::Text(text))) => this.read_buf.extend_from_slice(text.as_bytes()),
                // Pings are answered by tungstenite itself while polling.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) => return Poll::Ready(Ok(0)),
                Some(Err(e)) if is_closed(&e) => return Poll::Ready(Ok(0)),
                Some(Err(e)) => return Poll::Ready(Err(ws_io_err(e))),
                None => return Poll::Ready(Ok(0)),
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(ws_io_err)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(ws_io_err)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx).map_err(ws_io_err)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_close(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) if is_closed(&e) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(ws_io_err(e))),
        }
    }
}

/// Connection teardown variants that read as a clean EOF.
fn is_closed(e: &WsError) -> bool {
    matches!(e, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

fn ws_io_err(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::NotConnected, "websocket closed")
        }
        other => io::Error::other(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> (WsByteStream<tokio::io::DuplexStream>, WsByteStream<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let client =
            WebSocketStream::from_raw_socket(a, Role::Client, Some(ws_config())).await;
        let server =
            WebSocketStream::from_raw_socket(b, Role::Server, Some(ws_config())).await;
        (
            WsByteStream::new(client, None),
            WsByteStream::new(server, None),
        )
    }

    #[tokio::test]
    async fn bytes_round_trip_both_directions() {
        let (mut client, mut server) = pair().await;

        client.write_all(b"hello from client").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 32];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from client");

        server.write_all(b"hello from server").await.unwrap();
        server.flush().await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from server");
    }

    #[tokio::test]
    async fn short_reads_drain_a_large_frame() {
        let (mut client, mut server) = pair().await;

        let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).await.unwrap();
        client.flush().await.unwrap();

        let mut collected = Vec::new();
        let mut buf = [0u8; 100];
        while collected.len() < payload.len() {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0);
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, payload);
    }

    #[tokio::test]
    async fn close_reads_as_eof() {
        let (mut client, mut server) = pair().await;
        client.close().await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }
}
