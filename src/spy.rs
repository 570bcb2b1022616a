//! Debug I/O tap: pass-through stream wrapper that hex-dumps all traffic.

use std::fmt::Write as _;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Wraps a byte stream and logs every read and write as an `xxd`-style
/// hex dump. The wrapped stream is otherwise untouched.
pub struct Spy<S> {
    inner: S,
    label: &'static str,
}

impl<S> Spy<S> {
    pub fn new(inner: S, label: &'static str) -> Self {
        Self { inner, label }
    }
}

impl<S> std::fmt::Debug for Spy<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spy").field("label", &self.label).finish()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Spy<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let data = &buf.filled()[before..];
            debug!("[{}] read {} bytes <=\n{}", self.label, data.len(), hexdump(data));
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Spy<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            debug!("[{}] write {} bytes =>\n{}", self.label, n, hexdump(&buf[..*n]));
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_shutdown(cx);
        if let Poll::Ready(res) = &result {
            debug!("[{}] shutdown: {:?}", self.label, res.as_ref().map(|_| ()));
        }
        result
    }
}

/// Format bytes like `xxd`: offset prefix, 16 hex bytes per row, ASCII
/// gutter with `.` for non-printables.
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}: ", row * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
        }
        out.push(' ');
        for &b in chunk {
            out.push(if (0x20..0x7f).contains(&b) { b as char } else { '.' });
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hexdump_single_row() {
        let dump = hexdump(b"ping\n");
        assert_eq!(dump, "00000000: 70 69 6e 67 0a                                   ping.\n");
    }

    #[test]
    fn hexdump_multi_row_offsets() {
        let data: Vec<u8> = (0u8..0x20).collect();
        let dump = hexdump(&data);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000: 00 01 02"));
        assert!(lines[1].starts_with("00000010: 10 11 12"));
        // Non-printables render as dots in the gutter.
        assert!(lines[0].ends_with("................"));
    }

    #[test]
    fn hexdump_empty() {
        assert_eq!(hexdump(&[]), "");
    }
}
