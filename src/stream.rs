//! Transport abstraction over plain TCP and TLS byte streams.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{client, server};

/// A byte stream that is either plaintext or wrapped in TLS.
///
/// The connection layer is generic over `AsyncRead + AsyncWrite` and never
/// inspects which variant it drives; this enum only exists so dialed and
/// accepted sockets share one concrete type.
pub enum MaybeTlsStream<S> {
    /// An unencrypted stream (`ws://`).
    Plain(S),
    /// A client-side TLS session (`wss://` dialed).
    ClientTls(Box<client::TlsStream<S>>),
    /// A server-side TLS session (`wss://` accepted).
    ServerTls(Box<server::TlsStream<S>>),
}

impl<S> AsyncRead for MaybeTlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::ClientTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            Self::ServerTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S> AsyncWrite for MaybeTlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::ClientTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            Self::ServerTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::ClientTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            Self::ServerTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::ClientTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            Self::ServerTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
