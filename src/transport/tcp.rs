//! Raw socket layer, the bottom of every chain

use super::{open_socket, tls, write_prefix, BoxStream, TransportError};
use crate::context::{ConnectionContext, ReadCallback};
use crate::layer::{Layer, LayerKind};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Opens the socket to the context URI
///
/// Wraps the socket in TLS when the context is secure and reports reads to
/// the context's read callback.
#[derive(Debug, Default)]
pub struct TransportLayer;

impl TransportLayer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Layer for TransportLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Transport
    }

    async fn connect(
        self: Box<Self>,
        ctx: &mut ConnectionContext,
        prefix: Bytes,
    ) -> Result<BoxStream> {
        let uri = ctx
            .uri()
            .cloned()
            .ok_or_else(|| TransportError::InvalidUri("context has no URI".to_string()))?;

        let socket = open_socket(ctx.socket_config(), &uri, ctx.ipv6(), ctx.cancellation_token()).await?;
        let socket = ReadNotify::new(socket, ctx.read_callback().cloned());

        let mut stream: BoxStream = if ctx.is_secure() {
            Box::new(tls::handshake(ctx, &uri, socket).await?)
        } else {
            Box::new(socket)
        };

        write_prefix(&mut stream, &prefix).await?;
        Ok(stream)
    }
}

/// Stream wrapper reporting the size of every non-empty read
pub struct ReadNotify<S> {
    inner: S,
    callback: Option<ReadCallback>,
}

impl<S> ReadNotify<S> {
    pub fn new(inner: S, callback: Option<ReadCallback>) -> Self {
        Self { inner, callback }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReadNotify<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = buf.filled().len() - before;
            if read > 0 {
                if let Some(callback) = &self.callback {
                    callback(read);
                }
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReadNotify<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
