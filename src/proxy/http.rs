//! HTTP CONNECT client layer

use super::{missing_params, open_hop, secure_tunnel, Address, ProxyError, ProxyParams};
use crate::context::ConnectionContext;
use crate::layer::{Layer, LayerExtra, LayerKind};
use crate::transport::{write_prefix, BoxStream};
use crate::Result;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Default HTTP proxy port
pub const DEFAULT_HTTP_PROXY_PORT: u16 = 8080;

/// Upper bound on the proxy response head
const MAX_RESPONSE_HEAD: usize = 8192;

fn connect_request(target: &Address, credentials: Option<&(String, String)>) -> String {
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some((username, password)) = credentials {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", username, password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");
    request
}

/// Status code of an HTTP response head
fn parse_status(head: &[u8]) -> std::result::Result<u16, ProxyError> {
    let text = String::from_utf8_lossy(head);
    let status_line = text.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();

    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/1.") => code
            .parse()
            .map_err(|_| ProxyError::InvalidResponse(status_line.to_string())),
        _ => Err(ProxyError::InvalidResponse(status_line.to_string())),
    }
}

/// Ask an HTTP proxy for a tunnel to `target`
///
/// Reads the response head byte by byte so no tunneled data is consumed.
pub async fn handshake<S>(
    stream: &mut S,
    target: &Address,
    credentials: Option<&(String, String)>,
) -> std::result::Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream
        .write_all(connect_request(target, credentials).as_bytes())
        .await?;
    stream.flush().await?;

    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(ProxyError::InvalidResponse("response head too large".to_string()));
        }
        head.push(stream.read_u8().await?);
    }

    match parse_status(&head)? {
        200 => Ok(()),
        407 => Err(ProxyError::AuthenticationFailed),
        status => Err(ProxyError::HttpStatus(status)),
    }
}

/// HTTP CONNECT proxy decorator
#[derive(Debug, Default)]
pub struct HttpProxyLayer {
    params: Option<ProxyParams>,
}

impl HttpProxyLayer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Layer for HttpProxyLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::HttpProxy
    }

    fn set_extra(&mut self, extra: &LayerExtra) -> Result<()> {
        self.params = Some(ProxyParams::from_extra(extra, DEFAULT_HTTP_PROXY_PORT)?);
        Ok(())
    }

    async fn connect(
        self: Box<Self>,
        ctx: &mut ConnectionContext,
        prefix: Bytes,
    ) -> Result<BoxStream> {
        let params = self.params.as_ref().ok_or_else(|| missing_params("http proxy"))?;
        let target = Address::from_context(ctx)?;

        let mut stream = open_hop(ctx, params).await?;
        debug!("HTTP CONNECT to {} via {}:{}", target, params.address, params.port);
        if let Err(e) = handshake(&mut stream, &target, params.credentials.as_ref()).await {
            warn!("HTTP proxy {}:{} refused {}: {}", params.address, params.port, target, e);
            return Err(e.into());
        }

        let mut stream = secure_tunnel(ctx, stream).await?;
        write_prefix(&mut stream, &prefix).await?;
        Ok(stream)
    }
}
