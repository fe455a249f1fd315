//! TLS over the stream chain
//!
//! Used two ways: by [`TransportLayer`](super::TransportLayer) when the
//! context is secure, and as a standalone [`TlsLayer`] decorator that secures
//! whatever stream the next layer produces (for example a SOCKS5 tunnel).

use super::{uri_target, write_prefix, BoxStream, TransportError};
use crate::context::ConnectionContext;
use crate::layer::{Layer, LayerKind};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::debug;
use url::{Host, Url};

/// Build the rustls client configuration
pub fn build_tls_config() -> std::result::Result<ClientConfig, TransportError> {
    // Get root certificates
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))
        .map(|builder| {
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        })
}

/// Server name presented in the ClientHello
fn server_name(uri: &Url, default_port: u16) -> std::result::Result<ServerName<'static>, TransportError> {
    let name = match uri_target(uri, default_port)?.0 {
        Host::Domain(domain) => domain,
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    };
    ServerName::try_from(name).map_err(|e| TransportError::Tls(format!("Invalid SNI: {}", e)))
}

/// Run a TLS client handshake over `stream` against the host of `uri`
pub(crate) async fn handshake<S>(
    ctx: &ConnectionContext,
    uri: &Url,
    stream: S,
) -> std::result::Result<TlsStream<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let config = ctx.socket_config();
    let server_name = server_name(uri, config.default_port)?;
    let connector = TlsConnector::from(Arc::new(build_tls_config()?));

    debug!("TLS handshake with {:?}", server_name);
    let handshake = connector.connect(server_name, stream);

    let stream = tokio::select! {
        biased;
        _ = ctx.cancellation_token().cancelled() => return Err(TransportError::Cancelled),
        result = tokio::time::timeout(config.connect_timeout(), handshake) => result
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Tls(e.to_string()))?,
    };

    Ok(stream)
}

/// TLS decorator over the next layer
#[derive(Debug, Default)]
pub struct TlsLayer;

impl TlsLayer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Layer for TlsLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Tls
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

        let inner = ctx.next_layer(Bytes::new()).await?;
        let mut stream: BoxStream = Box::new(handshake(ctx, &uri, inner).await?);

        write_prefix(&mut stream, &prefix).await?;
        Ok(stream)
    }
}
