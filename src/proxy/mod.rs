//! Upstream proxy layers
//!
//! Provides:
//! - SOCKS5 client (RFC 1928, username/password per RFC 1929)
//! - HTTP CONNECT client
//!
//! Both take `address`, `port` and optional `username`/`password` from the
//! layer parameters, connect the inner chain to the proxy and then ask the
//! proxy for a tunnel to the context URI. The hop to the proxy is always
//! plain; a secure context gets its TLS session over the finished tunnel so
//! that it terminates at the DC.

mod http;
mod socks5;

pub use http::HttpProxyLayer;
pub use socks5::Socks5Layer;

use crate::context::ConnectionContext;
use crate::layer::{extra_port, extra_str, LayerExtra};
use crate::transport::{tcp_uri, tls_handshake, uri_target, BoxStream, TransportError};
use crate::{Error, Result};
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;
use url::Host;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("No acceptable authentication method")]
    NoAcceptableAuth,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Connection not allowed by ruleset")]
    ConnectionNotAllowed,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Host unreachable")]
    HostUnreachable,

    #[error("Network unreachable")]
    NetworkUnreachable,

    #[error("TTL expired")]
    TtlExpired,

    #[error("Command not supported")]
    CommandNotSupported,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Proxy answered with HTTP status {0}")]
    HttpStatus(u16),

    #[error("Invalid proxy response: {0}")]
    InvalidResponse(String),

    #[error("General failure: {0}")]
    GeneralFailure(String),
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Target of a context: the host and port of its URI
    pub fn from_context(ctx: &ConnectionContext) -> std::result::Result<Self, TransportError> {
        let uri = ctx
            .uri()
            .ok_or_else(|| TransportError::InvalidUri("context has no URI".to_string()))?;
        let (host, port) = uri_target(uri, ctx.socket_config().default_port)?;
        Ok(match host {
            Host::Ipv4(ip) => Address::Ipv4(ip.octets(), port),
            Host::Ipv6(ip) => Address::Ipv6(ip.octets(), port),
            Host::Domain(domain) => Address::Domain(domain, port),
        })
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => {
                write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            Address::Ipv6(ip, port) => {
                let addr = std::net::Ipv6Addr::from(*ip);
                write!(f, "[{}]:{}", addr, port)
            }
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Proxy endpoint and credentials taken from layer parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyParams {
    pub address: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
}

impl ProxyParams {
    pub fn from_extra(extra: &LayerExtra, default_port: u16) -> Result<Self> {
        let address = extra_str(extra, "address")
            .ok_or_else(|| Error::InvalidExtra("proxy layer needs an address".to_string()))?
            .to_string();
        let port = match extra.get("port") {
            None => default_port,
            Some(_) => extra_port(extra, "port")
                .ok_or_else(|| Error::InvalidExtra("invalid proxy port".to_string()))?,
        };
        let credentials = match (extra_str(extra, "username"), extra_str(extra, "password")) {
            (Some(user), pass) => Some((user.to_string(), pass.unwrap_or_default().to_string())),
            (None, _) => None,
        };
        Ok(Self {
            address,
            port,
            credentials,
        })
    }
}

/// Connect the rest of the chain to the proxy itself
async fn open_hop(ctx: &ConnectionContext, params: &ProxyParams) -> Result<BoxStream> {
    let uri = tcp_uri(&params.address, params.port)?;
    debug!("Reaching proxy {}", uri);
    let mut hop = ctx.with_uri(uri);
    hop.set_secure(false);
    hop.next_layer(Bytes::new()).await
}

/// Upgrade an established tunnel to TLS when the context is secure
async fn secure_tunnel(ctx: &ConnectionContext, stream: BoxStream) -> Result<BoxStream> {
    if !ctx.is_secure() {
        return Ok(stream);
    }
    let uri = ctx
        .uri()
        .ok_or_else(|| TransportError::InvalidUri("context has no URI".to_string()))?;
    Ok(Box::new(tls_handshake(ctx, uri, stream).await?))
}

fn missing_params(kind: &str) -> Error {
    Error::InvalidExtra(format!("{} layer configured without proxy parameters", kind))
}
