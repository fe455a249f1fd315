//! Transport layer implementations
//!
//! Provides the bottom of every stream chain:
//! - the socket-open capability ([`open_socket`]) honoring IPv6 preference,
//!   connect timeout and cancellation
//! - [`TransportLayer`], raw TCP (TLS when the context is secure)
//! - [`TlsLayer`], TLS over whatever stream sits below it

mod tcp;
mod tls;

pub use tcp::{ReadNotify, TransportLayer};
pub use tls::{build_tls_config, TlsLayer};
pub(crate) use tls::handshake as tls_handshake;

use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::{Host, Url};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("No address for host {0}")]
    NoAddress(String),

    #[error("Connection cancelled")]
    Cancelled,

    #[error("Timeout")]
    Timeout,
}

/// A live byte stream produced by a layer
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Boxed stream handed from layer to layer
pub type BoxStream = Box<dyn ByteStream>;

/// Socket-open configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Connection timeout in seconds (also bounds TLS handshakes)
    pub connect_timeout: u64,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
    /// Port used when the URI carries none
    pub default_port: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            nodelay: true,
            default_port: crate::DEFAULT_PORT,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

/// Host and port of a URI, with IP literals unwrapped
pub fn uri_target(uri: &Url, default_port: u16) -> Result<(Host<String>, u16), TransportError> {
    let host = match uri.host() {
        Some(Host::Domain(domain)) => match domain.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Host::Ipv4(ip),
            Ok(IpAddr::V6(ip)) => Host::Ipv6(ip),
            Err(_) => Host::Domain(domain.to_string()),
        },
        Some(Host::Ipv4(ip)) => Host::Ipv4(ip),
        Some(Host::Ipv6(ip)) => Host::Ipv6(ip),
        None => return Err(TransportError::InvalidUri(format!("{} has no host", uri))),
    };
    let port = uri.port_or_known_default().unwrap_or(default_port);
    Ok((host, port))
}

/// Build a `tcp://` URI for a host/port pair
pub fn tcp_uri(host: &str, port: u16) -> Result<Url, TransportError> {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    Url::parse(&format!("tcp://{}:{}", host, port))
        .map_err(|e| TransportError::InvalidUri(format!("{}:{}: {}", host, port, e)))
}

/// First resolved address of the preferred family, else the first address
pub fn pick_address<I>(addrs: I, ipv6: bool) -> Option<SocketAddr>
where
    I: IntoIterator<Item = SocketAddr>,
{
    let mut fallback = None;
    for addr in addrs {
        if addr.is_ipv6() == ipv6 {
            return Some(addr);
        }
        fallback.get_or_insert(addr);
    }
    fallback
}

/// Open a TCP connection to `uri`
///
/// Resolution goes through the system resolver. An address of the preferred
/// family wins, otherwise the first resolved address is used; IP literals are
/// dialed as given. Connecting races the configured timeout and the
/// cancellation token.
pub async fn open_socket(
    config: &TransportConfig,
    uri: &Url,
    ipv6: bool,
    cancellation: &CancellationToken,
) -> Result<TcpStream, TransportError> {
    let (host, port) = uri_target(uri, config.default_port)?;

    let connect = async {
        let addr = match host {
            Host::Ipv4(ip) => SocketAddr::new(IpAddr::V4(ip), port),
            Host::Ipv6(ip) => SocketAddr::new(IpAddr::V6(ip), port),
            Host::Domain(domain) => {
                let addrs = tokio::net::lookup_host((domain.as_str(), port)).await?;
                pick_address(addrs, ipv6).ok_or(TransportError::NoAddress(domain))?
            }
        };
        debug!("Opening socket to {} for {}", addr, uri);

        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok::<_, TransportError>(stream)
    };

    let stream = tokio::select! {
        biased;
        _ = cancellation.cancelled() => return Err(TransportError::Cancelled),
        result = connect => result?,
    };

    // Configure TCP options
    if config.nodelay {
        stream.set_nodelay(true).ok();
    }

    Ok(stream)
}

/// Write a layer prefix, if any, once the layer is established
pub(crate) async fn write_prefix<S>(stream: &mut S, prefix: &[u8]) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    if !prefix.is_empty() {
        stream.write_all(prefix).await?;
        stream.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[test]
    fn test_uri_target() {
        let uri = Url::parse("tcp://149.154.167.50:443").unwrap();
        let (host, port) = uri_target(&uri, 80).unwrap();
        assert_eq!(host, Host::<String>::Ipv4(Ipv4Addr::new(149, 154, 167, 50)));
        assert_eq!(port, 443);

        let uri = Url::parse("tcp://[2001:db8::1]").unwrap();
        let (host, port) = uri_target(&uri, 80).unwrap();
        assert!(matches!(host, Host::Ipv6(_)));
        assert_eq!(port, 80);

        let uri = Url::parse("https://example.com").unwrap();
        let (host, port) = uri_target(&uri, 80).unwrap();
        assert_eq!(host, Host::Domain("example.com".to_string()));
        assert_eq!(port, 443);
    }

    #[test]
    fn test_tcp_uri_brackets_ipv6() {
        assert_eq!(tcp_uri("::1", 1080).unwrap().as_str(), "tcp://[::1]:1080");
        assert_eq!(tcp_uri("10.0.0.1", 1080).unwrap().as_str(), "tcp://10.0.0.1:1080");
    }

    #[test]
    fn test_pick_address_prefers_family() {
        let v4: SocketAddr = "127.0.0.1:443".parse().unwrap();
        let v6: SocketAddr = "[::1]:443".parse().unwrap();

        assert_eq!(pick_address([v4, v6], true), Some(v6));
        assert_eq!(pick_address([v6, v4], false), Some(v4));
        // No address of the preferred family: fall back to the first one
        assert_eq!(pick_address([v4], true), Some(v4));
        assert_eq!(pick_address([v6], false), Some(v6));
        assert_eq!(pick_address(Vec::<SocketAddr>::new(), true), None);
    }

    #[tokio::test]
    async fn test_open_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let uri = tcp_uri("127.0.0.1", addr.port()).unwrap();

        let stream = open_socket(&TransportConfig::default(), &uri, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_open_socket_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = tcp_uri("127.0.0.1", listener.local_addr().unwrap().port()).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let result = open_socket(&TransportConfig::default(), &uri, false, &token).await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }
}
