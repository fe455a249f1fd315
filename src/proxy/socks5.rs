//! SOCKS5 client layer (RFC 1928)

use super::{missing_params, open_hop, secure_tunnel, Address, ProxyError, ProxyParams};
use crate::context::ConnectionContext;
use crate::layer::{Layer, LayerExtra, LayerKind};
use crate::transport::{write_prefix, BoxStream};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Username/password sub-negotiation version
const AUTH_VERSION: u8 = 0x01;

/// Default SOCKS5 port
pub const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Map a non-success reply code
fn reply_error(code: u8) -> ProxyError {
    match code {
        0x02 => ProxyError::ConnectionNotAllowed,
        0x03 => ProxyError::NetworkUnreachable,
        0x04 => ProxyError::HostUnreachable,
        0x05 => ProxyError::ConnectionRefused,
        0x06 => ProxyError::TtlExpired,
        0x07 => ProxyError::CommandNotSupported,
        0x08 => ProxyError::UnsupportedAddressType(0),
        code => ProxyError::GeneralFailure(format!("reply code {:#04x}", code)),
    }
}

/// Encode the CONNECT request for `addr`
fn make_request(addr: &Address) -> std::result::Result<Vec<u8>, ProxyError> {
    let mut buf = vec![SOCKS_VERSION, Command::Connect as u8, 0x00];

    match addr {
        Address::Ipv4(ip, port) => {
            buf.push(AddressType::Ipv4 as u8);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Ipv6(ip, port) => {
            buf.push(AddressType::Ipv6 as u8);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Domain(domain, port) => {
            let len = u8::try_from(domain.len())
                .map_err(|_| ProxyError::InvalidAddress(domain.clone()))?;
            buf.push(AddressType::Domain as u8);
            buf.push(len);
            buf.extend_from_slice(domain.as_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }

    Ok(buf)
}

/// Run the client side of the SOCKS5 handshake
pub async fn handshake<S>(
    stream: &mut S,
    target: &Address,
    credentials: Option<&(String, String)>,
) -> std::result::Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    // Greeting
    let greeting: &[u8] = match credentials {
        Some(_) => &[
            SOCKS_VERSION,
            2,
            AuthMethod::NoAuth as u8,
            AuthMethod::UsernamePassword as u8,
        ],
        None => &[SOCKS_VERSION, 1, AuthMethod::NoAuth as u8],
    };
    stream.write_all(greeting).await?;
    stream.flush().await?;

    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    match buf[1] {
        m if m == AuthMethod::NoAuth as u8 => {}
        m if m == AuthMethod::UsernamePassword as u8 => {
            let (username, password) = credentials.ok_or(ProxyError::NoAcceptableAuth)?;
            let ulen = u8::try_from(username.len()).map_err(|_| ProxyError::AuthenticationFailed)?;
            let plen = u8::try_from(password.len()).map_err(|_| ProxyError::AuthenticationFailed)?;

            let mut auth = vec![AUTH_VERSION, ulen];
            auth.extend_from_slice(username.as_bytes());
            auth.push(plen);
            auth.extend_from_slice(password.as_bytes());
            stream.write_all(&auth).await?;
            stream.flush().await?;

            stream.read_exact(&mut buf).await?;
            if buf[1] != 0x00 {
                return Err(ProxyError::AuthenticationFailed);
            }
        }
        _ => return Err(ProxyError::NoAcceptableAuth),
    }

    // Request
    stream.write_all(&make_request(target)?).await?;
    stream.flush().await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(reply[0]));
    }
    if reply[1] != 0x00 {
        return Err(reply_error(reply[1]));
    }

    // Skip the bound address
    let addr_len = match AddressType::try_from(reply[3])? {
        AddressType::Ipv4 => 4,
        AddressType::Ipv6 => 16,
        AddressType::Domain => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

/// SOCKS5 proxy decorator
#[derive(Debug, Default)]
pub struct Socks5Layer {
    params: Option<ProxyParams>,
}

impl Socks5Layer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Layer for Socks5Layer {
    fn kind(&self) -> LayerKind {
        LayerKind::Socks5
    }

    fn set_extra(&mut self, extra: &LayerExtra) -> Result<()> {
        self.params = Some(ProxyParams::from_extra(extra, DEFAULT_SOCKS_PORT)?);
        Ok(())
    }

    async fn connect(
        self: Box<Self>,
        ctx: &mut ConnectionContext,
        prefix: Bytes,
    ) -> Result<BoxStream> {
        let params = self.params.as_ref().ok_or_else(|| missing_params("socks5"))?;
        let target = Address::from_context(ctx)?;

        let mut stream = open_hop(ctx, params).await?;
        debug!("SOCKS5 CONNECT to {} via {}:{}", target, params.address, params.port);
        if let Err(e) = handshake(&mut stream, &target, params.credentials.as_ref()).await {
            warn!("SOCKS5 proxy {}:{} refused {}: {}", params.address, params.port, target, e);
            return Err(e.into());
        }

        let mut stream = secure_tunnel(ctx, stream).await?;
        write_prefix(&mut stream, &prefix).await?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_make_request() {
        let req = make_request(&Address::Ipv4([1, 2, 3, 4], 443)).unwrap();
        assert_eq!(req, vec![5, 1, 0, 1, 1, 2, 3, 4, 0x01, 0xbb]);

        let req = make_request(&Address::Domain("dc.example".to_string(), 80)).unwrap();
        assert_eq!(&req[..5], &[5, 1, 0, 3, 10]);
        assert_eq!(&req[5..15], b"dc.example");
        assert_eq!(&req[15..], &[0, 80]);

        let long = Address::Domain("a".repeat(300), 80);
        assert!(matches!(make_request(&long), Err(ProxyError::InvalidAddress(_))));
    }

    #[test]
    fn test_reply_error() {
        assert!(matches!(reply_error(0x05), ProxyError::ConnectionRefused));
        assert!(matches!(reply_error(0x04), ProxyError::HostUnreachable));
        assert!(matches!(reply_error(0x01), ProxyError::GeneralFailure(_)));
    }

    #[tokio::test]
    async fn test_handshake_with_auth() {
        let (mut client, mut server) = duplex(1024);
        let target = Address::Ipv4([10, 0, 0, 2], 443);
        let creds = ("user".to_string(), "secret".to_string());

        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 2, 0, 2]);
            server.write_all(&[5, 2]).await.unwrap();

            let mut auth = [0u8; 13];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth[..2], &[1, 4]);
            assert_eq!(&auth[2..6], b"user");
            assert_eq!(auth[6], 6);
            assert_eq!(&auth[7..], b"secret");
            server.write_all(&[1, 0]).await.unwrap();

            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(request, [5, 1, 0, 1, 10, 0, 0, 2, 0x01, 0xbb]);
            server
                .write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0x04, 0x38])
                .await
                .unwrap();
        });

        handshake(&mut client, &target, Some(&creds)).await.unwrap();
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_over_buffered_stream() {
        let (client, mut server) = duplex(1024);
        let mut client = tokio::io::BufWriter::new(client);
        let target = Address::Ipv4([10, 0, 0, 3], 443);

        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[5, 0]).await.unwrap();
            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            server.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
            request
        });

        // Every message must reach the proxy without waiting for more output
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            handshake(&mut client, &target, None),
        )
        .await
        .expect("handshake stalled on buffered writes")
        .unwrap();
        assert_eq!(proxy.await.unwrap(), [5, 1, 0, 1, 10, 0, 0, 3, 0x01, 0xbb]);
    }

    #[tokio::test]
    async fn test_handshake_refused() {
        let (mut client, mut server) = duplex(1024);
        let target = Address::Domain("example.org".to_string(), 443);

        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[5, 0]).await.unwrap();
            let mut request = [0u8; 5 + 11 + 2];
            server.read_exact(&mut request).await.unwrap();
            server.write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let result = handshake(&mut client, &target, None).await;
        assert!(matches!(result, Err(ProxyError::ConnectionRefused)));
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_needs_credentials() {
        let (mut client, mut server) = duplex(1024);
        let target = Address::Ipv4([1, 1, 1, 1], 443);

        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[5, 2]).await.unwrap();
        });

        let result = handshake(&mut client, &target, None).await;
        assert!(matches!(result, Err(ProxyError::NoAcceptableAuth)));
        proxy.await.unwrap();
    }
}
