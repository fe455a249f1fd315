//! Protocol obfuscation layer
//!
//! Disguises the byte stream so it carries no recognizable protocol header:
//!
//! 1. **Init header**: 64 random bytes carrying the transport tag and the
//!    signed DC id in a masked tail
//! 2. **Keystream masking**: both directions are XORed with keystreams
//!    derived from the header and the optional proxy secret
//! 3. **Upstream proxy**: with `address`/`port` in the layer parameters the
//!    inner chain connects to that proxy instead of the DC
//!
//! The tag comes from the layer prefix: empty selects the intermediate tag,
//! a single `0xef` the abridged tag, four bytes are taken as-is.

mod keystream;
mod stream;

pub use keystream::Keystream;
pub use stream::{build_header, decode_header, DecodedHeader, ObfuscatedStream, HEADER_LEN};

use crate::context::ConnectionContext;
use crate::layer::{extra_port, extra_str, Layer, LayerExtra, LayerKind};
use crate::transport::{tcp_uri, BoxStream};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use tracing::debug;

/// Obfuscation errors
#[derive(Debug, Error)]
pub enum ObfuscationError {
    #[error("Invalid transport tag length: {0}")]
    InvalidTag(usize),

    #[error("Invalid proxy secret: {0}")]
    InvalidSecret(String),

    #[error("DC id {0} does not fit the header")]
    InvalidDc(i32),

    #[error("Random number generation failed")]
    Random,
}

/// Tag of the abridged transport
pub const ABRIDGED_TAG: [u8; 4] = [0xef; 4];

/// Tag of the intermediate transport
pub const INTERMEDIATE_TAG: [u8; 4] = [0xee; 4];

/// Tag of the padded intermediate transport
pub const PADDED_INTERMEDIATE_TAG: [u8; 4] = [0xdd; 4];

/// Length of a proxy secret
pub const SECRET_LEN: usize = 16;

/// Fill `buf` with cryptographically secure random bytes
pub(crate) fn random_bytes(buf: &mut [u8]) -> std::result::Result<(), ObfuscationError> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| ObfuscationError::Random)
}

/// Transport tag selected by a layer prefix
pub fn protocol_tag(prefix: &[u8]) -> std::result::Result<[u8; 4], ObfuscationError> {
    match prefix {
        [] => Ok(INTERMEDIATE_TAG),
        [0xef] => Ok(ABRIDGED_TAG),
        [a, b, c, d] => Ok([*a, *b, *c, *d]),
        _ => Err(ObfuscationError::InvalidTag(prefix.len())),
    }
}

/// Shared secret of an obfuscated proxy
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; SECRET_LEN]);

impl Secret {
    pub fn new(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a hex secret, accepting the `dd` (padded) marker
    pub fn from_hex(hex_secret: &str) -> std::result::Result<Self, ObfuscationError> {
        let bytes = hex::decode(hex_secret)
            .map_err(|e| ObfuscationError::InvalidSecret(e.to_string()))?;
        let raw = match bytes.as_slice() {
            [0xdd, rest @ ..] if rest.len() == SECRET_LEN => rest,
            [0xee, rest @ ..] if rest.len() > SECRET_LEN => {
                return Err(ObfuscationError::InvalidSecret(
                    "fake-TLS secrets are not supported".to_string(),
                ))
            }
            raw if raw.len() == SECRET_LEN => raw,
            raw => {
                return Err(ObfuscationError::InvalidSecret(format!(
                    "expected {} bytes, got {}",
                    SECRET_LEN,
                    raw.len()
                )))
            }
        };
        let mut secret = [0u8; SECRET_LEN];
        secret.copy_from_slice(raw);
        Ok(Self(secret))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// Obfuscation decorator
#[derive(Debug, Default)]
pub struct ObfuscationLayer {
    proxy: Option<(String, u16)>,
    secret: Option<Secret>,
}

impl ObfuscationLayer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Layer for ObfuscationLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Obfuscation
    }

    fn set_extra(&mut self, extra: &LayerExtra) -> Result<()> {
        if let Some(address) = extra_str(extra, "address") {
            let port = extra_port(extra, "port").unwrap_or(crate::DEFAULT_PORT);
            self.proxy = Some((address.to_string(), port));
        }
        if let Some(secret) = extra_str(extra, "secret") {
            self.secret = Some(Secret::from_hex(secret)?);
        }
        Ok(())
    }

    async fn connect(
        self: Box<Self>,
        ctx: &mut ConnectionContext,
        prefix: Bytes,
    ) -> Result<BoxStream> {
        let tag = protocol_tag(&prefix)?;
        let dc = i16::try_from(ctx.int_dc()).map_err(|_| ObfuscationError::InvalidDc(ctx.int_dc()))?;
        let (header, encrypt, decrypt) = build_header(tag, dc, self.secret.as_ref())?;
        let header = Bytes::copy_from_slice(&header);

        let inner = match &self.proxy {
            Some((address, port)) => {
                debug!("Obfuscated proxy {}:{} for DC {}", address, port, dc);
                // The relay speaks the obfuscated protocol itself
                let mut hop = ctx.with_uri(tcp_uri(address, *port)?);
                hop.set_secure(false);
                hop.next_layer(header).await?
            }
            None => ctx.next_layer(header).await?,
        };

        Ok(Box::new(ObfuscatedStream::new(inner, encrypt, decrypt)))
    }
}
