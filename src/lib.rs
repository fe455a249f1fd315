//! # dcchain
//!
//! Connection context and stream-chain builder for clients that reach a
//! numbered remote endpoint (a "DC") through a stack of transport decorators.
//!
//! ## Features
//!
//! - **Datacenter identifiers** with test/media/CDN variants and their signed
//!   wire encoding
//! - **Connection context** recording target, flags, socket options,
//!   cancellation and the layer stack
//! - **Layered assembly**: layers declared innermost first, connected
//!   outermost first, each decorator pulling its inner stream from the context
//! - **Forking** a configured template for every connection attempt
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        Obfuscation  (init header, masking)          │
//! ├─────────────────────────────────────────────────────┤
//! │        Upstream proxy  (SOCKS5, HTTP CONNECT)        │
//! ├─────────────────────────────────────────────────────┤
//! │        TLS                                          │
//! ├─────────────────────────────────────────────────────┤
//! │        Transport  (TCP socket to the URI)           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ```no_run
//! use dcchain::{ConnectionContext, LayerKind};
//!
//! # async fn run() -> dcchain::Result<()> {
//! let mut ctx = ConnectionContext::new();
//! ctx.set_uri_str("tcp://149.154.167.51:443")?;
//! ctx.set_dc("2")?;
//! ctx.add_layer(LayerKind::Transport, None)
//!     .add_layer(LayerKind::Obfuscation, None);
//!
//! let stream = ctx.connect().await?;
//! # drop(stream);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod dc;
pub mod layer;
pub mod obfuscation;
pub mod proxy;
pub mod transport;

pub use config::Config;
pub use context::{ConnectionContext, ProxyDescriptor};
pub use dc::{DcId, DcVariant};
pub use layer::{Layer, LayerDescriptor, LayerExtra, LayerKind};
pub use transport::{BoxStream, TransportConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Port used when neither URI nor layer parameters name one
pub const DEFAULT_PORT: u16 = 443;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid DC identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Layer chain exhausted")]
    ChainExhausted,

    #[error("Invalid layer parameters: {0}")]
    InvalidExtra(String),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Obfuscation error: {0}")]
    Obfuscation(#[from] obfuscation::ObfuscationError),

    #[error("Configuration error: {0}")]
    Config(String),
}
