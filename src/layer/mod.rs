//! Stream-chain layers
//!
//! A connection is declared as a stack of [`LayerDescriptor`]s, innermost
//! first. At connect time the stack is consumed from the top: every layer is
//! built through [`LayerKind::instantiate`], handed its parameter bag when it
//! carries one, and asked to [`Layer::connect`]. Decorators obtain the stream
//! they wrap by calling [`ConnectionContext::next_layer`] themselves, so a
//! chain declared inner-to-outer is built outer-to-inner.

use crate::context::ConnectionContext;
use crate::obfuscation::ObfuscationLayer;
use crate::proxy::{HttpProxyLayer, Socks5Layer};
use crate::transport::{BoxStream, TlsLayer, TransportLayer};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-layer parameter bag (a JSON object)
pub type LayerExtra = serde_json::Map<String, serde_json::Value>;

/// Closed set of layer kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Raw socket to the context URI (bottom of every chain)
    Transport,
    /// TLS over the inner stream
    Tls,
    /// Protocol obfuscation, optionally through an upstream proxy
    Obfuscation,
    /// SOCKS5 upstream proxy
    Socks5,
    /// HTTP CONNECT upstream proxy
    HttpProxy,
}

impl LayerKind {
    /// Every kind, in declaration order
    pub const ALL: [LayerKind; 5] = [
        LayerKind::Transport,
        LayerKind::Tls,
        LayerKind::Obfuscation,
        LayerKind::Socks5,
        LayerKind::HttpProxy,
    ];

    /// Display name used in context descriptions
    pub fn name(self) -> &'static str {
        match self {
            LayerKind::Transport => "Transport",
            LayerKind::Tls => "Tls",
            LayerKind::Obfuscation => "Obfuscation",
            LayerKind::Socks5 => "Socks5",
            LayerKind::HttpProxy => "HttpProxy",
        }
    }

    /// Whether instances of this kind accept a parameter bag
    pub fn carries_extra(self) -> bool {
        matches!(
            self,
            LayerKind::Obfuscation | LayerKind::Socks5 | LayerKind::HttpProxy
        )
    }

    /// Construct an unconnected layer of this kind
    pub fn instantiate(self) -> Box<dyn Layer> {
        match self {
            LayerKind::Transport => Box::new(TransportLayer::new()),
            LayerKind::Tls => Box::new(TlsLayer::new()),
            LayerKind::Obfuscation => Box::new(ObfuscationLayer::new()),
            LayerKind::Socks5 => Box::new(Socks5Layer::new()),
            LayerKind::HttpProxy => Box::new(HttpProxyLayer::new()),
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One entry of the layer stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub kind: LayerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<LayerExtra>,
}

impl LayerDescriptor {
    pub fn new(kind: LayerKind, extra: Option<LayerExtra>) -> Self {
        Self { kind, extra }
    }

    /// Extra parameters worth showing in a description
    pub(crate) fn displayed_extra(&self) -> Option<&LayerExtra> {
        match (&self.kind, &self.extra) {
            (LayerKind::Transport, _) => None,
            (_, Some(extra)) if !extra.is_empty() => Some(extra),
            _ => None,
        }
    }
}

/// A layer of the stream chain
#[async_trait]
pub trait Layer: Send {
    /// Kind of this layer
    fn kind(&self) -> LayerKind;

    /// Accept the descriptor's parameter bag before connecting
    ///
    /// Only called for kinds where [`LayerKind::carries_extra`] holds.
    fn set_extra(&mut self, _extra: &LayerExtra) -> Result<()> {
        Ok(())
    }

    /// Establish this layer and return the live stream
    ///
    /// `prefix` holds bytes the layer writes once its own setup is complete.
    async fn connect(self: Box<Self>, ctx: &mut ConnectionContext, prefix: Bytes)
        -> Result<BoxStream>;
}

/// Read a string parameter from a bag
pub(crate) fn extra_str<'a>(extra: &'a LayerExtra, key: &str) -> Option<&'a str> {
    extra.get(key).and_then(|v| v.as_str())
}

/// Read a port parameter, accepting both numbers and numeric strings
pub(crate) fn extra_port(extra: &LayerExtra, key: &str) -> Option<u16> {
    match extra.get(key)? {
        serde_json::Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
