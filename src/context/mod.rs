//! Connection context
//!
//! A [`ConnectionContext`] holds everything needed to reach one DC: the
//! target URI, addressing flags, socket options, the cancellation token and
//! the layer stack describing how the stream chain is assembled.
//!
//! The stack is a consumption stack. Layers are pushed innermost first with
//! [`ConnectionContext::add_layer`] and popped outermost first by
//! [`ConnectionContext::next_layer`]. Every connection attempt should work on
//! its own [`ConnectionContext::fork`] so that consuming the stack never
//! affects the template or a sibling attempt.

use crate::dc::{self, DcId};
use crate::layer::{LayerDescriptor, LayerExtra, LayerKind};
use crate::transport::{BoxStream, TransportConfig};
use crate::{Error, Result};
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Callback invoked with the byte count of every non-empty socket read
pub type ReadCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Tag of the proxy descriptor record
pub const INPUT_CLIENT_PROXY: &str = "inputClientProxy";

/// Upstream proxy record for the handshake layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyDescriptor {
    #[serde(rename = "_")]
    pub tag: &'static str,
    pub address: String,
    /// Proxy port; `None` when the configured value is not a valid port, in
    /// which case the raw value stays in `fields`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Remaining parameters of the obfuscation layer, in declaration order
    #[serde(flatten)]
    pub fields: LayerExtra,
}

/// State of one connection to a DC
#[derive(Clone)]
pub struct ConnectionContext {
    secure: bool,
    test: bool,
    media: bool,
    cdn: bool,
    dc: Option<DcId>,
    uri: Option<Arc<Url>>,
    ipv6: bool,
    is_dns: bool,
    socket_config: Arc<TransportConfig>,
    cancellation: CancellationToken,
    layers: Vec<LayerDescriptor>,
    /// Number of layers not yet consumed; the cursor is `remaining - 1`
    remaining: usize,
    read_callback: Option<ReadCallback>,
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self {
            secure: false,
            test: false,
            media: false,
            cdn: false,
            dc: None,
            uri: None,
            ipv6: false,
            is_dns: false,
            socket_config: Arc::new(TransportConfig::default()),
            cancellation: CancellationToken::new(),
            layers: Vec::new(),
            remaining: 0,
            read_callback: None,
        }
    }

    /// Set the DC from its text form (`2`, `2_media`, `2_cdn`)
    pub fn set_dc(&mut self, raw: &str) -> Result<&mut Self> {
        let dc: DcId = raw.parse()?;
        Ok(self.set_dc_id(dc))
    }

    /// Set an already validated DC
    pub fn set_dc_id(&mut self, dc: DcId) -> &mut Self {
        self.media = dc.is_media();
        self.cdn = dc.is_cdn();
        self.dc = Some(dc);
        self
    }

    pub fn dc(&self) -> Option<DcId> {
        self.dc
    }

    /// Signed DC id as sent on the wire (0 when no DC is set)
    pub fn int_dc(&self) -> i32 {
        self.dc
            .map(|dc| dc::encode(dc.id(), self.test, self.media))
            .unwrap_or(0)
    }

    pub fn set_secure(&mut self, secure: bool) -> &mut Self {
        self.secure = secure;
        self
    }

    /// Whether the transport wraps its socket in TLS
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn set_test(&mut self, test: bool) -> &mut Self {
        self.test = test;
        self
    }

    pub fn is_test(&self) -> bool {
        self.test
    }

    pub fn is_media(&self) -> bool {
        self.media
    }

    pub fn is_cdn(&self) -> bool {
        self.cdn
    }

    pub fn set_ipv6(&mut self, ipv6: bool) -> &mut Self {
        self.ipv6 = ipv6;
        self
    }

    pub fn ipv6(&self) -> bool {
        self.ipv6
    }

    /// Mark this context as used by the DNS client only
    pub fn set_is_dns(&mut self, is_dns: bool) -> &mut Self {
        self.is_dns = is_dns;
        self
    }

    pub fn is_dns(&self) -> bool {
        self.is_dns
    }

    pub fn set_uri(&mut self, uri: Url) -> &mut Self {
        self.uri = Some(Arc::new(uri));
        self
    }

    /// Parse and set the target URI
    pub fn set_uri_str(&mut self, uri: &str) -> Result<&mut Self> {
        let uri = Url::parse(uri).map_err(|e| Error::Config(format!("invalid URI {}: {}", uri, e)))?;
        Ok(self.set_uri(uri))
    }

    pub fn uri(&self) -> Option<&Url> {
        self.uri.as_deref()
    }

    pub fn set_socket_config(&mut self, config: TransportConfig) -> &mut Self {
        self.socket_config = Arc::new(config);
        self
    }

    pub fn socket_config(&self) -> &TransportConfig {
        &self.socket_config
    }

    pub fn set_cancellation_token(&mut self, token: CancellationToken) -> &mut Self {
        self.cancellation = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Set the callback invoked every time the socket reads at least a byte
    pub fn set_read_callback<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.read_callback = Some(Arc::new(callback));
        self
    }

    pub fn has_read_callback(&self) -> bool {
        self.read_callback.is_some()
    }

    pub fn read_callback(&self) -> Option<&ReadCallback> {
        self.read_callback.as_ref()
    }

    /// Push a layer on top of the stack
    pub fn add_layer(&mut self, kind: LayerKind, extra: Option<LayerExtra>) -> &mut Self {
        self.layers.push(LayerDescriptor::new(kind, extra));
        self.remaining = self.layers.len();
        self
    }

    /// Whether any layer of `kind` is part of the chain
    pub fn has_layer(&self, kind: LayerKind) -> bool {
        self.layers.iter().any(|layer| layer.kind == kind)
    }

    /// Full layer stack, innermost first
    pub fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    /// Index of the next layer to consume, `None` once exhausted
    pub fn cursor(&self) -> Option<usize> {
        self.remaining.checked_sub(1)
    }

    /// Kind of the next layer to consume
    pub fn current_layer(&self) -> Option<LayerKind> {
        self.cursor().map(|i| self.layers[i].kind)
    }

    /// Pop the descriptor at the cursor
    pub fn take_layer(&mut self) -> Result<LayerDescriptor> {
        let index = self.cursor().ok_or(Error::ChainExhausted)?;
        self.remaining = index;
        Ok(self.layers[index].clone())
    }

    /// Build and connect the next layer of the chain
    pub async fn next_layer(&mut self, prefix: Bytes) -> Result<BoxStream> {
        let descriptor = self.take_layer()?;
        let mut layer = descriptor.kind.instantiate();
        if descriptor.kind.carries_extra() {
            if let Some(extra) = &descriptor.extra {
                layer.set_extra(extra)?;
            }
        }

        debug!(
            layer = %descriptor.kind,
            remaining = self.remaining,
            prefix_len = prefix.len(),
            "connecting layer"
        );
        layer.connect(self, prefix).await
    }

    /// Proxy record of the first obfuscation layer routed through a proxy
    pub fn proxy_descriptor(&self) -> Option<ProxyDescriptor> {
        self.layers.iter().find_map(|layer| {
            if layer.kind != LayerKind::Obfuscation {
                return None;
            }
            let extra = layer.extra.as_ref()?;
            let address = extra.get("address")?.as_str()?.to_string();
            let port = match extra.get("port") {
                None => Some(crate::DEFAULT_PORT),
                Some(_) => crate::layer::extra_port(extra, "port"),
            };
            let fields = extra
                .iter()
                .filter(|(key, _)| *key != "address" && !(*key == "port" && port.is_some()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Some(ProxyDescriptor {
                tag: INPUT_CLIENT_PROXY,
                address,
                port,
                fields,
            })
        })
    }

    /// Independent copy for one connection attempt, cursor back at the top
    pub fn fork(&self) -> Self {
        let mut ctx = self.clone();
        ctx.remaining = ctx.layers.len();
        ctx
    }

    /// Copy at the current cursor, targeting another URI
    pub fn with_uri(&self, uri: Url) -> Self {
        let mut ctx = self.clone();
        ctx.uri = Some(Arc::new(uri));
        ctx
    }

    /// Assemble the whole chain on a fresh fork of this context
    pub async fn connect(&self) -> Result<BoxStream> {
        info!("Connecting to {}", self);
        let mut attempt = self.fork();
        attempt.next_layer(Bytes::new()).await
    }

    /// One-line human readable description of the connection
    pub fn describe(&self) -> String {
        let mut out = self.uri.as_ref().map(|u| u.to_string()).unwrap_or_default();
        if self.secure {
            out.push_str(" (TLS)");
        }
        out.push_str(if self.test { " test" } else { " main" });
        out.push_str(" DC ");
        if let Some(dc) = &self.dc {
            out.push_str(&dc.to_string());
        }
        out.push_str(", via ");
        out.push_str(if self.ipv6 { "ipv6" } else { "ipv4" });
        out.push_str(" using ");

        let chain: Vec<String> = self
            .layers
            .iter()
            .rev()
            .map(|layer| match layer.displayed_extra() {
                Some(extra) => format!(
                    "{} ({})",
                    layer.kind,
                    serde_json::to_string(extra).unwrap_or_default()
                ),
                None => layer.kind.to_string(),
            })
            .collect();
        out.push_str(&chain.join(" => "));
        out
    }
}

impl fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("description", &self.describe())
            .field("is_dns", &self.is_dns)
            .field("cursor", &self.cursor())
            .field("has_read_callback", &self.has_read_callback())
            .finish()
    }
}
