//! Integration tests for stream-chain assembly
//!
//! Each test runs mock peers on local listeners and checks:
//! - outer-to-inner construction of a chain declared inner-to-outer
//! - consumption limits and fork independence
//! - proxy handshakes and the obfuscation header seen by the far side

use bytes::Bytes;
use dcchain::obfuscation::{decode_header, Secret, HEADER_LEN, INTERMEDIATE_TAG};
use dcchain::transport::{tcp_uri, TransportError};
use dcchain::{ConnectionContext, Error, LayerExtra, LayerKind};
use serde_json::json;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn extra(value: serde_json::Value) -> Option<LayerExtra> {
    value.as_object().cloned()
}

async fn listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Minimal SOCKS5 server: no auth, CONNECT only, returns the requested target
async fn accept_socks5(socket: &mut TcpStream) -> ([u8; 4], u16) {
    let mut greeting = [0u8; 3];
    socket.read_exact(&mut greeting).await.unwrap();
    assert_eq!(greeting, [5, 1, 0]);
    socket.write_all(&[5, 0]).await.unwrap();

    let mut request = [0u8; 10];
    socket.read_exact(&mut request).await.unwrap();
    assert_eq!(&request[..4], &[5, 1, 0, 1]);
    socket
        .write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 0])
        .await
        .unwrap();

    let ip = [request[4], request[5], request[6], request[7]];
    (ip, u16::from_be_bytes([request[8], request[9]]))
}

/// Obfuscation over SOCKS5 over TCP: the proxy handshake must complete
/// before the obfuscation header travels through the tunnel
#[tokio::test]
async fn test_chain_connects_outer_to_inner() {
    let (listener, addr) = listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let target = accept_socks5(&mut socket).await;

        let mut header = [0u8; HEADER_LEN];
        socket.read_exact(&mut header).await.unwrap();
        let mut peer = decode_header(&header, None);

        let mut ping = [0u8; 4];
        socket.read_exact(&mut ping).await.unwrap();
        peer.incoming.apply(&mut ping);

        let mut pong = *b"pong";
        peer.outgoing.apply(&mut pong);
        socket.write_all(&pong).await.unwrap();

        (target, peer.tag, peer.dc, ping)
    });

    let mut ctx = ConnectionContext::new();
    ctx.set_uri_str("tcp://10.20.30.40:443").unwrap();
    ctx.set_dc("2_media").unwrap();
    ctx.set_test(true);
    ctx.add_layer(LayerKind::Transport, None)
        .add_layer(
            LayerKind::Socks5,
            extra(json!({"address": "127.0.0.1", "port": addr.port()})),
        )
        .add_layer(LayerKind::Obfuscation, None);

    let mut stream = ctx.connect().await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    stream.flush().await.unwrap();

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"pong");

    let (target, tag, dc, ping) = server.await.unwrap();
    assert_eq!(target, ([10, 20, 30, 40], 443));
    assert_eq!(tag, INTERMEDIATE_TAG);
    assert_eq!(dc, -10002);
    assert_eq!(&ping, b"ping");

    // The template itself was never consumed
    assert_eq!(ctx.cursor(), Some(2));
}

/// A secure context behind a plain proxy: the proxy sees the SOCKS5 greeting
/// first and the TLS ClientHello only inside the established tunnel
#[tokio::test]
async fn test_secure_context_through_socks5() {
    let (listener, addr) = listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let target = accept_socks5(&mut socket).await;

        let mut record = [0u8; 3];
        socket.read_exact(&mut record).await.unwrap();
        (target, record)
    });

    let mut ctx = ConnectionContext::new();
    ctx.set_uri_str("tcp://10.20.30.40:443").unwrap();
    ctx.set_secure(true);
    ctx.add_layer(LayerKind::Transport, None).add_layer(
        LayerKind::Socks5,
        extra(json!({"address": "127.0.0.1", "port": addr.port()})),
    );

    // The mock proxy hangs up instead of completing TLS
    assert!(ctx.connect().await.is_err());

    let (target, record) = server.await.unwrap();
    assert_eq!(target, ([10, 20, 30, 40], 443));
    assert_eq!(record, [0x16, 0x03, 0x01]);
}

#[tokio::test]
async fn test_next_layer_stops_at_bottom() {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let mut sockets = Vec::new();
        for _ in 0..3 {
            sockets.push(listener.accept().await.unwrap().0);
        }
        sockets.len()
    });

    let mut ctx = ConnectionContext::new();
    ctx.set_uri(tcp_uri("127.0.0.1", addr.port()).unwrap());
    for _ in 0..3 {
        ctx.add_layer(LayerKind::Transport, None);
    }

    let mut streams = Vec::new();
    for expected in [Some(1), Some(0), None] {
        streams.push(ctx.next_layer(Bytes::new()).await.unwrap());
        assert_eq!(ctx.cursor(), expected);
    }
    assert!(matches!(
        ctx.next_layer(Bytes::new()).await,
        Err(Error::ChainExhausted)
    ));
    assert_eq!(server.await.unwrap(), 3);
}

#[tokio::test]
async fn test_fork_leaves_template_usable() {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let _first = listener.accept().await.unwrap();
        let _second = listener.accept().await.unwrap();
    });

    let mut template = ConnectionContext::new();
    template.set_uri(tcp_uri("127.0.0.1", addr.port()).unwrap());
    template.add_layer(LayerKind::Transport, None);

    let mut attempt = template.fork();
    let _first = attempt.next_layer(Bytes::new()).await.unwrap();
    assert!(matches!(
        attempt.next_layer(Bytes::new()).await,
        Err(Error::ChainExhausted)
    ));

    let _second = template.next_layer(Bytes::new()).await.unwrap();
    server.await.unwrap();
}

/// Obfuscation with a proxy address reaches the proxy, not the DC URI
#[tokio::test]
async fn test_obfuscated_proxy_redirect() {
    let (listener, addr) = listener().await;
    let secret_hex = "dd0123456789abcdef0123456789abcdef";

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut header = [0u8; HEADER_LEN];
        socket.read_exact(&mut header).await.unwrap();
        let secret = Secret::from_hex(secret_hex).unwrap();
        let peer = decode_header(&header, Some(&secret));
        (peer.tag, peer.dc)
    });

    let mut ctx = ConnectionContext::new();
    // Documentation range, never contacted
    ctx.set_uri_str("tcp://192.0.2.1:443").unwrap();
    ctx.set_dc("4").unwrap();
    ctx.add_layer(LayerKind::Transport, None).add_layer(
        LayerKind::Obfuscation,
        extra(json!({"address": "127.0.0.1", "port": addr.port(), "secret": secret_hex})),
    );

    let descriptor = ctx.proxy_descriptor().unwrap();
    assert_eq!(descriptor.address, "127.0.0.1");
    assert_eq!(descriptor.port, Some(addr.port()));

    let _stream = ctx.next_layer(Bytes::from_static(&[0xef])).await.unwrap();
    let (tag, dc) = server.await.unwrap();
    assert_eq!(tag, [0xef; 4]);
    assert_eq!(dc, 4);
}

#[tokio::test]
async fn test_http_proxy_then_prefix() {
    let (listener, addr) = listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(socket.read_u8().await.unwrap());
        }
        socket
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();

        let mut prefix = [0u8; 2];
        socket.read_exact(&mut prefix).await.unwrap();
        (String::from_utf8(head).unwrap(), prefix)
    });

    let mut ctx = ConnectionContext::new();
    ctx.set_uri_str("tcp://dc.example:8443").unwrap();
    ctx.add_layer(LayerKind::Transport, None).add_layer(
        LayerKind::HttpProxy,
        extra(json!({"address": "127.0.0.1", "port": addr.port(), "username": "a", "password": "b"})),
    );

    let _stream = ctx.next_layer(Bytes::from_static(b"hi")).await.unwrap();
    let (head, prefix) = server.await.unwrap();
    assert!(head.starts_with("CONNECT dc.example:8443 HTTP/1.1\r\n"));
    assert!(head.contains("Proxy-Authorization: Basic YTpi\r\n"));
    assert_eq!(&prefix, b"hi");
}

#[tokio::test]
async fn test_cancelled_attempt() {
    let (_listener, addr) = listener().await;
    let token = CancellationToken::new();

    let mut ctx = ConnectionContext::new();
    ctx.set_uri(tcp_uri("127.0.0.1", addr.port()).unwrap())
        .set_cancellation_token(token.clone())
        .add_layer(LayerKind::Transport, None)
        .add_layer(LayerKind::Obfuscation, None);

    token.cancel();
    let result = ctx.connect().await;
    assert!(matches!(
        result,
        Err(Error::Transport(TransportError::Cancelled))
    ));
}

#[tokio::test]
async fn test_refused_connection_propagates() {
    // Bind then drop to get a port nothing listens on
    let (listener, addr) = listener().await;
    drop(listener);

    let mut ctx = ConnectionContext::new();
    ctx.set_uri(tcp_uri("127.0.0.1", addr.port()).unwrap())
        .add_layer(LayerKind::Transport, None)
        .add_layer(LayerKind::Obfuscation, None);

    let result = ctx.connect().await;
    assert!(matches!(result, Err(Error::Transport(TransportError::Io(_)))));
}

#[tokio::test]
async fn test_decorator_without_inner_layer() {
    let mut ctx = ConnectionContext::new();
    ctx.set_uri_str("tcp://127.0.0.1:1").unwrap();
    ctx.add_layer(LayerKind::Obfuscation, None);

    assert!(matches!(ctx.connect().await, Err(Error::ChainExhausted)));
}

#[tokio::test]
async fn test_proxy_layer_without_parameters() {
    let mut ctx = ConnectionContext::new();
    ctx.set_uri_str("tcp://127.0.0.1:1").unwrap();
    ctx.add_layer(LayerKind::Transport, None)
        .add_layer(LayerKind::Socks5, None);

    assert!(matches!(ctx.connect().await, Err(Error::InvalidExtra(_))));
}
