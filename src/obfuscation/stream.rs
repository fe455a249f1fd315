//! Init header and masking stream

use super::keystream::{Keystream, IV_LEN, KEY_LEN};
use super::{random_bytes, ObfuscationError, Secret};
use crate::transport::BoxStream;
use bytes::{Buf, BytesMut};
use ring::digest::{Context as Digest, SHA256};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Length of the init header
pub const HEADER_LEN: usize = 64;

const TAG_OFFSET: usize = 56;
const DC_OFFSET: usize = 60;
const KEY_MATERIAL: std::ops::Range<usize> = 8..56;

/// First words the header must never start with, so the stream cannot be
/// mistaken for plain HTTP, TLS or an unobfuscated transport
const FORBIDDEN_PREFIXES: [[u8; 4]; 7] = [
    *b"HEAD",
    *b"POST",
    *b"GET ",
    *b"OPTI",
    [0xee, 0xee, 0xee, 0xee],
    [0xdd, 0xdd, 0xdd, 0xdd],
    [0x16, 0x03, 0x01, 0x02],
];

fn acceptable(header: &[u8; HEADER_LEN]) -> bool {
    header[0] != 0xef
        && !FORBIDDEN_PREFIXES.iter().any(|p| header[..4] == p[..])
        && header[4..8] != [0u8; 4]
}

fn keystream(material: &[u8], secret: Option<&Secret>) -> Keystream {
    let mut key = [0u8; KEY_LEN];
    match secret {
        Some(secret) => {
            let mut digest = Digest::new(&SHA256);
            digest.update(&material[..KEY_LEN]);
            digest.update(secret.as_bytes());
            key.copy_from_slice(digest.finish().as_ref());
        }
        None => key.copy_from_slice(&material[..KEY_LEN]),
    }
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&material[KEY_LEN..KEY_LEN + IV_LEN]);
    Keystream::new(key, iv)
}

/// Keystreams of both directions, seen from the connecting side
fn derive(header: &[u8; HEADER_LEN], secret: Option<&Secret>) -> (Keystream, Keystream) {
    let forward = &header[KEY_MATERIAL];
    let reversed: Vec<u8> = forward.iter().rev().copied().collect();
    (keystream(forward, secret), keystream(&reversed, secret))
}

/// Build an init header carrying `tag` and `dc`
///
/// Returns the header to send followed by the outgoing and incoming
/// keystreams. The outgoing keystream has already consumed the header.
pub fn build_header(
    tag: [u8; 4],
    dc: i16,
    secret: Option<&Secret>,
) -> Result<([u8; HEADER_LEN], Keystream, Keystream), ObfuscationError> {
    let mut header = [0u8; HEADER_LEN];
    loop {
        random_bytes(&mut header)?;
        if acceptable(&header) {
            break;
        }
    }
    header[TAG_OFFSET..DC_OFFSET].copy_from_slice(&tag);
    header[DC_OFFSET..DC_OFFSET + 2].copy_from_slice(&dc.to_le_bytes());

    let (mut encrypt, decrypt) = derive(&header, secret);
    let mut masked = header;
    encrypt.apply(&mut masked);
    header[TAG_OFFSET..].copy_from_slice(&masked[TAG_OFFSET..]);

    Ok((header, encrypt, decrypt))
}

/// Header contents as recovered by the receiving side
pub struct DecodedHeader {
    pub tag: [u8; 4],
    pub dc: i16,
    /// Unmasks what the connecting side sends
    pub incoming: Keystream,
    /// Masks what is sent back to the connecting side
    pub outgoing: Keystream,
}

/// Recover tag, DC and keystreams from a received header
pub fn decode_header(header: &[u8; HEADER_LEN], secret: Option<&Secret>) -> DecodedHeader {
    let (mut incoming, outgoing) = derive(header, secret);
    let mut plain = *header;
    incoming.apply(&mut plain);

    let mut tag = [0u8; 4];
    tag.copy_from_slice(&plain[TAG_OFFSET..DC_OFFSET]);
    let dc = i16::from_le_bytes([plain[DC_OFFSET], plain[DC_OFFSET + 1]]);

    DecodedHeader {
        tag,
        dc,
        incoming,
        outgoing,
    }
}

/// Stream masking everything written and unmasking everything read
pub struct ObfuscatedStream {
    inner: BoxStream,
    encrypt: Keystream,
    decrypt: Keystream,
    /// Masked bytes accepted from the caller but not yet written
    pending: BytesMut,
}

impl ObfuscatedStream {
    pub fn new(inner: BoxStream, encrypt: Keystream, decrypt: Keystream) -> Self {
        Self {
            inner,
            encrypt,
            decrypt,
            pending: BytesMut::new(),
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for ObfuscatedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.decrypt.apply(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ObfuscatedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        this.pending.extend_from_slice(buf);
        this.encrypt.apply(&mut this.pending);

        // The bytes are accepted either way; a pending inner write is
        // finished by the next write or flush
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
