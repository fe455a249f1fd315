//! SHA-256 counter-mode keystream
//!
//! Block `i` is `SHA-256(key || iv || i as u64 little-endian)`. The stream
//! only disguises traffic; confidentiality is left to the protocol on top.

use ring::digest::{Context, SHA256};

/// Key length in bytes
pub const KEY_LEN: usize = 32;

/// IV length in bytes
pub const IV_LEN: usize = 16;

const BLOCK_LEN: usize = 32;

/// Stateful XOR keystream
#[derive(Clone)]
pub struct Keystream {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
    counter: u64,
    block: [u8; BLOCK_LEN],
    offset: usize,
}

impl Keystream {
    pub fn new(key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self {
            key,
            iv,
            counter: 0,
            block: [0u8; BLOCK_LEN],
            // Forces the first block to be generated on use
            offset: BLOCK_LEN,
        }
    }

    fn refill(&mut self) {
        let mut ctx = Context::new(&SHA256);
        ctx.update(&self.key);
        ctx.update(&self.iv);
        ctx.update(&self.counter.to_le_bytes());
        self.block.copy_from_slice(ctx.finish().as_ref());
        self.counter += 1;
        self.offset = 0;
    }

    /// XOR the next `data.len()` keystream bytes into `data`
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            if self.offset == BLOCK_LEN {
                self.refill();
            }
            *byte ^= self.block[self.offset];
            self.offset += 1;
        }
    }
}
