//! AES-128 / AES-CMAC primitives used by LoRaWAN 1.0 frames.
//!
//! Data frames are authenticated with `aes128_cmac(NwkSKey, B0 | msg)` and
//! their FRMPayload is encrypted by XOR-ing with a keystream of AES blocks
//! `A_i`. Join requests are authenticated with the AppKey over the raw
//! message.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use cmac::{Cmac, Mac};

use crate::types::{AesKey, DevAddr};

/// Link direction, as encoded in the B0 and A_i blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up = 0,
    Down = 1,
}

/// Encrypts a single 16-byte block.
pub fn aes128_encrypt(key: &AesKey, block: [u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(&key.0));
    let mut buf = GenericArray::clone_from_slice(&block);
    cipher.encrypt_block(&mut buf);
    let mut out = [0u8; 16];
    out.copy_from_slice(&buf);
    out
}

/// Full 16-byte AES-CMAC tag over `data`.
pub fn aes128_cmac(key: &AesKey, data: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(&key.0));
    mac.update(data);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; 16];
    out.copy_from_slice(&tag);
    out
}

fn counter_block(
    prefix: u8,
    dir: Direction,
    dev_addr: DevAddr,
    fcnt: u32,
    last: u8,
) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0] = prefix;
    block[5] = dir as u8;
    let mut addr = dev_addr.0;
    addr.reverse();
    block[6..10].copy_from_slice(&addr);
    block[10..14].copy_from_slice(&fcnt.to_le_bytes());
    block[15] = last;
    block
}

/// MIC of a data frame. `msg` is `MHDR | FHDR | FPort | FRMPayload`; B0
/// carries its length in a single byte.
pub fn data_mic(
    key: &AesKey,
    dir: Direction,
    dev_addr: DevAddr,
    fcnt: u32,
    msg: &[u8],
) -> [u8; 4] {
    #[allow(clippy::cast_possible_truncation)]
    let b0 = counter_block(0x49, dir, dev_addr, fcnt, msg.len() as u8);
    let mut input = Vec::with_capacity(16 + msg.len());
    input.extend_from_slice(&b0);
    input.extend_from_slice(msg);
    let tag = aes128_cmac(key, &input);
    [tag[0], tag[1], tag[2], tag[3]]
}

/// MIC of a join request. `msg` is `MHDR | AppEUI | DevEUI | DevNonce`.
pub fn join_mic(app_key: &AesKey, msg: &[u8]) -> [u8; 4] {
    let tag = aes128_cmac(app_key, msg);
    [tag[0], tag[1], tag[2], tag[3]]
}

/// Encrypts (or, identically, decrypts) an FRMPayload.
pub fn encrypt_frm_payload(
    key: &AesKey,
    dir: Direction,
    dev_addr: DevAddr,
    fcnt: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    for (i, chunk) in payload.chunks(16).enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let a = counter_block(0x01, dir, dev_addr, fcnt, (i + 1) as u8);
        let s = aes128_encrypt(key, a);
        out.extend(chunk.iter().zip(s.iter()).map(|(p, k)| p ^ k));
    }
    out
}
