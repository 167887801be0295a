//! Safety encapsulation layer.
//!
//! Every ETCS message crosses the logical RBC↔OBU pipe as
//! `hdr(1) || payload || mac(4) || crc(2)`. The MAC is the last four
//! bytes of AES-128-CBC over the zero-padded payload with IV=0 under
//! the per-NID session key; the CRC-16/CCITT-FALSE trailer covers
//! header, payload and MAC. Demonstrator-grade, not true CMAC — both
//! ends must reproduce this exact construction.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crc::crc16_ccitt;
use crate::error::SafetyError;
use crate::message::nid;

pub const MAC_LEN: usize = 4;
pub const CRC_LEN: usize = 2;
pub const MIN_PDU_LEN: usize = 1 + MAC_LEN + CRC_LEN;

const DEFAULT_ETY: u8 = 0;
const DEFAULT_MTI: u8 = 5;

/// Direction bit of the safety header: 1 = OBU→RBC, 0 = RBC→OBU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToRbc,
    ToObu,
}

impl Direction {
    fn bit(self) -> u8 {
        match self {
            Direction::ToRbc => 1,
            Direction::ToObu => 0,
        }
    }
}

/// Header bit layout MSB-to-LSB: `[ETY:3][MTI:4][DIR:1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyHeader {
    pub ety: u8,
    pub mti: u8,
    pub dir: u8,
}

impl SafetyHeader {
    pub fn new(dir: Direction) -> Self {
        Self { ety: DEFAULT_ETY, mti: DEFAULT_MTI, dir: dir.bit() }
    }

    pub fn to_byte(self) -> u8 {
        (self.ety << 5) | ((self.mti & 0x0F) << 1) | (self.dir & 1)
    }

    pub fn from_byte(b: u8) -> Self {
        Self { ety: b >> 5, mti: (b >> 1) & 0x0F, dir: b & 1 }
    }
}

/// The three session secrets derived at handshake. Held for the
/// lifetime of one session and wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub ks1: u64,
    pub ks2: u64,
    pub ks3: u64,
}

impl SessionKeys {
    pub fn new(ks1: u64, ks2: u64, ks3: u64) -> Self {
        Self { ks1, ks2, ks3 }
    }

    /// Per-message-type key selection: 132→KS2, 136→KS3, default KS1.
    fn select(&self, nid_message: u8) -> u64 {
        match nid_message {
            nid::MA_REQUEST => self.ks2,
            nid::POSITION_REPORT => self.ks3,
            _ => self.ks1,
        }
    }

    /// 64→128 bit expansion by self-concatenation.
    fn expand(key: u64) -> [u8; 16] {
        let half = key.to_be_bytes();
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&half);
        out[8..].copy_from_slice(&half);
        out
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Wrap/unwrap engine. Owned by whichever process terminates the
/// safety layer (the bridges here); passed explicitly, never global.
#[derive(Default)]
pub struct SafetyLayer {
    keys: Option<SessionKeys>,
}

impl SafetyLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_keys(&mut self, keys: SessionKeys) {
        self.keys = Some(keys);
    }

    pub fn clear_keys(&mut self) {
        if let Some(mut k) = self.keys.take() {
            k.zeroize();
        }
    }

    pub fn has_keys(&self) -> bool {
        self.keys.is_some()
    }

    /// `hdr || payload || mac || crc` for an already bit-packed payload.
    /// `payload[0]` must be the NID_MESSAGE — it selects the key.
    pub fn wrap(&self, payload: &[u8], dir: Direction) -> Result<Vec<u8>, SafetyError> {
        let keys = self.keys.as_ref().ok_or(SafetyError::NoKeys)?;
        let nid_message = *payload.first().ok_or(SafetyError::TooShort { len: 0 })?;
        let hdr = SafetyHeader::new(dir).to_byte();

        let mac = cbc_mac(&SessionKeys::expand(keys.select(nid_message)), payload);

        let mut pdu = Vec::with_capacity(1 + payload.len() + MAC_LEN + CRC_LEN);
        pdu.push(hdr);
        pdu.extend_from_slice(payload);
        pdu.extend_from_slice(&mac);
        let crc = crc16_ccitt(&pdu);
        pdu.extend_from_slice(&crc.to_be_bytes());
        Ok(pdu)
    }

    /// Verify CRC then MAC, returning the header and the raw payload.
    pub fn unwrap(&self, pdu: &[u8]) -> Result<(SafetyHeader, Vec<u8>), SafetyError> {
        if pdu.len() < MIN_PDU_LEN {
            return Err(SafetyError::TooShort { len: pdu.len() });
        }
        let (body, crc_bytes) = pdu.split_at(pdu.len() - CRC_LEN);
        let expected = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);
        let got = crc16_ccitt(body);
        if got != expected {
            return Err(SafetyError::CrcMismatch { expected, got });
        }

        let hdr = SafetyHeader::from_byte(body[0]);
        let (payload, mac) = body[1..].split_at(body.len() - 1 - MAC_LEN);
        let nid_message =
            *payload.first().ok_or(SafetyError::TooShort { len: pdu.len() })?;

        let keys = self.keys.as_ref().ok_or(SafetyError::NoKeys)?;
        let recomputed = cbc_mac(&SessionKeys::expand(keys.select(nid_message)), payload);
        if recomputed != mac {
            return Err(SafetyError::MacMismatch { nid: nid_message });
        }
        Ok((hdr, payload.to_vec()))
    }
}

/// Last four bytes of AES-128-CBC over the zero-padded input, IV=0.
fn cbc_mac(key: &[u8; 16], data: &[u8]) -> [u8; MAC_LEN] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut prev = [0u8; 16];
    let blocks = data.len().div_ceil(16).max(1);
    for i in 0..blocks {
        let mut block = [0u8; 16];
        let start = i * 16;
        if start < data.len() {
            let end = (start + 16).min(data.len());
            block[..end - start].copy_from_slice(&data[start..end]);
        }
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        let mut ga = GenericArray::clone_from_slice(&block);
        cipher.encrypt_block(&mut ga);
        prev.copy_from_slice(&ga);
    }
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&prev[16 - MAC_LEN..]);
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed() -> SafetyLayer {
        let mut layer = SafetyLayer::new();
        layer.set_keys(SessionKeys::new(0x1111_2222_3333_4444, 0x5555_6666_7777_8888, 0x9999_AAAA_BBBB_CCCC));
        layer
    }

    #[test]
    fn header_bit_layout() {
        let h = SafetyHeader::new(Direction::ToRbc);
        assert_eq!(h.to_byte(), 0b0000_1011);
        assert_eq!(SafetyHeader::from_byte(0b0000_1011), h);
        assert_eq!(SafetyHeader::new(Direction::ToObu).to_byte(), 0b0000_1010);
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let layer = keyed();
        let payload = vec![136u8, 0x01, 0x02, 0x03, 0x04, 0x05];
        let pdu = layer.wrap(&payload, Direction::ToRbc).unwrap();
        assert_eq!(pdu.len(), 1 + payload.len() + MAC_LEN + CRC_LEN);
        let (hdr, out) = layer.unwrap(&pdu).unwrap();
        assert_eq!(hdr.dir, 1);
        assert_eq!(hdr.mti, 5);
        assert_eq!(out, payload);
    }

    #[test]
    fn every_single_bit_flip_is_caught() {
        let layer = keyed();
        let pdu = layer.wrap(&[132u8, 0xAB, 0xCD], Direction::ToObu).unwrap();
        for byte in 0..pdu.len() {
            for bit in 0..8 {
                let mut tampered = pdu.clone();
                tampered[byte] ^= 1 << bit;
                let err = layer.unwrap(&tampered).unwrap_err();
                assert!(
                    matches!(err, SafetyError::CrcMismatch { .. } | SafetyError::MacMismatch { .. }),
                    "byte {byte} bit {bit}: unexpected {err:?}"
                );
            }
        }
    }

    #[test]
    fn key_selection_by_nid() {
        let layer = keyed();
        // Same payload bytes except the NID: different key, different MAC.
        let a = layer.wrap(&[132u8, 0x00], Direction::ToRbc).unwrap();
        let b = layer.wrap(&[136u8, 0x00], Direction::ToRbc).unwrap();
        assert_ne!(a[2..6], b[2..6]);
    }

    #[test]
    fn no_keys_refuses_both_ways() {
        let layer = SafetyLayer::new();
        assert_eq!(layer.wrap(&[3u8], Direction::ToRbc).unwrap_err(), SafetyError::NoKeys);
        let keyed_pdu = keyed().wrap(&[3u8, 1, 2], Direction::ToRbc).unwrap();
        assert_eq!(layer.unwrap(&keyed_pdu).unwrap_err(), SafetyError::NoKeys);
    }

    #[test]
    fn cleared_keys_behave_like_absent() {
        let mut layer = keyed();
        let pdu = layer.wrap(&[8u8, 9], Direction::ToObu).unwrap();
        layer.clear_keys();
        assert!(!layer.has_keys());
        assert_eq!(layer.unwrap(&pdu).unwrap_err(), SafetyError::NoKeys);
    }

    #[test]
    fn short_pdu_rejected() {
        let layer = keyed();
        assert_eq!(layer.unwrap(&[0u8; 6]).unwrap_err(), SafetyError::TooShort { len: 6 });
    }

    #[test]
    fn empty_payload_pdu_fails_instead_of_panicking() {
        // Seven bytes with a valid CRC but nothing between header and
        // MAC: there is no NID to select a key with.
        let layer = keyed();
        let mut pdu = vec![0x0B, 0, 0, 0, 0];
        let crc = crc16_ccitt(&pdu);
        pdu.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(layer.unwrap(&pdu).unwrap_err(), SafetyError::TooShort { len: 7 });
    }
}
