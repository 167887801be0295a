//! Mutual authentication handshake (AU1/AU2) and session-key
//! derivation.
//!
//! The handshake rides on dedicated topics and bypasses the safety
//! layer (there are no session keys yet). Each side contributes a pair
//! of 32-bit nonces; both then derive KS1/KS2/KS3 from the nonces and
//! the pre-shared root keys. After AU2 the OBU publishes a KEY_UPDATE
//! on the keys topic so the bridge can arm its safety layer — the only
//! plaintext key exposure, tolerated on the demonstrator's trusted LAN.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::safety::SessionKeys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoncePair {
    pub left: u32,
    pub right: u32,
}

impl NoncePair {
    pub fn fresh() -> Self {
        let mut rng = rand::thread_rng();
        Self { left: rng.gen(), right: rng.gen() }
    }
}

/// Pre-shared root key triple, configured identically on OBU and RBC.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RootKeys {
    pub k1: u64,
    pub k2: u64,
    pub k3: u64,
}

impl Default for RootKeys {
    fn default() -> Self {
        // Demonstrator defaults; overridable from configuration.
        Self { k1: 0x4554_4353_4B31_0001, k2: 0x4554_4353_4B32_0002, k3: 0x4554_4353_4B33_0003 }
    }
}

/// AU1, OBU → RBC on `obu/<RBC_ID>/handshake`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Au1 {
    #[serde(rename = "type")]
    pub kind: String,
    pub obu_id: String,
    pub rbc_id: String,
    pub nonces: NoncePair,
    pub ts: u64,
}

impl Au1 {
    pub fn new(obu_id: &str, rbc_id: &str, nonces: NoncePair, ts: u64) -> Self {
        Self { kind: "AU1".into(), obu_id: obu_id.into(), rbc_id: rbc_id.into(), nonces, ts }
    }
}

/// AU2, RBC → OBU on `rbc/<RBC_ID>/handshake`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Au2 {
    #[serde(rename = "type")]
    pub kind: String,
    pub obu_id: String,
    pub rbc_id: String,
    pub nonces: NoncePair,
    pub ts: u64,
}

impl Au2 {
    pub fn new(obu_id: &str, rbc_id: &str, nonces: NoncePair, ts: u64) -> Self {
        Self { kind: "AU2".into(), obu_id: obu_id.into(), rbc_id: rbc_id.into(), nonces, ts }
    }
}

/// KEY_UPDATE notification on `obu/<RBC_ID>/keys`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    pub ks1: u64,
    pub ks2: u64,
    pub ks3: u64,
    pub ts: u64,
}

impl KeyUpdate {
    pub fn new(keys: &SessionKeys, ts: u64) -> Self {
        Self { kind: "KEY_UPDATE".into(), ks1: keys.ks1, ks2: keys.ks2, ks3: keys.ks3, ts }
    }

    pub fn keys(&self) -> SessionKeys {
        SessionKeys::new(self.ks1, self.ks2, self.ks3)
    }
}

/// `KSi = root_i XOR fold64(SHA-256(obu_l ‖ obu_r ‖ rbc_l ‖ rbc_r ‖ i))`
/// where `fold64` takes the first eight digest bytes. Deterministic in
/// all four nonces and the root triple; both sides compute it.
pub fn derive_session_keys(root: &RootKeys, obu: &NoncePair, rbc: &NoncePair) -> SessionKeys {
    let mix = |index: u8, root_key: u64| -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(obu.left.to_be_bytes());
        hasher.update(obu.right.to_be_bytes());
        hasher.update(rbc.left.to_be_bytes());
        hasher.update(rbc.right.to_be_bytes());
        hasher.update([index]);
        let digest = hasher.finalize();
        let mut folded = [0u8; 8];
        folded.copy_from_slice(&digest[..8]);
        root_key ^ u64::from_be_bytes(folded)
    };
    SessionKeys::new(mix(1, root.k1), mix(2, root.k2), mix(3, root.k3))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OBU: NoncePair = NoncePair { left: 0xAAAA_0001, right: 0xAAAA_0002 };
    const RBC: NoncePair = NoncePair { left: 0xBBBB_0001, right: 0xBBBB_0002 };

    #[test]
    fn both_sides_derive_the_same_keys() {
        let root = RootKeys::default();
        let a = derive_session_keys(&root, &OBU, &RBC);
        let b = derive_session_keys(&root, &OBU, &RBC);
        assert_eq!((a.ks1, a.ks2, a.ks3), (b.ks1, b.ks2, b.ks3));
    }

    #[test]
    fn keys_differ_per_slot_and_per_nonce() {
        let root = RootKeys::default();
        let k = derive_session_keys(&root, &OBU, &RBC);
        assert_ne!(k.ks1, k.ks2);
        assert_ne!(k.ks2, k.ks3);

        let other = NoncePair { left: 0xBBBB_0001, right: 0xBBBB_0003 };
        let k2 = derive_session_keys(&root, &OBU, &other);
        assert_ne!(k.ks1, k2.ks1);
    }

    #[test]
    fn au_messages_serialize_with_wire_tags() {
        let au1 = Au1::new("TRAIN01", "DE0001", OBU, 1);
        let v = serde_json::to_value(&au1).unwrap();
        assert_eq!(v["type"], "AU1");
        assert_eq!(v["nonces"]["left"], 0xAAAA_0001u32);

        let ku = KeyUpdate::new(&SessionKeys::new(1, 2, 3), 9);
        let v = serde_json::to_value(&ku).unwrap();
        assert_eq!(v["type"], "KEY_UPDATE");
        assert_eq!(v["ks3"], 3);
    }
}
