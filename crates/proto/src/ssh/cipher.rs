//! Cipher and MAC registries for the transport layer.
//!
//! The transport negotiates algorithm *names*; this module maps names to
//! key/IV geometry and to live cipher and MAC state. A cipher name is only
//! negotiable when it has an entry in [`cipher_modes`].

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use sha1::Sha1;
use sha2::Sha256;
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::HashMap;
use subtle::ConstantTimeEq;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes192Ctr = ctr::Ctr128BE<aes::Aes192>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Preferred cipher order when the configuration does not override it.
pub const DEFAULT_CIPHER_ORDER: &[&str] = &["aes128-ctr", "aes192-ctr", "aes256-ctr"];

/// Preferred MAC order when the configuration does not override it.
pub const DEFAULT_MAC_ORDER: &[&str] = &["hmac-sha2-256", "hmac-sha1", "hmac-sha1-96"];

/// Key and IV geometry for a negotiable cipher.
#[derive(Debug, Clone, Copy)]
pub struct CipherMode {
    /// Encryption key length in bytes.
    pub key_size: usize,
    /// IV length in bytes.
    pub iv_size: usize,
    /// Block size used for packet padding alignment.
    pub block_size: usize,
}

/// The cipher-mode table. Negotiation rejects any cipher name that has no
/// entry here, whatever the peer advertises.
pub fn cipher_modes() -> &'static HashMap<&'static str, CipherMode> {
    static MODES: Lazy<HashMap<&'static str, CipherMode>> = Lazy::new(|| {
        let mut m = HashMap::new();
        m.insert(
            "aes128-ctr",
            CipherMode {
                key_size: 16,
                iv_size: 16,
                block_size: 16,
            },
        );
        m.insert(
            "aes192-ctr",
            CipherMode {
                key_size: 24,
                iv_size: 16,
                block_size: 16,
            },
        );
        m.insert(
            "aes256-ctr",
            CipherMode {
                key_size: 32,
                iv_size: 16,
                block_size: 16,
            },
        );
        m
    });
    &MODES
}

/// Live stream-cipher state for one transport direction.
pub enum CipherState {
    /// aes128-ctr
    Aes128(Box<Aes128Ctr>),
    /// aes192-ctr
    Aes192(Box<Aes192Ctr>),
    /// aes256-ctr
    Aes256(Box<Aes256Ctr>),
}

impl CipherState {
    /// Instantiates the named cipher with the derived key and IV.
    pub fn new(algo: &str, key: &[u8], iv: &[u8]) -> SkiffResult<Self> {
        let mode = cipher_modes()
            .get(algo)
            .ok_or_else(|| SkiffError::Config(format!("no cipher mode for '{}'", algo)))?;
        if key.len() < mode.key_size || iv.len() < mode.iv_size {
            return Err(SkiffError::Security(format!(
                "insufficient key material for '{}'",
                algo
            )));
        }
        let key = &key[..mode.key_size];
        let iv = &iv[..mode.iv_size];

        let state = match algo {
            "aes128-ctr" => CipherState::Aes128(Box::new(
                Aes128Ctr::new_from_slices(key, iv)
                    .map_err(|_| SkiffError::Security("bad aes128-ctr key/iv".to_string()))?,
            )),
            "aes192-ctr" => CipherState::Aes192(Box::new(
                Aes192Ctr::new_from_slices(key, iv)
                    .map_err(|_| SkiffError::Security("bad aes192-ctr key/iv".to_string()))?,
            )),
            "aes256-ctr" => CipherState::Aes256(Box::new(
                Aes256Ctr::new_from_slices(key, iv)
                    .map_err(|_| SkiffError::Security("bad aes256-ctr key/iv".to_string()))?,
            )),
            _ => {
                return Err(SkiffError::Config(format!(
                    "no cipher implementation for '{}'",
                    algo
                )))
            }
        };
        Ok(state)
    }

    /// Applies the keystream in place. CTR mode is symmetric, so the same
    /// call encrypts and decrypts.
    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            CipherState::Aes128(c) => c.apply_keystream(data),
            CipherState::Aes192(c) => c.apply_keystream(data),
            CipherState::Aes256(c) => c.apply_keystream(data),
        }
    }

    /// Padding alignment for the active cipher.
    pub fn block_size(&self) -> usize {
        16
    }
}

/// MAC algorithms keyed by negotiated name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgo {
    /// hmac-sha1
    HmacSha1,
    /// hmac-sha1-96: hmac-sha1 truncated to 96 bits
    HmacSha196,
    /// hmac-sha2-256
    HmacSha256,
}

impl MacAlgo {
    /// Maps a negotiated name to the algorithm.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(MacAlgo::HmacSha1),
            "hmac-sha1-96" => Some(MacAlgo::HmacSha196),
            "hmac-sha2-256" => Some(MacAlgo::HmacSha256),
            _ => None,
        }
    }

    /// MAC key length in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgo::HmacSha1 | MacAlgo::HmacSha196 => 20,
            MacAlgo::HmacSha256 => 32,
        }
    }

    /// Tag length on the wire in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgo::HmacSha1 => 20,
            MacAlgo::HmacSha196 => 12,
            MacAlgo::HmacSha256 => 32,
        }
    }
}

/// Keyed MAC state for one transport direction.
pub struct MacKey {
    algo: MacAlgo,
    key: Vec<u8>,
}

impl MacKey {
    /// Creates MAC state for the named algorithm from derived key material.
    pub fn new(name: &str, key_material: &[u8]) -> SkiffResult<Self> {
        let algo = MacAlgo::from_name(name)
            .ok_or_else(|| SkiffError::Config(format!("no MAC implementation for '{}'", name)))?;
        if key_material.len() < algo.key_size() {
            return Err(SkiffError::Security(format!(
                "insufficient MAC key material for '{}'",
                name
            )));
        }
        Ok(Self {
            algo,
            key: key_material[..algo.key_size()].to_vec(),
        })
    }

    /// Tag length on the wire.
    pub fn mac_size(&self) -> usize {
        self.algo.mac_size()
    }

    /// Computes the tag over one packet: the 32-bit sequence number followed
    /// by the unencrypted packet bytes (RFC 4253 Section 6.4).
    pub fn sign(&self, sequence: u32, packet: &[u8]) -> Vec<u8> {
        let mut tag = match self.algo {
            MacAlgo::HmacSha1 | MacAlgo::HmacSha196 => {
                let mut mac =
                    Hmac::<Sha1>::new_from_slice(&self.key).expect("HMAC accepts any key length");
                mac.update(&sequence.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgo::HmacSha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(&self.key).expect("HMAC accepts any key length");
                mac.update(&sequence.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
        };
        tag.truncate(self.algo.mac_size());
        tag
    }

    /// Verifies a received tag in constant time.
    pub fn verify(&self, sequence: u32, packet: &[u8], received: &[u8]) -> SkiffResult<()> {
        let computed = self.sign(sequence, packet);
        if computed.len() == received.len() && bool::from(computed.ct_eq(received)) {
            Ok(())
        } else {
            Err(SkiffError::Security("MAC verification failed".to_string()))
        }
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_mode_table() {
        let modes = cipher_modes();
        assert_eq!(modes["aes128-ctr"].key_size, 16);
        assert_eq!(modes["aes256-ctr"].key_size, 32);
        assert!(!modes.contains_key("arcfour"));
    }

    #[test]
    fn test_ctr_is_symmetric() {
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let mut enc = CipherState::new("aes128-ctr", &key, &iv).unwrap();
        let mut dec = CipherState::new("aes128-ctr", &key, &iv).unwrap();

        let mut data = b"twelve bytes".to_vec();
        enc.apply(&mut data);
        assert_ne!(&data, b"twelve bytes");
        dec.apply(&mut data);
        assert_eq!(&data, b"twelve bytes");
    }

    #[test]
    fn test_cipher_rejects_short_key() {
        assert!(CipherState::new("aes256-ctr", &[0u8; 16], &[0u8; 16]).is_err());
    }

    #[test]
    fn test_mac_sign_and_verify() {
        let mac = MacKey::new("hmac-sha2-256", &[3u8; 32]).unwrap();
        let tag = mac.sign(5, b"packet bytes");
        assert_eq!(tag.len(), 32);
        assert!(mac.verify(5, b"packet bytes", &tag).is_ok());
        assert!(mac.verify(6, b"packet bytes", &tag).is_err());
        assert!(mac.verify(5, b"other bytes", &tag).is_err());
    }

    #[test]
    fn test_mac_sha1_96_truncates() {
        let mac = MacKey::new("hmac-sha1-96", &[1u8; 20]).unwrap();
        let tag = mac.sign(0, b"x");
        assert_eq!(tag.len(), 12);

        let full = MacKey::new("hmac-sha1", &[1u8; 20]).unwrap();
        let full_tag = full.sign(0, b"x");
        assert_eq!(&full_tag[..12], &tag[..]);
    }

    #[test]
    fn test_unknown_names_rejected() {
        assert!(CipherState::new("rot13", &[0u8; 32], &[0u8; 16]).is_err());
        assert!(MacKey::new("crc32", &[0u8; 32]).is_err());
    }
}
