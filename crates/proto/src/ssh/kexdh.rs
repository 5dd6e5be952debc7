//! Key-exchange methods: Diffie-Hellman groups 1/14 (RFC 4253) and ECDH on
//! the NIST curves (RFC 5656), plus session-hash computation and the
//! RFC 4253 Section 7.2 key-material expansion.
//!
//! Both DH and ECDH use message numbers 30/31 for their init/reply pair;
//! which layout applies is fixed by the negotiated KEX algorithm.

use bytes::BytesMut;
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha384, Sha512};
use skiff_platform::{SkiffError, SkiffResult};
use zeroize::Zeroize;

use crate::ssh::kex::HandshakeMagics;
use crate::ssh::message::{expect_type, MessageType};
use crate::ssh::pubkey::EcdsaCurve;
use crate::ssh::wire;

/// diffie-hellman-group1-sha1 (Oakley Group 2, RFC 2409)
pub const KEX_ALGO_DH1_SHA1: &str = "diffie-hellman-group1-sha1";
/// diffie-hellman-group14-sha1 (Oakley Group 14, RFC 3526)
pub const KEX_ALGO_DH14_SHA1: &str = "diffie-hellman-group14-sha1";
/// ecdh-sha2-nistp256 (RFC 5656)
pub const KEX_ALGO_ECDH256: &str = "ecdh-sha2-nistp256";
/// ecdh-sha2-nistp384 (RFC 5656)
pub const KEX_ALGO_ECDH384: &str = "ecdh-sha2-nistp384";
/// ecdh-sha2-nistp521 (RFC 5656)
pub const KEX_ALGO_ECDH521: &str = "ecdh-sha2-nistp521";

/// Preferred key-exchange order when the configuration does not override
/// it: the ECDH curves, then the classic groups.
pub const DEFAULT_KEY_EXCHANGE_ORDER: &[&str] = &[
    KEX_ALGO_ECDH256,
    KEX_ALGO_ECDH384,
    KEX_ALGO_ECDH521,
    KEX_ALGO_DH14_SHA1,
    KEX_ALGO_DH1_SHA1,
];

/// Hash function identifiers used by KEX and signature verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlg {
    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlg::Sha1 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
        }
    }

    /// Hashes the concatenation of `chunks`.
    pub fn hash(&self, chunks: &[&[u8]]) -> Vec<u8> {
        match self {
            HashAlg::Sha1 => {
                let mut h = Sha1::new();
                for c in chunks {
                    h.update(c);
                }
                h.finalize().to_vec()
            }
            HashAlg::Sha256 => {
                let mut h = Sha256::new();
                for c in chunks {
                    h.update(c);
                }
                h.finalize().to_vec()
            }
            HashAlg::Sha384 => {
                let mut h = Sha384::new();
                for c in chunks {
                    h.update(c);
                }
                h.finalize().to_vec()
            }
            HashAlg::Sha512 => {
                let mut h = Sha512::new();
                for c in chunks {
                    h.update(c);
                }
                h.finalize().to_vec()
            }
        }
    }
}

/// The hash function bound to a KEX algorithm name: SHA-1 for the classic DH
/// groups, the curve hash for ECDH.
pub fn kex_hash_alg(kex_algo: &str) -> Option<HashAlg> {
    match kex_algo {
        KEX_ALGO_DH1_SHA1 | KEX_ALGO_DH14_SHA1 => Some(HashAlg::Sha1),
        KEX_ALGO_ECDH256 => Some(HashAlg::Sha256),
        KEX_ALGO_ECDH384 => Some(HashAlg::Sha384),
        KEX_ALGO_ECDH521 => Some(HashAlg::Sha512),
        _ => None,
    }
}

/// A multiplicative group for Diffie-Hellman key agreement.
pub struct DhGroup {
    /// Generator.
    pub g: BigUint,
    /// Prime modulus.
    pub p: BigUint,
}

impl DhGroup {
    /// Computes `their_public ^ my_private mod p` after checking that the
    /// peer value lies in (0, p).
    pub fn diffie_hellman(
        &self,
        their_public: &BigUint,
        my_private: &BigUint,
    ) -> SkiffResult<BigUint> {
        if *their_public == BigUint::from(0u32) || *their_public >= self.p {
            return Err(SkiffError::KexParameterOutOfBounds(
                "DH peer public value outside (0, p)".to_string(),
            ));
        }
        Ok(their_public.modpow(my_private, &self.p))
    }
}

/// diffie-hellman-group1-sha1: Oakley Group 2 (RFC 2409), 1024 bits.
pub fn dh_group1() -> &'static DhGroup {
    static GROUP: Lazy<DhGroup> = Lazy::new(|| DhGroup {
        g: BigUint::from(2u32),
        p: BigUint::from_bytes_be(
            &hex::decode(
                "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
                 020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
                 4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                 EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF",
            )
            .expect("group constant is valid hex"),
        ),
    });
    &GROUP
}

/// diffie-hellman-group14-sha1: Oakley Group 14 (RFC 3526), 2048 bits.
pub fn dh_group14() -> &'static DhGroup {
    static GROUP: Lazy<DhGroup> = Lazy::new(|| DhGroup {
        g: BigUint::from(2u32),
        p: BigUint::from_bytes_be(
            &hex::decode(
                "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
                 020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
                 4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                 EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
                 98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
                 9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
                 E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
                 3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF",
            )
            .expect("group constant is valid hex"),
        ),
    });
    &GROUP
}

/// Client-side ephemeral state for a classic DH exchange.
pub struct DhExchange {
    group: &'static DhGroup,
    private: Vec<u8>,
    /// Public value X = g^x mod p.
    pub public: BigUint,
}

impl DhExchange {
    /// Picks a random secret in [1, p) and computes the public value.
    pub fn new(group: &'static DhGroup, rng: &mut dyn RngCore) -> Self {
        let x = rng.gen_biguint_range(&BigUint::from(1u32), &group.p);
        let public = group.g.modpow(&x, &group.p);
        Self {
            group,
            private: x.to_bytes_be(),
            public,
        }
    }

    /// Computes the shared secret from the server's public value.
    pub fn shared_secret(&self, their_public: &BigUint) -> SkiffResult<BigUint> {
        let x = BigUint::from_bytes_be(&self.private);
        self.group.diffie_hellman(their_public, &x)
    }
}

impl Drop for DhExchange {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

/// Client-side ephemeral state for ECDH on a NIST curve.
pub enum EcdhExchange {
    /// P-256 ephemeral
    P256(p256::ecdh::EphemeralSecret),
    /// P-384 ephemeral
    P384(p384::ecdh::EphemeralSecret),
    /// P-521 ephemeral
    P521(p521::ecdh::EphemeralSecret),
}

impl EcdhExchange {
    /// Generates an ephemeral key on the given curve.
    pub fn new(curve: EcdsaCurve) -> Self {
        match curve {
            EcdsaCurve::NistP256 => {
                EcdhExchange::P256(p256::ecdh::EphemeralSecret::random(&mut rand::rngs::OsRng))
            }
            EcdsaCurve::NistP384 => {
                EcdhExchange::P384(p384::ecdh::EphemeralSecret::random(&mut rand::rngs::OsRng))
            }
            EcdsaCurve::NistP521 => {
                EcdhExchange::P521(p521::ecdh::EphemeralSecret::random(&mut rand::rngs::OsRng))
            }
        }
    }

    /// The uncompressed SEC1 encoding of our public point.
    pub fn public_bytes(&self) -> Vec<u8> {
        match self {
            EcdhExchange::P256(secret) => secret
                .public_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
            EcdhExchange::P384(secret) => secret
                .public_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
            EcdhExchange::P521(secret) => secret
                .public_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
        }
    }

    /// Computes the shared secret (the X coordinate of the shared point)
    /// from the server's ephemeral point.
    ///
    /// The point is validated by the curve library: off-curve points and
    /// the point at infinity fail to parse.
    pub fn shared_secret(&self, peer_point: &[u8]) -> SkiffResult<Vec<u8>> {
        let out_of_bounds =
            |_| SkiffError::KexParameterOutOfBounds("server point not on curve".to_string());
        match self {
            EcdhExchange::P256(secret) => {
                let peer = p256::PublicKey::from_sec1_bytes(peer_point).map_err(out_of_bounds)?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
            EcdhExchange::P384(secret) => {
                let peer = p384::PublicKey::from_sec1_bytes(peer_point).map_err(out_of_bounds)?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
            EcdhExchange::P521(secret) => {
                let peer = p521::PublicKey::from_sec1_bytes(peer_point).map_err(out_of_bounds)?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
        }
    }
}

/// Outcome of one key exchange.
pub struct KexResult {
    /// Session hash H. The H of the first exchange is also the persistent
    /// session identifier.
    pub h: Vec<u8>,
    /// Shared secret K, already mpint-encoded.
    pub k_mpint: Vec<u8>,
    /// Server host key blob as hashed into H.
    pub host_key: Vec<u8>,
    /// Signature body over H (format, blob).
    pub signature: Vec<u8>,
    /// Hash function the exchange used.
    pub hash: HashAlg,
}

/// SSH_MSG_KEXDH_INIT for the classic DH groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexDhInit {
    /// Client public value X = g^x mod p.
    pub e: BigUint,
}

impl KexDhInit {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::KexdhInit as u8);
        wire::write_mpint(&mut buf, &self.e.to_bytes_be());
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::KexdhInit)?;
        let e = BigUint::from_bytes_be(&wire::read_mpint(data, &mut offset)?);
        Ok(Self { e })
    }
}

/// SSH_MSG_KEXDH_REPLY for the classic DH groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexDhReply {
    /// Server host key blob.
    pub host_key: Vec<u8>,
    /// Server public value Y.
    pub y: BigUint,
    /// Signature body (format, blob) over the exchange hash.
    pub signature: Vec<u8>,
}

impl KexDhReply {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::KexdhReply as u8);
        wire::write_string(&mut buf, &self.host_key);
        wire::write_mpint(&mut buf, &self.y.to_bytes_be());
        wire::write_string(&mut buf, &self.signature);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::KexdhReply)?;
        Ok(Self {
            host_key: wire::read_string(data, &mut offset)?,
            y: BigUint::from_bytes_be(&wire::read_mpint(data, &mut offset)?),
            signature: wire::read_string(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_KEX_ECDH_INIT (RFC 5656 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexEcdhInit {
    /// Client ephemeral point, uncompressed SEC1.
    pub client_pub: Vec<u8>,
}

impl KexEcdhInit {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::KexdhInit as u8);
        wire::write_string(&mut buf, &self.client_pub);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::KexdhInit)?;
        Ok(Self {
            client_pub: wire::read_string(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_KEX_ECDH_REPLY (RFC 5656 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexEcdhReply {
    /// Server host key blob.
    pub host_key: Vec<u8>,
    /// Server ephemeral point, uncompressed SEC1.
    pub server_pub: Vec<u8>,
    /// Signature body (format, blob) over the exchange hash.
    pub signature: Vec<u8>,
}

impl KexEcdhReply {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::KexdhReply as u8);
        wire::write_string(&mut buf, &self.host_key);
        wire::write_string(&mut buf, &self.server_pub);
        wire::write_string(&mut buf, &self.signature);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::KexdhReply)?;
        Ok(Self {
            host_key: wire::read_string(data, &mut offset)?,
            server_pub: wire::read_string(data, &mut offset)?,
            signature: wire::read_string(data, &mut offset)?,
        })
    }
}

/// Computes the session hash for an ECDH exchange: the four handshake
/// magics, the host key, and both ephemeral points as byte-strings, then K
/// appended in its mpint encoding (RFC 5656 Section 4).
pub fn ecdh_exchange_hash(
    hash: HashAlg,
    magics: &HandshakeMagics,
    host_key: &[u8],
    client_pub: &[u8],
    server_pub: &[u8],
    k_mpint: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::write_string(&mut buf, &magics.client_version);
    wire::write_string(&mut buf, &magics.server_version);
    wire::write_string(&mut buf, &magics.client_kex_init);
    wire::write_string(&mut buf, &magics.server_kex_init);
    wire::write_string(&mut buf, host_key);
    wire::write_string(&mut buf, client_pub);
    wire::write_string(&mut buf, server_pub);
    buf.extend_from_slice(k_mpint);
    hash.hash(&[&buf])
}

/// Computes the session hash for a classic DH exchange: as ECDH, but the
/// public values hash as mpints (RFC 4253 Section 8).
pub fn dh_exchange_hash(
    hash: HashAlg,
    magics: &HandshakeMagics,
    host_key: &[u8],
    x: &BigUint,
    y: &BigUint,
    k_mpint: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::write_string(&mut buf, &magics.client_version);
    wire::write_string(&mut buf, &magics.server_version);
    wire::write_string(&mut buf, &magics.client_kex_init);
    wire::write_string(&mut buf, &magics.server_kex_init);
    wire::write_string(&mut buf, host_key);
    wire::write_mpint(&mut buf, &x.to_bytes_be());
    wire::write_mpint(&mut buf, &y.to_bytes_be());
    buf.extend_from_slice(k_mpint);
    hash.hash(&[&buf])
}

/// Expands key material per RFC 4253 Section 7.2: the first block is
/// `HASH(K || H || tag || session_id)`, later blocks are
/// `HASH(K || H || all-prior-blocks)`, truncated to `out_len`.
pub fn derive_key_material(
    hash: HashAlg,
    k_mpint: &[u8],
    h: &[u8],
    session_id: &[u8],
    tag: u8,
    out_len: usize,
) -> Vec<u8> {
    let mut out = hash.hash(&[k_mpint, h, &[tag], session_id]);
    while out.len() < out_len {
        let next = hash.hash(&[k_mpint, h, &out]);
        out.extend_from_slice(&next);
    }
    out.truncate(out_len);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_range_check() {
        let group = dh_group14();
        let x = BigUint::from(12345u32);

        assert!(matches!(
            group.diffie_hellman(&BigUint::from(0u32), &x),
            Err(SkiffError::KexParameterOutOfBounds(_))
        ));
        assert!(matches!(
            group.diffie_hellman(&group.p.clone(), &x),
            Err(SkiffError::KexParameterOutOfBounds(_))
        ));
        assert!(group.diffie_hellman(&BigUint::from(2u32), &x).is_ok());
    }

    #[test]
    fn test_dh_agreement() {
        let group = dh_group1();
        let mut rng = rand::thread_rng();
        let client = DhExchange::new(group, &mut rng);
        let server = DhExchange::new(group, &mut rng);

        let k1 = client.shared_secret(&server.public).unwrap();
        let k2 = server.shared_secret(&client.public).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_ecdh_agreement() {
        let client = EcdhExchange::new(EcdsaCurve::NistP256);
        let server = EcdhExchange::new(EcdsaCurve::NistP256);

        let k1 = client.shared_secret(&server.public_bytes()).unwrap();
        let k2 = server.shared_secret(&client.public_bytes()).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 32);
    }

    #[test]
    fn test_ecdh_rejects_garbage_point() {
        let client = EcdhExchange::new(EcdsaCurve::NistP256);
        let mut bogus = vec![0x04];
        bogus.extend_from_slice(&[0x01; 64]);
        assert!(matches!(
            client.shared_secret(&bogus),
            Err(SkiffError::KexParameterOutOfBounds(_))
        ));
    }

    #[test]
    fn test_kex_hash_mapping() {
        assert_eq!(kex_hash_alg(KEX_ALGO_DH1_SHA1), Some(HashAlg::Sha1));
        assert_eq!(kex_hash_alg(KEX_ALGO_DH14_SHA1), Some(HashAlg::Sha1));
        assert_eq!(kex_hash_alg(KEX_ALGO_ECDH256), Some(HashAlg::Sha256));
        assert_eq!(kex_hash_alg(KEX_ALGO_ECDH384), Some(HashAlg::Sha384));
        assert_eq!(kex_hash_alg(KEX_ALGO_ECDH521), Some(HashAlg::Sha512));
        assert_eq!(kex_hash_alg("curve25519-sha256"), None);
    }

    #[test]
    fn test_kexdh_messages_round_trip() {
        let init = KexDhInit {
            e: BigUint::from(0x1234_5678u32),
        };
        assert_eq!(KexDhInit::from_bytes(&init.to_bytes()).unwrap(), init);

        let reply = KexDhReply {
            host_key: vec![1, 2, 3],
            y: BigUint::from(999u32),
            signature: vec![4, 5],
        };
        assert_eq!(KexDhReply::from_bytes(&reply.to_bytes()).unwrap(), reply);
    }

    #[test]
    fn test_kexecdh_messages_round_trip() {
        let init = KexEcdhInit {
            client_pub: vec![0x04, 0xaa, 0xbb],
        };
        assert_eq!(KexEcdhInit::from_bytes(&init.to_bytes()).unwrap(), init);

        let reply = KexEcdhReply {
            host_key: vec![1],
            server_pub: vec![0x04, 0x02],
            signature: vec![9],
        };
        assert_eq!(KexEcdhReply::from_bytes(&reply.to_bytes()).unwrap(), reply);
    }

    #[test]
    fn test_derive_key_material_expansion() {
        let k = wire::mpint_bytes(&[0x42; 32]);
        let h = vec![0x01; 32];
        let sid = vec![0x02; 32];

        let short = derive_key_material(HashAlg::Sha256, &k, &h, &sid, b'C', 16);
        assert_eq!(short.len(), 16);

        let long = derive_key_material(HashAlg::Sha256, &k, &h, &sid, b'C', 80);
        assert_eq!(long.len(), 80);
        // The first block is a prefix of the longer expansion.
        assert_eq!(&long[..16], &short[..]);

        // Different tags diverge.
        let other = derive_key_material(HashAlg::Sha256, &k, &h, &sid, b'D', 16);
        assert_ne!(short, other);
    }

    #[test]
    fn test_exchange_hash_is_order_sensitive() {
        let magics = HandshakeMagics {
            client_version: b"SSH-2.0-A".to_vec(),
            server_version: b"SSH-2.0-B".to_vec(),
            client_kex_init: vec![20, 1],
            server_kex_init: vec![20, 2],
        };
        let k = wire::mpint_bytes(&[0x55; 16]);

        let h1 = ecdh_exchange_hash(HashAlg::Sha256, &magics, &[9], &[1], &[2], &k);
        let h2 = ecdh_exchange_hash(HashAlg::Sha256, &magics, &[9], &[2], &[1], &k);
        assert_ne!(h1, h2);
        assert_eq!(h1.len(), 32);
    }
}
