//! SSH public keys and signature blobs (RFC 4253 Section 6.6, RFC 5656).
//!
//! A key on the wire is a length-prefixed algorithm name followed by a
//! key-specific blob. This module parses and marshals RSA, DSA, and ECDSA
//! keys plus OpenSSH v01 certificates wrapping any of them, and verifies
//! signatures made by the corresponding private keys.
//!
//! The *public* algorithm name of a certificate is the certificate algorithm
//! (`...-cert-v01@openssh.com`); its *private* algorithm name is that of the
//! key inside. Plain keys use the same name for both.

use bytes::BytesMut;
use rsa::traits::PublicKeyParts;
use sha1::{Digest, Sha1};
use signature::DigestVerifier;
use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::cert::{self, OpenSshCertV01};
use crate::ssh::wire;

/// Algorithm name for RSA keys.
pub const KEY_ALGO_RSA: &str = "ssh-rsa";
/// Algorithm name for DSA keys.
pub const KEY_ALGO_DSA: &str = "ssh-dss";
/// Algorithm name for ECDSA keys on NIST P-256.
pub const KEY_ALGO_ECDSA256: &str = "ecdsa-sha2-nistp256";
/// Algorithm name for ECDSA keys on NIST P-384.
pub const KEY_ALGO_ECDSA384: &str = "ecdsa-sha2-nistp384";
/// Algorithm name for ECDSA keys on NIST P-521.
pub const KEY_ALGO_ECDSA521: &str = "ecdsa-sha2-nistp521";

/// A signature blob: the algorithm format name and the raw signature bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Signature format name, e.g. "ssh-rsa".
    pub format: String,
    /// Raw signature bytes in the format's own layout.
    pub blob: Vec<u8>,
}

impl Signature {
    /// Serializes as the outer wire blob: a byte-string whose payload is
    /// (format byte-string, signature byte-string). See RFC 4254 Section 6.6.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut inner = BytesMut::new();
        wire::write_string(&mut inner, self.format.as_bytes());
        wire::write_string(&mut inner, &self.blob);

        let mut buf = BytesMut::new();
        wire::write_string(&mut buf, &inner);
        buf.to_vec()
    }

    /// Parses a bare signature body (format, blob) in place.
    pub fn read_body(data: &[u8], offset: &mut usize) -> SkiffResult<Self> {
        Ok(Self {
            format: wire::read_string_utf8(data, offset)?,
            blob: wire::read_string(data, offset)?,
        })
    }

    /// Parses the outer wire blob: reads one byte-string and then the body
    /// inside it, requiring the body to consume the byte-string exactly.
    ///
    /// The cursor advances past the outer byte-string, so bytes following
    /// the signature remain available to the caller.
    pub fn read(data: &[u8], offset: &mut usize) -> SkiffResult<Self> {
        let outer = wire::read_string(data, offset)?;
        let mut inner = 0;
        let sig = Self::read_body(&outer, &mut inner)?;
        if inner != outer.len() {
            return Err(SkiffError::MalformedMessage(
                "trailing bytes inside signature blob".to_string(),
            ));
        }
        Ok(sig)
    }
}

/// The NIST curves supported for ECDSA keys and ECDH key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcdsaCurve {
    /// NIST P-256 / secp256r1
    NistP256,
    /// NIST P-384 / secp384r1
    NistP384,
    /// NIST P-521 / secp521r1
    NistP521,
}

impl EcdsaCurve {
    /// The curve identifier used inside key blobs, e.g. "nistp256".
    pub fn curve_name(&self) -> &'static str {
        match self {
            EcdsaCurve::NistP256 => "nistp256",
            EcdsaCurve::NistP384 => "nistp384",
            EcdsaCurve::NistP521 => "nistp521",
        }
    }

    /// The full key algorithm name, e.g. "ecdsa-sha2-nistp256".
    pub fn algo_name(&self) -> &'static str {
        match self {
            EcdsaCurve::NistP256 => KEY_ALGO_ECDSA256,
            EcdsaCurve::NistP384 => KEY_ALGO_ECDSA384,
            EcdsaCurve::NistP521 => KEY_ALGO_ECDSA521,
        }
    }

    /// Scalar field size in bytes.
    pub fn field_size(&self) -> usize {
        match self {
            EcdsaCurve::NistP256 => 32,
            EcdsaCurve::NistP384 => 48,
            EcdsaCurve::NistP521 => 66,
        }
    }

    /// Maps a curve identifier string to a curve.
    pub fn from_curve_name(name: &str) -> Option<Self> {
        match name {
            "nistp256" => Some(EcdsaCurve::NistP256),
            "nistp384" => Some(EcdsaCurve::NistP384),
            "nistp521" => Some(EcdsaCurve::NistP521),
            _ => None,
        }
    }
}

/// A parsed SSH public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// RSA key: public exponent and modulus, big-endian magnitudes.
    Rsa {
        /// Public exponent e
        e: Vec<u8>,
        /// Modulus n
        n: Vec<u8>,
    },
    /// DSA key: domain parameters and public value, big-endian magnitudes.
    Dsa {
        /// Prime modulus p
        p: Vec<u8>,
        /// Subgroup order q
        q: Vec<u8>,
        /// Generator g
        g: Vec<u8>,
        /// Public value y
        y: Vec<u8>,
    },
    /// ECDSA key: curve and uncompressed SEC1 point.
    Ecdsa {
        /// The NIST curve the key lives on
        curve: EcdsaCurve,
        /// Uncompressed SEC1 point (0x04 || X || Y)
        point: Vec<u8>,
    },
    /// OpenSSH v01 certificate wrapping one of the above.
    Cert(Box<OpenSshCertV01>),
}

impl PublicKey {
    /// The algorithm name this key presents on the wire. For certificates
    /// this is the certificate algorithm name.
    pub fn public_algo_name(&self) -> &'static str {
        match self {
            PublicKey::Rsa { .. } => KEY_ALGO_RSA,
            PublicKey::Dsa { .. } => KEY_ALGO_DSA,
            PublicKey::Ecdsa { curve, .. } => curve.algo_name(),
            PublicKey::Cert(cert) => cert.public_algo_name(),
        }
    }

    /// The algorithm name of the underlying private key. Differs from
    /// [`public_algo_name`](Self::public_algo_name) only for certificates.
    pub fn private_algo_name(&self) -> &'static str {
        match self {
            PublicKey::Cert(cert) => cert.key.private_algo_name(),
            _ => self.public_algo_name(),
        }
    }

    /// Serializes the key for the wire: length-prefixed algorithm name
    /// followed by the key-specific blob (RFC 4253 Section 6.6).
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_string(&mut buf, self.public_algo_name().as_bytes());
        self.write_blob(&mut buf);
        buf.to_vec()
    }

    /// Writes the key-specific blob (everything after the algorithm name).
    pub(crate) fn write_blob(&self, buf: &mut BytesMut) {
        match self {
            PublicKey::Rsa { e, n } => {
                wire::write_mpint(buf, e);
                wire::write_mpint(buf, n);
            }
            PublicKey::Dsa { p, q, g, y } => {
                wire::write_mpint(buf, p);
                wire::write_mpint(buf, q);
                wire::write_mpint(buf, g);
                wire::write_mpint(buf, y);
            }
            PublicKey::Ecdsa { curve, point } => {
                wire::write_string(buf, curve.curve_name().as_bytes());
                wire::write_string(buf, point);
            }
            PublicKey::Cert(cert) => cert.write_body(buf),
        }
    }

    /// Parses a wire-encoded public key, requiring the whole input to be
    /// consumed.
    pub fn parse(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        let key = Self::read(data, &mut offset)?;
        if offset != data.len() {
            return Err(SkiffError::MalformedMessage(
                "trailing bytes after public key".to_string(),
            ));
        }
        Ok(key)
    }

    /// Parses a wire-encoded public key in place, leaving any remainder for
    /// the caller.
    pub fn read(data: &[u8], offset: &mut usize) -> SkiffResult<Self> {
        let algo = wire::read_string_utf8(data, offset)?;
        match algo.as_str() {
            KEY_ALGO_RSA => {
                let e = read_magnitude(data, offset)?;
                let n = read_magnitude(data, offset)?;
                Ok(PublicKey::Rsa { e, n })
            }
            KEY_ALGO_DSA => {
                let p = read_magnitude(data, offset)?;
                let q = read_magnitude(data, offset)?;
                let g = read_magnitude(data, offset)?;
                let y = read_magnitude(data, offset)?;
                Ok(PublicKey::Dsa { p, q, g, y })
            }
            KEY_ALGO_ECDSA256 | KEY_ALGO_ECDSA384 | KEY_ALGO_ECDSA521 => {
                let curve_name = wire::read_string_utf8(data, offset)?;
                let curve = EcdsaCurve::from_curve_name(&curve_name).ok_or_else(|| {
                    SkiffError::MalformedMessage(format!("unknown curve '{}'", curve_name))
                })?;
                if curve.algo_name() != algo {
                    return Err(SkiffError::MalformedMessage(format!(
                        "curve '{}' does not match algorithm '{}'",
                        curve_name, algo
                    )));
                }
                let point = wire::read_string(data, offset)?;
                if point.first() != Some(&0x04) {
                    return Err(SkiffError::MalformedMessage(
                        "EC point is not in uncompressed form".to_string(),
                    ));
                }
                Ok(PublicKey::Ecdsa { curve, point })
            }
            _ => {
                if let Some(inner_algo) = cert::cert_algo_to_key_algo(&algo) {
                    let cert = cert::read_cert_body(data, offset, inner_algo)?;
                    Ok(PublicKey::Cert(Box::new(cert)))
                } else {
                    Err(SkiffError::MalformedMessage(format!(
                        "unsupported key algorithm '{}'",
                        algo
                    )))
                }
            }
        }
    }

    /// Verifies `sig_blob` over `data` with this key.
    ///
    /// Returns `Ok(false)` when the signature simply does not verify, and an
    /// error when the key or signature material is itself malformed. The
    /// digest is fixed by the key family: SHA-1 for RSA and DSA, the curve
    /// hash for ECDSA. Certificates delegate to the wrapped key.
    pub fn verify(&self, data: &[u8], sig_blob: &[u8]) -> SkiffResult<bool> {
        match self {
            PublicKey::Rsa { e, n } => verify_rsa(e, n, data, sig_blob),
            PublicKey::Dsa { p, q, g, y } => verify_dsa(p, q, g, y, data, sig_blob),
            PublicKey::Ecdsa { curve, point } => verify_ecdsa(*curve, point, data, sig_blob),
            PublicKey::Cert(cert) => cert.key.verify(data, sig_blob),
        }
    }
}

/// Reads an mpint and normalizes it to a magnitude without leading zeros.
fn read_magnitude(data: &[u8], offset: &mut usize) -> SkiffResult<Vec<u8>> {
    let body = wire::read_mpint(data, offset)?;
    let start = body.iter().position(|&b| b != 0).unwrap_or(body.len());
    Ok(body[start..].to_vec())
}

fn verify_rsa(e: &[u8], n: &[u8], data: &[u8], sig: &[u8]) -> SkiffResult<bool> {
    let key = rsa::RsaPublicKey::new(
        rsa::BigUint::from_bytes_be(n),
        rsa::BigUint::from_bytes_be(e),
    )
    .map_err(|err| SkiffError::Security(format!("invalid RSA public key: {}", err)))?;

    let digest = Sha1::digest(data);
    Ok(key
        .verify(rsa::Pkcs1v15Sign::new::<Sha1>(), &digest, sig)
        .is_ok())
}

fn verify_dsa(p: &[u8], q: &[u8], g: &[u8], y: &[u8], data: &[u8], sig: &[u8]) -> SkiffResult<bool> {
    // The ssh-dss signature blob is r || s, 20 bytes each (RFC 4253 6.6).
    if sig.len() != 40 {
        return Err(SkiffError::MalformedMessage(format!(
            "ssh-dss signature blob is {} bytes (expected 40)",
            sig.len()
        )));
    }

    let components = dsa::Components::from_components(
        dsa::BigUint::from_bytes_be(p),
        dsa::BigUint::from_bytes_be(q),
        dsa::BigUint::from_bytes_be(g),
    )
    .map_err(|_| SkiffError::Security("invalid DSA domain parameters".to_string()))?;
    let key = dsa::VerifyingKey::from_components(components, dsa::BigUint::from_bytes_be(y))
        .map_err(|_| SkiffError::Security("invalid DSA public key".to_string()))?;

    let signature = dsa::Signature::from_components(
        dsa::BigUint::from_bytes_be(&sig[..20]),
        dsa::BigUint::from_bytes_be(&sig[20..]),
    )
    .map_err(|_| SkiffError::MalformedMessage("invalid DSA signature components".to_string()))?;

    Ok(key
        .verify_digest(Sha1::new().chain_update(data), &signature)
        .is_ok())
}

fn verify_ecdsa(curve: EcdsaCurve, point: &[u8], data: &[u8], sig: &[u8]) -> SkiffResult<bool> {
    // The blob carries (mpint r, mpint s); scalars are left-padded to the
    // curve field size before handing them to the verifier.
    let mut offset = 0;
    let r = read_magnitude(sig, &mut offset)?;
    let s = read_magnitude(sig, &mut offset)?;

    let size = curve.field_size();
    if r.len() > size || s.len() > size {
        return Err(SkiffError::MalformedMessage(
            "ECDSA signature scalar larger than the curve field".to_string(),
        ));
    }
    let mut rs = vec![0u8; 2 * size];
    rs[size - r.len()..size].copy_from_slice(&r);
    rs[2 * size - s.len()..].copy_from_slice(&s);

    match curve {
        EcdsaCurve::NistP256 => {
            use p256::ecdsa::signature::Verifier;
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point)
                .map_err(|_| SkiffError::Security("invalid P-256 public key".to_string()))?;
            let sig = p256::ecdsa::Signature::from_slice(&rs)
                .map_err(|_| SkiffError::MalformedMessage("invalid P-256 signature".to_string()))?;
            Ok(key.verify(data, &sig).is_ok())
        }
        EcdsaCurve::NistP384 => {
            use p384::ecdsa::signature::Verifier;
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(point)
                .map_err(|_| SkiffError::Security("invalid P-384 public key".to_string()))?;
            let sig = p384::ecdsa::Signature::from_slice(&rs)
                .map_err(|_| SkiffError::MalformedMessage("invalid P-384 signature".to_string()))?;
            Ok(key.verify(data, &sig).is_ok())
        }
        EcdsaCurve::NistP521 => {
            use p521::ecdsa::signature::Verifier;
            let key = p521::ecdsa::VerifyingKey::from_sec1_bytes(point)
                .map_err(|_| SkiffError::Security("invalid P-521 public key".to_string()))?;
            let sig = p521::ecdsa::Signature::from_slice(&rs)
                .map_err(|_| SkiffError::MalformedMessage("invalid P-521 signature".to_string()))?;
            Ok(key.verify(data, &sig).is_ok())
        }
    }
}
