//! OpenSSH v01 certificates ([PROTOCOL.certkeys]).
//!
//! A certificate is a public key wrapped in a signed envelope: nonce, the
//! key itself, serial, type (user or host), key id, valid principals,
//! validity window, critical options, extensions, reserved bytes, the CA
//! key, and the CA signature. On the wire the envelope is the key-specific
//! blob of a `...-cert-v01@openssh.com` algorithm name.
//!
//! Principal lists use a length-prefixed concatenation of length-prefixed
//! names. Note this differs from the comma-separated RFC 4251 name-list
//! used by KEXINIT; both encodings are load-bearing at their own sites.

use bytes::BytesMut;
use rsa::traits::PublicKeyParts;
use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::pubkey::{PublicKey, Signature, KEY_ALGO_DSA, KEY_ALGO_ECDSA256,
    KEY_ALGO_ECDSA384, KEY_ALGO_ECDSA521, KEY_ALGO_RSA};
use crate::ssh::wire;

/// Certificate algorithm name for RSA.
pub const CERT_ALGO_RSA_V01: &str = "ssh-rsa-cert-v01@openssh.com";
/// Certificate algorithm name for DSA.
pub const CERT_ALGO_DSA_V01: &str = "ssh-dss-cert-v01@openssh.com";
/// Certificate algorithm name for ECDSA P-256.
pub const CERT_ALGO_ECDSA256_V01: &str = "ecdsa-sha2-nistp256-cert-v01@openssh.com";
/// Certificate algorithm name for ECDSA P-384.
pub const CERT_ALGO_ECDSA384_V01: &str = "ecdsa-sha2-nistp384-cert-v01@openssh.com";
/// Certificate algorithm name for ECDSA P-521.
pub const CERT_ALGO_ECDSA521_V01: &str = "ecdsa-sha2-nistp521-cert-v01@openssh.com";

/// Certificate type marking a user identity.
pub const USER_CERT: u32 = 1;
/// Certificate type marking a host identity.
pub const HOST_CERT: u32 = 2;

/// Maps a certificate algorithm name to the algorithm of the key it wraps.
pub fn cert_algo_to_key_algo(cert_algo: &str) -> Option<&'static str> {
    match cert_algo {
        CERT_ALGO_RSA_V01 => Some(KEY_ALGO_RSA),
        CERT_ALGO_DSA_V01 => Some(KEY_ALGO_DSA),
        CERT_ALGO_ECDSA256_V01 => Some(KEY_ALGO_ECDSA256),
        CERT_ALGO_ECDSA384_V01 => Some(KEY_ALGO_ECDSA384),
        CERT_ALGO_ECDSA521_V01 => Some(KEY_ALGO_ECDSA521),
        _ => None,
    }
}

/// Maps a plain key algorithm name to its certificate algorithm name.
pub fn key_algo_to_cert_algo(key_algo: &str) -> Option<&'static str> {
    match key_algo {
        KEY_ALGO_RSA => Some(CERT_ALGO_RSA_V01),
        KEY_ALGO_DSA => Some(CERT_ALGO_DSA_V01),
        KEY_ALGO_ECDSA256 => Some(CERT_ALGO_ECDSA256_V01),
        KEY_ALGO_ECDSA384 => Some(CERT_ALGO_ECDSA384_V01),
        KEY_ALGO_ECDSA521 => Some(CERT_ALGO_ECDSA521_V01),
        _ => None,
    }
}

/// An OpenSSH v01 certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSshCertV01 {
    /// CA-chosen nonce.
    pub nonce: Vec<u8>,
    /// The certified public key.
    pub key: PublicKey,
    /// Serial number assigned by the CA.
    pub serial: u64,
    /// [`USER_CERT`] or [`HOST_CERT`].
    pub cert_type: u32,
    /// Free-form key identity.
    pub key_id: String,
    /// Principals the certificate is valid for; empty means all.
    pub valid_principals: Vec<String>,
    /// Validity start, seconds since the epoch.
    pub valid_after: u64,
    /// Validity end, seconds since the epoch.
    pub valid_before: u64,
    /// Critical options as (name, data) pairs, CA order preserved.
    pub critical_options: Vec<(String, Vec<u8>)>,
    /// Extensions as (name, data) pairs, CA order preserved.
    pub extensions: Vec<(String, Vec<u8>)>,
    /// Reserved bytes, currently always empty.
    pub reserved: Vec<u8>,
    /// The CA public key.
    pub signature_key: PublicKey,
    /// The CA signature over the preceding fields.
    pub signature: Signature,
}

impl OpenSshCertV01 {
    /// The certificate algorithm name presented on the wire.
    pub fn public_algo_name(&self) -> &'static str {
        match key_algo_to_cert_algo(self.key.private_algo_name()) {
            Some(algo) => algo,
            // read_cert_body rejects nested certificates, so the wrapped
            // key is always a plain key with a cert counterpart.
            None => panic!("certificate wraps an unsupported key type"),
        }
    }

    /// Writes the certificate envelope (the blob after the algorithm name)
    /// in [PROTOCOL.certkeys] field order.
    pub(crate) fn write_body(&self, buf: &mut BytesMut) {
        wire::write_string(buf, &self.nonce);
        buf.extend_from_slice(&self.key.marshal());
        wire::write_u64(buf, self.serial);
        wire::write_u32(buf, self.cert_type);
        wire::write_string(buf, self.key_id.as_bytes());
        write_principal_list(buf, &self.valid_principals);
        wire::write_u64(buf, self.valid_after);
        wire::write_u64(buf, self.valid_before);
        wire::write_tuple_list(buf, &self.critical_options);
        wire::write_tuple_list(buf, &self.extensions);
        wire::write_string(buf, &self.reserved);
        wire::write_string(buf, &self.signature_key.marshal());
        buf.extend_from_slice(&self.signature.to_wire());
    }
}

/// Parses a certificate envelope. `inner_algo` is the key algorithm the
/// certificate algorithm name promised; the wrapped key must match it.
pub(crate) fn read_cert_body(
    data: &[u8],
    offset: &mut usize,
    inner_algo: &str,
) -> SkiffResult<OpenSshCertV01> {
    let nonce = wire::read_string(data, offset)?;

    let key = PublicKey::read(data, offset)?;
    if matches!(key, PublicKey::Cert(_)) {
        return Err(SkiffError::MalformedMessage(
            "certificate wraps another certificate".to_string(),
        ));
    }
    if key.private_algo_name() != inner_algo {
        return Err(SkiffError::MalformedMessage(format!(
            "certificate wraps a '{}' key but its algorithm promises '{}'",
            key.private_algo_name(),
            inner_algo
        )));
    }

    let serial = wire::read_u64(data, offset)?;

    let cert_type = wire::read_u32(data, offset)?;
    if cert_type != USER_CERT && cert_type != HOST_CERT {
        return Err(SkiffError::MalformedMessage(format!(
            "certificate type {} is neither user (1) nor host (2)",
            cert_type
        )));
    }

    let key_id = wire::read_string_utf8(data, offset)?;
    let valid_principals = read_principal_list(data, offset)?;
    let valid_after = wire::read_u64(data, offset)?;
    let valid_before = wire::read_u64(data, offset)?;
    let critical_options = wire::read_tuple_list(data, offset)?;
    let extensions = wire::read_tuple_list(data, offset)?;
    let reserved = wire::read_string(data, offset)?;

    let signature_key_bytes = wire::read_string(data, offset)?;
    let signature_key = PublicKey::parse(&signature_key_bytes)?;

    let signature = Signature::read(data, offset)?;

    Ok(OpenSshCertV01 {
        nonce,
        key,
        serial,
        cert_type,
        key_id,
        valid_principals,
        valid_after,
        valid_before,
        critical_options,
        extensions,
        reserved,
        signature_key,
        signature,
    })
}

/// Writes a principal list: an outer byte-string whose payload is the
/// concatenation of length-prefixed names.
pub(crate) fn write_principal_list(buf: &mut BytesMut, names: &[String]) {
    let mut inner = BytesMut::new();
    for name in names {
        wire::write_string(&mut inner, name.as_bytes());
    }
    wire::write_string(buf, &inner);
}

/// Reads a principal list.
pub(crate) fn read_principal_list(data: &[u8], offset: &mut usize) -> SkiffResult<Vec<String>> {
    let list = wire::read_string(data, offset)?;
    let mut out = Vec::new();
    let mut inner = 0usize;
    while inner < list.len() {
        out.push(wire::read_string_utf8(&list, &mut inner)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cert() -> OpenSshCertV01 {
        OpenSshCertV01 {
            nonce: vec![0xab; 16],
            key: PublicKey::Rsa {
                e: vec![0x01, 0x00, 0x01],
                n: vec![0xc5, 0x12, 0x34, 0x56],
            },
            serial: 42,
            cert_type: USER_CERT,
            key_id: "deploy@example".to_string(),
            valid_principals: vec!["deploy".to_string(), "admin".to_string()],
            valid_after: 1_700_000_000,
            valid_before: 1_800_000_000,
            critical_options: vec![("force-command".to_string(), b"uptime".to_vec())],
            extensions: vec![("permit-pty".to_string(), vec![])],
            reserved: vec![],
            signature_key: PublicKey::Rsa {
                e: vec![0x01, 0x00, 0x01],
                n: vec![0xd9, 0x88, 0x77],
            },
            signature: Signature {
                format: "ssh-rsa".to_string(),
                blob: vec![0x5a; 32],
            },
        }
    }

    #[test]
    fn test_cert_round_trip() {
        let cert = sample_cert();
        let key = PublicKey::Cert(Box::new(cert.clone()));
        let wire_bytes = key.marshal();

        let parsed = PublicKey::parse(&wire_bytes).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.public_algo_name(), CERT_ALGO_RSA_V01);
        assert_eq!(parsed.private_algo_name(), "ssh-rsa");
    }

    #[test]
    fn test_cert_truncation_fails_at_every_point() {
        let key = PublicKey::Cert(Box::new(sample_cert()));
        let wire_bytes = key.marshal();

        for len in 0..wire_bytes.len() {
            assert!(
                PublicKey::parse(&wire_bytes[..len]).is_err(),
                "truncation to {} bytes unexpectedly parsed",
                len
            );
        }
    }

    #[test]
    fn test_cert_rejects_bad_type() {
        let mut cert = sample_cert();
        cert.cert_type = 3;
        let key = PublicKey::Cert(Box::new(cert));
        assert!(PublicKey::parse(&key.marshal()).is_err());

        let mut cert = sample_cert();
        cert.cert_type = 0;
        let key = PublicKey::Cert(Box::new(cert));
        assert!(PublicKey::parse(&key.marshal()).is_err());
    }

    #[test]
    fn test_cert_rejects_inner_key_mismatch() {
        // An ssh-rsa certificate algorithm wrapping a DSA key.
        let cert = sample_cert();
        let mut buf = BytesMut::new();
        wire::write_string(&mut buf, CERT_ALGO_RSA_V01.as_bytes());
        wire::write_string(&mut buf, &cert.nonce);
        buf.extend_from_slice(
            &PublicKey::Dsa {
                p: vec![0x07],
                q: vec![0x05],
                g: vec![0x02],
                y: vec![0x03],
            }
            .marshal(),
        );
        // The mismatch is detected before the remaining fields are needed.
        assert!(PublicKey::parse(&buf).is_err());
    }

    #[test]
    fn test_principal_list_layout() {
        let mut buf = BytesMut::new();
        write_principal_list(&mut buf, &["a".to_string(), "bc".to_string()]);
        assert_eq!(
            &buf[..],
            &[
                0, 0, 0, 13, // outer length
                0, 0, 0, 1, b'a', // "a"
                0, 0, 0, 2, b'b', b'c', // "bc"
            ]
        );

        let mut offset = 0;
        let parsed = read_principal_list(&buf, &mut offset).unwrap();
        assert_eq!(parsed, vec!["a".to_string(), "bc".to_string()]);
    }

    #[test]
    fn test_principal_list_empty() {
        let mut buf = BytesMut::new();
        write_principal_list(&mut buf, &[]);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_cert_delegates_verification_to_inner_key() {
        use rsa::Pkcs1v15Sign;
        use sha1::{Digest, Sha1};

        let mut rng = rand::thread_rng();
        let private = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public = private.to_public_key();

        let mut cert = sample_cert();
        cert.key = PublicKey::Rsa {
            e: public.e().to_bytes_be(),
            n: public.n().to_bytes_be(),
        };
        let cert_key = PublicKey::Cert(Box::new(cert));

        let data = b"session hash";
        let digest = Sha1::digest(data);
        let sig = private.sign(Pkcs1v15Sign::new::<Sha1>(), &digest).unwrap();

        assert!(cert_key.verify(data, &sig).unwrap());
    }
}
