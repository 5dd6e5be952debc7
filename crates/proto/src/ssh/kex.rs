//! Key-exchange initialization and algorithm negotiation (RFC 4253
//! Section 7.1).
//!
//! Both peers send SSH_MSG_KEXINIT carrying ten comma-separated name-lists
//! of algorithm preferences. For every category the negotiated algorithm is
//! the first entry of the client's list that the server also advertises;
//! ciphers must additionally exist in the local cipher-mode table. The raw
//! KEXINIT payloads of both peers are retained verbatim, because they are
//! inputs to every session hash.

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::cipher::cipher_modes;
use crate::ssh::message::{expect_type, MessageType};
use crate::ssh::wire;

/// Host-key algorithms this client advertises. DSA and ECDSA keys parse and
/// verify, but only ssh-rsa is offered in negotiation.
pub const SUPPORTED_HOST_KEY_ALGOS: &[&str] = &["ssh-rsa"];

/// Compression algorithms this client advertises.
pub const SUPPORTED_COMPRESSIONS: &[&str] = &["none"];

/// The four values captured during the handshake and fed into every
/// key-exchange hash. Immutable once the second KEXINIT has been read.
#[derive(Debug, Clone, Default)]
pub struct HandshakeMagics {
    /// Client version banner, without CR LF.
    pub client_version: Vec<u8>,
    /// Server version banner, without CR LF.
    pub server_version: Vec<u8>,
    /// Raw payload of the client's KEXINIT packet.
    pub client_kex_init: Vec<u8>,
    /// Raw payload of the server's KEXINIT packet.
    pub server_kex_init: Vec<u8>,
}

/// SSH_MSG_KEXINIT (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// 16 random bytes.
    pub cookie: [u8; 16],
    /// Key exchange algorithms.
    pub kex_algos: Vec<String>,
    /// Server host key algorithms.
    pub server_host_key_algos: Vec<String>,
    /// Ciphers client to server.
    pub ciphers_client_server: Vec<String>,
    /// Ciphers server to client.
    pub ciphers_server_client: Vec<String>,
    /// MACs client to server.
    pub macs_client_server: Vec<String>,
    /// MACs server to client.
    pub macs_server_client: Vec<String>,
    /// Compressions client to server.
    pub compression_client_server: Vec<String>,
    /// Compressions server to client.
    pub compression_server_client: Vec<String>,
    /// Languages client to server, usually empty.
    pub languages_client_server: Vec<String>,
    /// Languages server to client, usually empty.
    pub languages_server_client: Vec<String>,
    /// Whether a guessed KEX packet follows this message.
    pub first_kex_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT with the given preference lists and a fresh cookie.
    pub fn new(
        kex_algos: Vec<String>,
        server_host_key_algos: Vec<String>,
        ciphers: Vec<String>,
        macs: Vec<String>,
        rng: &mut dyn RngCore,
    ) -> Self {
        let mut cookie = [0u8; 16];
        rng.fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algos,
            server_host_key_algos,
            ciphers_client_server: ciphers.clone(),
            ciphers_server_client: ciphers,
            macs_client_server: macs.clone(),
            macs_server_client: macs,
            compression_client_server: strings(SUPPORTED_COMPRESSIONS),
            compression_server_client: strings(SUPPORTED_COMPRESSIONS),
            languages_client_server: vec![],
            languages_server_client: vec![],
            first_kex_follows: false,
        }
    }

    /// Serializes the message: type byte, cookie, ten name-lists, the
    /// first-kex-follows flag, and the reserved uint32.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        write_name_list(&mut buf, &self.kex_algos);
        write_name_list(&mut buf, &self.server_host_key_algos);
        write_name_list(&mut buf, &self.ciphers_client_server);
        write_name_list(&mut buf, &self.ciphers_server_client);
        write_name_list(&mut buf, &self.macs_client_server);
        write_name_list(&mut buf, &self.macs_server_client);
        write_name_list(&mut buf, &self.compression_client_server);
        write_name_list(&mut buf, &self.compression_server_client);
        write_name_list(&mut buf, &self.languages_client_server);
        write_name_list(&mut buf, &self.languages_server_client);

        wire::write_bool(&mut buf, self.first_kex_follows);
        wire::write_u32(&mut buf, 0);

        buf.to_vec()
    }

    /// Parses a KEXINIT payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::KexInit)?;

        if data.len() < offset + 16 {
            return Err(SkiffError::MalformedMessage(
                "KEXINIT shorter than its cookie".to_string(),
            ));
        }
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&data[offset..offset + 16]);
        offset += 16;

        let kex_algos = read_name_list(data, &mut offset)?;
        let server_host_key_algos = read_name_list(data, &mut offset)?;
        let ciphers_client_server = read_name_list(data, &mut offset)?;
        let ciphers_server_client = read_name_list(data, &mut offset)?;
        let macs_client_server = read_name_list(data, &mut offset)?;
        let macs_server_client = read_name_list(data, &mut offset)?;
        let compression_client_server = read_name_list(data, &mut offset)?;
        let compression_server_client = read_name_list(data, &mut offset)?;
        let languages_client_server = read_name_list(data, &mut offset)?;
        let languages_server_client = read_name_list(data, &mut offset)?;

        let first_kex_follows = wire::read_bool(data, &mut offset)?;
        wire::read_u32(data, &mut offset)?; // reserved

        Ok(Self {
            cookie,
            kex_algos,
            server_host_key_algos,
            ciphers_client_server,
            ciphers_server_client,
            macs_client_server,
            macs_server_client,
            compression_client_server,
            compression_server_client,
            languages_client_server,
            languages_server_client,
            first_kex_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS (RFC 4253 Section 7.3): a single byte, value 21. Marks
/// the direction-local switch to the freshly derived keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::NewKeys)?;
        Ok(Self)
    }
}

/// The algorithm choices produced by negotiation, one per category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgreedAlgorithms {
    /// Key exchange algorithm.
    pub kex: String,
    /// Server host key algorithm.
    pub host_key: String,
    /// Cipher client to server.
    pub cipher_client_server: String,
    /// Cipher server to client.
    pub cipher_server_client: String,
    /// MAC client to server.
    pub mac_client_server: String,
    /// MAC server to client.
    pub mac_server_client: String,
    /// Compression client to server.
    pub compression_client_server: String,
    /// Compression server to client.
    pub compression_server_client: String,
}

/// First entry of the client's list that the server also advertises.
pub fn find_common_algorithm(client: &[String], server: &[String]) -> Option<String> {
    client
        .iter()
        .find(|&algo| server.contains(algo))
        .cloned()
}

/// As [`find_common_algorithm`], but a cipher is only eligible when the
/// local cipher-mode table has an entry for it.
pub fn find_common_cipher(client: &[String], server: &[String]) -> Option<String> {
    client
        .iter()
        .find(|&algo| server.contains(algo) && cipher_modes().contains_key(algo.as_str()))
        .cloned()
}

/// Runs negotiation across every category of the two KEXINIT messages.
///
/// # Errors
///
/// [`SkiffError::NoCommonAlgorithm`] naming the first category that yielded
/// no match.
pub fn find_agreed_algorithms(
    client: &KexInit,
    server: &KexInit,
) -> SkiffResult<AgreedAlgorithms> {
    let no_common = |category: &str| SkiffError::NoCommonAlgorithm(category.to_string());

    Ok(AgreedAlgorithms {
        kex: find_common_algorithm(&client.kex_algos, &server.kex_algos)
            .ok_or_else(|| no_common("key exchange"))?,
        host_key: find_common_algorithm(
            &client.server_host_key_algos,
            &server.server_host_key_algos,
        )
        .ok_or_else(|| no_common("host key"))?,
        cipher_client_server: find_common_cipher(
            &client.ciphers_client_server,
            &server.ciphers_client_server,
        )
        .ok_or_else(|| no_common("cipher client-to-server"))?,
        cipher_server_client: find_common_cipher(
            &client.ciphers_server_client,
            &server.ciphers_server_client,
        )
        .ok_or_else(|| no_common("cipher server-to-client"))?,
        mac_client_server: find_common_algorithm(
            &client.macs_client_server,
            &server.macs_client_server,
        )
        .ok_or_else(|| no_common("MAC client-to-server"))?,
        mac_server_client: find_common_algorithm(
            &client.macs_server_client,
            &server.macs_server_client,
        )
        .ok_or_else(|| no_common("MAC server-to-client"))?,
        compression_client_server: find_common_algorithm(
            &client.compression_client_server,
            &server.compression_client_server,
        )
        .ok_or_else(|| no_common("compression client-to-server"))?,
        compression_server_client: find_common_algorithm(
            &client.compression_server_client,
            &server.compression_server_client,
        )
        .ok_or_else(|| no_common("compression server-to-client"))?,
    })
}

/// Owned copies of a static name list.
pub fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Writes a comma-separated RFC 4251 name-list.
fn write_name_list(buf: &mut BytesMut, names: &[String]) {
    let list = names.join(",");
    buf.put_u32(list.len() as u32);
    buf.put_slice(list.as_bytes());
}

/// Reads a comma-separated RFC 4251 name-list.
fn read_name_list(data: &[u8], offset: &mut usize) -> SkiffResult<Vec<String>> {
    let list = wire::read_string_utf8(data, offset)?;
    if list.is_empty() {
        Ok(vec![])
    } else {
        Ok(list.split(',').map(String::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_kexinit() -> KexInit {
        KexInit::new(
            strings(&["ecdh-sha2-nistp256", "diffie-hellman-group14-sha1"]),
            strings(SUPPORTED_HOST_KEY_ALGOS),
            strings(&["aes128-ctr", "aes256-ctr"]),
            strings(&["hmac-sha2-256", "hmac-sha1"]),
            &mut rand::thread_rng(),
        )
    }

    #[test]
    fn test_kexinit_round_trip() {
        let original = sample_kexinit();
        let bytes = original.to_bytes();
        assert_eq!(bytes[0], 20);

        let parsed = KexInit::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_kexinit_empty_language_lists() {
        let kexinit = sample_kexinit();
        let parsed = KexInit::from_bytes(&kexinit.to_bytes()).unwrap();
        assert!(parsed.languages_client_server.is_empty());
        assert!(parsed.languages_server_client.is_empty());
    }

    #[test]
    fn test_kexinit_truncated() {
        let bytes = sample_kexinit().to_bytes();
        assert!(KexInit::from_bytes(&bytes[..10]).is_err());
        assert!(KexInit::from_bytes(&bytes[..bytes.len() - 4]).is_err());
    }

    #[test]
    fn test_newkeys_round_trip() {
        assert_eq!(NewKeys.to_bytes(), vec![21]);
        assert!(NewKeys::from_bytes(&[21]).is_ok());
        assert!(matches!(
            NewKeys::from_bytes(&[20]),
            Err(SkiffError::UnexpectedMessage { .. })
        ));
    }

    #[test]
    fn test_first_client_preference_wins() {
        let client = strings(&["a", "b", "c"]);
        let server = strings(&["c", "b"]);
        assert_eq!(
            find_common_algorithm(&client, &server),
            Some("b".to_string())
        );

        // Client preference order decides, not the server's.
        let server = strings(&["c", "b", "a"]);
        assert_eq!(
            find_common_algorithm(&client, &server),
            Some("a".to_string())
        );
    }

    #[test]
    fn test_disjoint_lists_yield_no_match() {
        let client = strings(&["a", "b"]);
        let server = strings(&["x", "y"]);
        assert_eq!(find_common_algorithm(&client, &server), None);
    }

    #[test]
    fn test_cipher_requires_local_mode_entry() {
        // Both peers prefer a cipher we have no mode table entry for.
        let client = strings(&["arcfour", "aes128-ctr"]);
        let server = strings(&["arcfour", "aes128-ctr"]);
        assert_eq!(
            find_common_cipher(&client, &server),
            Some("aes128-ctr".to_string())
        );
    }

    #[test]
    fn test_find_agreed_algorithms() {
        let mut rng = rand::thread_rng();
        let client = sample_kexinit();
        let server = KexInit::new(
            strings(&["diffie-hellman-group14-sha1", "ecdh-sha2-nistp256"]),
            strings(&["ssh-rsa"]),
            strings(&["aes256-ctr", "aes128-ctr"]),
            strings(&["hmac-sha1", "hmac-sha2-256"]),
            &mut rng,
        );

        let agreed = find_agreed_algorithms(&client, &server).unwrap();
        assert_eq!(agreed.kex, "ecdh-sha2-nistp256");
        assert_eq!(agreed.host_key, "ssh-rsa");
        assert_eq!(agreed.cipher_client_server, "aes128-ctr");
        assert_eq!(agreed.mac_client_server, "hmac-sha2-256");
        assert_eq!(agreed.compression_client_server, "none");
    }

    #[test]
    fn test_find_agreed_algorithms_disjoint_kex() {
        let mut rng = rand::thread_rng();
        let client = sample_kexinit();
        let server = KexInit::new(
            strings(&["curve25519-sha256"]),
            strings(&["ssh-rsa"]),
            strings(&["aes128-ctr"]),
            strings(&["hmac-sha1"]),
            &mut rng,
        );

        match find_agreed_algorithms(&client, &server) {
            Err(SkiffError::NoCommonAlgorithm(category)) => {
                assert_eq!(category, "key exchange");
            }
            other => panic!("expected NoCommonAlgorithm, got {:?}", other.err()),
        }
    }
}
