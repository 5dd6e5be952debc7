//! End-to-end client tests against a scripted peer.
//!
//! The "server" side of each test is a hand-driven transcript built from
//! the same wire primitives the client uses, run over an in-memory duplex
//! stream. The scripts assert on the exact packets the client emits, so
//! they double as a regression net for message ordering.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::BytesMut;
use rsa::traits::PublicKeyParts;
use rsa::Pkcs1v15Sign;
use sha1::{Digest, Sha1};
use tokio::io::{ReadHalf, WriteHalf};

use skiff_platform::{SkiffError, SkiffResult};
use skiff_proto::ssh::auth::UserauthRequest;
use skiff_proto::ssh::connection::{
    write_tcp_addr, ChannelData, ChannelExtendedData, ChannelOpen, ChannelOpenConfirmation,
    ChannelOpenFailure, ChannelOpenFailureReason, ChannelWindowAdjust, GlobalRequest,
    RequestSuccess,
};
use skiff_proto::ssh::kex::{strings, HandshakeMagics, KexInit, NewKeys};
use skiff_proto::ssh::kexdh::{
    dh_exchange_hash, dh_group14, ecdh_exchange_hash, DhExchange, EcdhExchange, HashAlg,
    KexDhInit, KexDhReply, KexEcdhInit, KexEcdhReply,
};
use skiff_proto::ssh::message::{Disconnect, MessageType, ServiceAccept, ServiceRequest};
use skiff_proto::ssh::pubkey::EcdsaCurve;
use skiff_proto::ssh::transport::{
    PendingAlgorithms, TransportReader, TransportWriter, CLIENT_KEYS, SERVER_KEYS,
};
use skiff_proto::ssh::version;
use skiff_proto::ssh::wire;
use skiff_proto::{ClientConfig, ClientConn, HostKeyChecker, PublicKey};

const SERVER_BANNER: &[u8] = b"SSH-2.0-Test";
const DIAL_ADDR: &str = "test.example:22";

/// Records every host-key check the client makes.
struct RecordingChecker {
    calls: Arc<AtomicUsize>,
    last_dial_addr: Arc<Mutex<String>>,
}

#[async_trait]
impl HostKeyChecker for RecordingChecker {
    async fn check(
        &self,
        dial_addr: &str,
        _remote_addr: Option<SocketAddr>,
        algo: &str,
        host_key: &[u8],
    ) -> SkiffResult<()> {
        assert_eq!(algo, "ssh-rsa");
        assert!(PublicKey::parse(host_key).is_ok());
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_dial_addr.lock().unwrap() = dial_addr.to_string();
        Ok(())
    }
}

/// The scripted peer: a server-side transport over one half of a duplex
/// stream, plus the RSA host key it presents.
struct ScriptedServer {
    reader: TransportReader<ReadHalf<tokio::io::DuplexStream>>,
    writer: TransportWriter<WriteHalf<tokio::io::DuplexStream>>,
    host_private: rsa::RsaPrivateKey,
    host_key_blob: Vec<u8>,
}

impl ScriptedServer {
    async fn start(stream: tokio::io::DuplexStream) -> Self {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        // A comment line precedes the banner; the client must skip it.
        version::write_version(&mut write_half, b"welcome to the test peer\r\nSSH-2.0-Test")
            .await
            .unwrap();
        let client_banner = version::read_version(&mut read_half).await.unwrap();
        assert!(client_banner.starts_with(b"SSH-2.0-"));

        let host_private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let host_public = host_private.to_public_key();
        let host_key_blob = PublicKey::Rsa {
            e: host_public.e().to_bytes_be(),
            n: host_public.n().to_bytes_be(),
        }
        .marshal();

        Self {
            reader: TransportReader::new(read_half, CLIENT_KEYS),
            writer: TransportWriter::new(write_half, SERVER_KEYS),
            host_private,
            host_key_blob,
        }
    }

    fn server_kexinit(kex_algos: &[&str]) -> KexInit {
        KexInit::new(
            strings(kex_algos),
            strings(&["ssh-rsa"]),
            strings(&["aes128-ctr"]),
            strings(&["hmac-sha2-256"]),
            &mut rand::thread_rng(),
        )
    }

    fn sign_exchange_hash(&self, h: &[u8]) -> Vec<u8> {
        let digest = Sha1::digest(h);
        let sig = self
            .host_private
            .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
            .unwrap();
        let mut body = BytesMut::new();
        wire::write_string(&mut body, b"ssh-rsa");
        wire::write_string(&mut body, &sig);
        body.to_vec()
    }

    fn pending() -> PendingAlgorithms {
        PendingAlgorithms {
            cipher: "aes128-ctr".to_string(),
            mac: "hmac-sha2-256".to_string(),
            compression: "none".to_string(),
        }
    }

    /// Runs the KEXINIT exchange and returns the handshake magics together
    /// with the client's KEXINIT.
    async fn exchange_kexinit(
        &mut self,
        client_banner: &[u8],
        kex_algos: &[&str],
    ) -> (HandshakeMagics, KexInit) {
        let server_kexinit = Self::server_kexinit(kex_algos);
        let server_bytes = server_kexinit.to_bytes();
        self.writer.write_packet(&server_bytes).await.unwrap();

        let client_bytes = self.reader.read_packet().await.unwrap();
        assert_eq!(client_bytes[0], MessageType::KexInit as u8);
        let client_kexinit = KexInit::from_bytes(&client_bytes).unwrap();

        let magics = HandshakeMagics {
            client_version: client_banner.to_vec(),
            server_version: SERVER_BANNER.to_vec(),
            client_kex_init: client_bytes,
            server_kex_init: server_bytes,
        };
        (magics, client_kexinit)
    }

    /// Serves an ECDH P-256 exchange and completes the NEWKEYS switchover.
    async fn serve_ecdh(&mut self, magics: &HandshakeMagics) -> Vec<u8> {
        let init_bytes = self.reader.read_packet().await.unwrap();
        assert_eq!(init_bytes[0], MessageType::KexdhInit as u8);
        let init = KexEcdhInit::from_bytes(&init_bytes).unwrap();

        let exchange = EcdhExchange::new(EcdsaCurve::NistP256);
        let server_pub = exchange.public_bytes();
        let secret = exchange.shared_secret(&init.client_pub).unwrap();
        let k_mpint = wire::mpint_bytes(&secret);

        let h = ecdh_exchange_hash(
            HashAlg::Sha256,
            magics,
            &self.host_key_blob,
            &init.client_pub,
            &server_pub,
            &k_mpint,
        );

        let reply = KexEcdhReply {
            host_key: self.host_key_blob.clone(),
            server_pub,
            signature: self.sign_exchange_hash(&h),
        };
        self.writer.write_packet(&reply.to_bytes()).await.unwrap();
        self.writer.write_packet(&NewKeys.to_bytes()).await.unwrap();

        self.install_keys(&k_mpint, &h, HashAlg::Sha256).await;
        h
    }

    /// Serves a group14 exchange and completes the NEWKEYS switchover.
    async fn serve_dh14(&mut self, magics: &HandshakeMagics) -> Vec<u8> {
        let init_bytes = self.reader.read_packet().await.unwrap();
        let init = KexDhInit::from_bytes(&init_bytes).unwrap();

        let exchange = DhExchange::new(dh_group14(), &mut rand::thread_rng());
        let k = exchange.shared_secret(&init.e).unwrap();
        let k_mpint = wire::mpint_bytes(&k.to_bytes_be());

        let h = dh_exchange_hash(
            HashAlg::Sha1,
            magics,
            &self.host_key_blob,
            &init.e,
            &exchange.public,
            &k_mpint,
        );

        let reply = KexDhReply {
            host_key: self.host_key_blob.clone(),
            y: exchange.public.clone(),
            signature: self.sign_exchange_hash(&h),
        };
        self.writer.write_packet(&reply.to_bytes()).await.unwrap();
        self.writer.write_packet(&NewKeys.to_bytes()).await.unwrap();

        self.install_keys(&k_mpint, &h, HashAlg::Sha1).await;
        h
    }

    /// Installs keys after reading the client's NEWKEYS.
    async fn install_keys(&mut self, k_mpint: &[u8], h: &[u8], hash: HashAlg) {
        self.writer.set_pending_algorithms(Self::pending());
        self.writer.setup_keys(k_mpint, h, h, hash).unwrap();

        let newkeys = self.reader.read_packet().await.unwrap();
        assert_eq!(newkeys, vec![MessageType::NewKeys as u8]);
        self.reader.set_pending_algorithms(Self::pending());
        self.reader.setup_keys(k_mpint, h, h, hash).unwrap();
    }

    /// Accepts the userauth service request and the "none" probe.
    async fn serve_auth(&mut self) {
        let packet = self.reader.read_packet().await.unwrap();
        let request = ServiceRequest::from_bytes(&packet).unwrap();
        assert_eq!(request.service, "ssh-userauth");
        self.writer
            .write_packet(
                &ServiceAccept {
                    service: "ssh-userauth".to_string(),
                }
                .to_bytes(),
            )
            .await
            .unwrap();

        let packet = self.reader.read_packet().await.unwrap();
        let request = UserauthRequest::from_bytes(&packet).unwrap();
        assert_eq!(request.method, "none");
        assert_eq!(request.user, "deploy");
        self.writer
            .write_packet(&[MessageType::UserauthSuccess as u8])
            .await
            .unwrap();
    }
}

fn test_config(checker: Option<Box<dyn HostKeyChecker>>) -> ClientConfig {
    ClientConfig {
        user: "deploy".to_string(),
        host_key_checker: checker,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn ecdh_handshake_and_forwarded_channels() {
    let (client_stream, server_stream) = tokio::io::duplex(65536);

    let checker_calls = Arc::new(AtomicUsize::new(0));
    let checker_addr = Arc::new(Mutex::new(String::new()));
    let checker = RecordingChecker {
        calls: Arc::clone(&checker_calls),
        last_dial_addr: Arc::clone(&checker_addr),
    };

    let server = tokio::spawn(async move {
        let mut server = ScriptedServer::start(server_stream).await;
        let (magics, client_kexinit) = server
            .exchange_kexinit(b"SSH-2.0-Skiff", &["ecdh-sha2-nistp256"])
            .await;
        assert_eq!(client_kexinit.kex_algos[0], "ecdh-sha2-nistp256");
        server.serve_ecdh(&magics).await;
        server.serve_auth().await;

        // Global request for the remote forward.
        let packet = server.reader.read_packet().await.unwrap();
        let request = GlobalRequest::from_bytes(&packet).unwrap();
        assert_eq!(request.request, "tcpip-forward");
        assert!(request.want_reply);
        server
            .writer
            .write_packet(&RequestSuccess { payload: vec![] }.to_bytes())
            .await
            .unwrap();

        // An open for an address nobody asked us to forward must be
        // refused with CONNECT_FAILED while the connection stays up.
        let mut bogus = BytesMut::new();
        write_tcp_addr(&mut bogus, &"127.0.0.1".parse().unwrap(), 9999);
        write_tcp_addr(&mut bogus, &"192.0.2.7".parse().unwrap(), 50000);
        server
            .writer
            .write_packet(
                &ChannelOpen {
                    chan_type: "forwarded-tcpip".to_string(),
                    peers_id: 7,
                    peers_window: 4096,
                    max_packet_size: 16384,
                    type_specific_data: bogus.to_vec(),
                }
                .to_bytes(),
            )
            .await
            .unwrap();

        let packet = server.reader.read_packet().await.unwrap();
        let failure = ChannelOpenFailure::from_bytes(&packet).unwrap();
        assert_eq!(failure.peers_id, 7);
        assert_eq!(failure.reason, ChannelOpenFailureReason::ConnectionFailed);

        // The registered forward is accepted.
        let mut good = BytesMut::new();
        write_tcp_addr(&mut good, &"127.0.0.1".parse().unwrap(), 8080);
        write_tcp_addr(&mut good, &"192.0.2.7".parse().unwrap(), 50001);
        server
            .writer
            .write_packet(
                &ChannelOpen {
                    chan_type: "forwarded-tcpip".to_string(),
                    peers_id: 8,
                    peers_window: 4096,
                    max_packet_size: 16384,
                    type_specific_data: good.to_vec(),
                }
                .to_bytes(),
            )
            .await
            .unwrap();

        let packet = server.reader.read_packet().await.unwrap();
        let confirm = ChannelOpenConfirmation::from_bytes(&packet).unwrap();
        assert_eq!(confirm.peers_id, 8);
        assert_eq!(confirm.my_window, 1 << 14);
        assert_eq!(confirm.max_packet_size, 1 << 15);
        let client_chan_id = confirm.my_id;

        // stdout data.
        server
            .writer
            .write_packet(
                &ChannelData {
                    peers_id: client_chan_id,
                    data: b"hello".to_vec(),
                }
                .to_bytes(),
            )
            .await
            .unwrap();

        // The client returns consumed bytes as window credit.
        let packet = server.reader.read_packet().await.unwrap();
        let adjust = ChannelWindowAdjust::from_bytes(&packet).unwrap();
        assert_eq!(adjust.peers_id, 8);
        assert_eq!(adjust.additional_bytes, 5);

        // Extended data with an unknown type code, then real stderr.
        server
            .writer
            .write_packet(
                &ChannelExtendedData {
                    peers_id: client_chan_id,
                    data_type: 2,
                    data: b"discard me".to_vec(),
                }
                .to_bytes(),
            )
            .await
            .unwrap();
        server
            .writer
            .write_packet(
                &ChannelExtendedData {
                    peers_id: client_chan_id,
                    data_type: 1,
                    data: b"errbytes".to_vec(),
                }
                .to_bytes(),
            )
            .await
            .unwrap();

        let packet = server.reader.read_packet().await.unwrap();
        let adjust = ChannelWindowAdjust::from_bytes(&packet).unwrap();
        assert_eq!(adjust.additional_bytes, 8);

        // Client writes flow back to us against the granted window.
        let packet = server.reader.read_packet().await.unwrap();
        assert_eq!(packet[0], MessageType::ChannelData as u8);
        let mut offset = 1;
        assert_eq!(wire::read_u32(&packet, &mut offset).unwrap(), 8);
        assert_eq!(wire::read_string(&packet, &mut offset).unwrap(), b"ping");
    });

    let conn = ClientConn::connect(client_stream, DIAL_ADDR, test_config(Some(Box::new(checker))))
        .await
        .unwrap();

    assert_eq!(checker_calls.load(Ordering::SeqCst), 1);
    assert_eq!(checker_addr.lock().unwrap().as_str(), DIAL_ADDR);
    assert_eq!(conn.server_version(), "SSH-2.0-Test");
    assert_eq!(conn.session_id().len(), 32);

    let mut acceptor = conn
        .request_port_forward("127.0.0.1".parse().unwrap(), 8080)
        .await
        .unwrap();

    let mut forward = acceptor.accept().await.unwrap();
    assert_eq!(forward.originator, ("192.0.2.7".parse().unwrap(), 50001));

    let mut buf = [0u8; 64];
    let n = forward.channel.read_stdout(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello");

    let n = forward.channel.read_stderr(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"errbytes");

    forward.channel.write(b"ping").await.unwrap();

    server.await.unwrap();
}

#[tokio::test]
async fn handshake_rejects_wrong_signature_format() {
    let (client_stream, server_stream) = tokio::io::duplex(65536);

    let server = tokio::spawn(async move {
        let mut server = ScriptedServer::start(server_stream).await;
        let (magics, _) = server
            .exchange_kexinit(b"SSH-2.0-Skiff", &["ecdh-sha2-nistp256"])
            .await;

        // A well-formed reply whose signature claims ssh-dss.
        let init_bytes = server.reader.read_packet().await.unwrap();
        let init = KexEcdhInit::from_bytes(&init_bytes).unwrap();
        let exchange = EcdhExchange::new(EcdsaCurve::NistP256);
        let server_pub = exchange.public_bytes();
        let secret = exchange.shared_secret(&init.client_pub).unwrap();
        let k_mpint = wire::mpint_bytes(&secret);
        let _h = ecdh_exchange_hash(
            HashAlg::Sha256,
            &magics,
            &server.host_key_blob,
            &init.client_pub,
            &server_pub,
            &k_mpint,
        );

        let mut body = BytesMut::new();
        wire::write_string(&mut body, b"ssh-dss");
        wire::write_string(&mut body, &[0xee; 40]);
        let reply = KexEcdhReply {
            host_key: server.host_key_blob.clone(),
            server_pub,
            signature: body.to_vec(),
        };
        server.writer.write_packet(&reply.to_bytes()).await.unwrap();
    });

    let result = ClientConn::connect(client_stream, DIAL_ADDR, test_config(None)).await;
    assert!(matches!(result, Err(SkiffError::HostKeyRejected(_))));

    server.await.unwrap();
}

#[tokio::test]
async fn dh_group14_handshake() {
    let (client_stream, server_stream) = tokio::io::duplex(65536);

    let server = tokio::spawn(async move {
        let mut server = ScriptedServer::start(server_stream).await;
        let (magics, client_kexinit) = server
            .exchange_kexinit(b"SSH-2.0-Skiff", &["diffie-hellman-group14-sha1"])
            .await;
        // The client leads with the curves; the group is still common.
        assert!(client_kexinit
            .kex_algos
            .contains(&"diffie-hellman-group14-sha1".to_string()));
        server.serve_dh14(&magics).await;
        server.serve_auth().await;

        // Tear the session down from the server side.
        server
            .writer
            .write_packet(
                &Disconnect {
                    reason_code: 11,
                    description: "bye".to_string(),
                    language_tag: String::new(),
                }
                .to_bytes(),
            )
            .await
            .unwrap();
    });

    let conn = ClientConn::connect(client_stream, DIAL_ADDR, test_config(None))
        .await
        .unwrap();

    // SHA-1 exchange hash.
    assert_eq!(conn.session_id().len(), 20);

    server.await.unwrap();
    conn.wait_closed().await;
}
