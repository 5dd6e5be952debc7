//! The SSH client connection: handshake, connection loop, and the
//! application-facing API.
//!
//! [`ClientConn::connect`] performs the strictly sequential handshake
//! (banner exchange, algorithm negotiation, key exchange, host-key
//! verification, NEWKEYS, user authentication) and then spawns the
//! connection loop, which demultiplexes every inbound packet into
//! per-channel state. From that point any number of tasks may open
//! channels, write channel data, and issue global requests concurrently;
//! writes serialize on the transport-write lock, one packet at a time.

use async_trait::async_trait;
use bytes::BytesMut;
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ssh::auth::{self, AuthMethod, AuthTransport};
use crate::ssh::channel::{
    make_channel, ChannelCore, ChannelEntry, ChannelState, ClientChannel, ControlMsg, DataEvent,
};
use crate::ssh::cipher::{DEFAULT_CIPHER_ORDER, DEFAULT_MAC_ORDER};
use crate::ssh::connection::{
    parse_tcp_addr, write_tcp_addr, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure,
    ChannelOpenFailureReason, GlobalRequest, RequestFailure, RequestSuccess, CHANNEL_MAX_PACKET,
    CHANNEL_WINDOW, MIN_CHANNEL_PACKET,
};
use crate::ssh::forward::{Forward, ForwardAccept, ForwardList};
use crate::ssh::kex::{
    find_agreed_algorithms, strings, AgreedAlgorithms, HandshakeMagics, KexInit, NewKeys,
    SUPPORTED_HOST_KEY_ALGOS,
};
use crate::ssh::kexdh::{
    dh_exchange_hash, dh_group1, dh_group14, ecdh_exchange_hash, kex_hash_alg, DhExchange,
    EcdhExchange, KexDhInit, KexDhReply, KexEcdhInit, KexEcdhReply, KexResult,
    DEFAULT_KEY_EXCHANGE_ORDER, KEX_ALGO_DH14_SHA1, KEX_ALGO_DH1_SHA1, KEX_ALGO_ECDH256,
    KEX_ALGO_ECDH384, KEX_ALGO_ECDH521,
};
use crate::ssh::message::{self, Message, MessageType};
use crate::ssh::pubkey::{EcdsaCurve, PublicKey, Signature};
use crate::ssh::transport::{
    PendingAlgorithms, TransportReader, TransportWriter, CLIENT_KEYS, SERVER_KEYS,
};
use crate::ssh::version;
use crate::ssh::wire;

/// Default client identification banner.
pub const DEFAULT_CLIENT_VERSION: &str = "SSH-2.0-Skiff";

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Collaborator consulted after the host-key signature has been verified.
/// Absent a checker, every host key is accepted.
#[async_trait]
pub trait HostKeyChecker: Send + Sync {
    /// Accepts or refuses the host key. `dial_addr` is the address the
    /// application dialed; `remote_addr` the peer's network address when
    /// the stream has one.
    async fn check(
        &self,
        dial_addr: &str,
        remote_addr: Option<SocketAddr>,
        algo: &str,
        host_key: &[u8],
    ) -> SkiffResult<()>;
}

/// Cryptographic preference lists. Empty lists select the defaults.
#[derive(Default)]
pub struct CryptoConfig {
    /// Preferred key-exchange algorithms.
    pub key_exchanges: Vec<String>,
    /// Preferred ciphers, both directions.
    pub ciphers: Vec<String>,
    /// Preferred MACs, both directions.
    pub macs: Vec<String>,
}

impl CryptoConfig {
    fn kexes(&self) -> Vec<String> {
        if self.key_exchanges.is_empty() {
            strings(DEFAULT_KEY_EXCHANGE_ORDER)
        } else {
            self.key_exchanges.clone()
        }
    }

    fn ciphers(&self) -> Vec<String> {
        if self.ciphers.is_empty() {
            strings(DEFAULT_CIPHER_ORDER)
        } else {
            self.ciphers.clone()
        }
    }

    fn macs(&self) -> Vec<String> {
        if self.macs.is_empty() {
            strings(DEFAULT_MAC_ORDER)
        } else {
            self.macs.clone()
        }
    }
}

/// Client connection configuration.
#[derive(Default)]
pub struct ClientConfig {
    /// User name handed to the authentication methods.
    pub user: String,
    /// Authentication methods, tried in order after the "none" probe; only
    /// the first instance of each RFC 4252 method name is used.
    pub auth: Vec<Box<dyn AuthMethod>>,
    /// Host-key checker; `None` accepts every host key.
    pub host_key_checker: Option<Box<dyn HostKeyChecker>>,
    /// Algorithm preferences.
    pub crypto: CryptoConfig,
    /// Identification banner override.
    pub client_version: Option<String>,
    /// Entropy source for the KEXINIT cookie and DH secrets; the platform
    /// CSPRNG when absent. ECDH ephemerals always draw from the platform
    /// CSPRNG through the curve crates.
    pub rand: Option<Box<dyn RngCore + Send>>,
}

enum GlobalReply {
    Success(RequestSuccess),
    Failure,
}

/// Clones of one channel's routing endpoints, taken under the table lock
/// and used after it is released.
struct ChannelRoute {
    core: Arc<ChannelCore>,
    stdout: mpsc::Sender<DataEvent>,
    stderr: mpsc::Sender<DataEvent>,
    control: mpsc::UnboundedSender<ControlMsg>,
}

struct ChanList {
    chans: Vec<Option<ChannelEntry>>,
}

/// Connection state shared between the connection loop and application
/// tasks.
pub(crate) struct ConnShared {
    writer: Mutex<TransportWriter<BoxedWrite>>,
    chans: Mutex<ChanList>,
    pub(crate) forwards: ForwardList,
    global_reply_tx: mpsc::Sender<GlobalReply>,
    global_slot: Mutex<mpsc::Receiver<GlobalReply>>,
}

impl ConnShared {
    /// Writes one packet, holding the transport-write lock for the
    /// duration of the emission.
    pub(crate) async fn write_packet(&self, payload: &[u8]) -> SkiffResult<()> {
        self.writer.lock().await.write_packet(payload).await
    }

    /// Allocates the lowest free local id and installs a fresh channel.
    pub(crate) async fn new_channel(self: &Arc<Self>, state: ChannelState) -> ClientChannel {
        let mut chans = self.chans.lock().await;
        let slot = match chans.chans.iter().position(|c| c.is_none()) {
            Some(i) => i,
            None => {
                chans.chans.push(None);
                chans.chans.len() - 1
            }
        };
        let (entry, handle) = make_channel(slot as u32, state, Arc::clone(self));
        chans.chans[slot] = Some(entry);
        handle
    }

    /// Drops a channel's table entry, closing its mailbox and streams.
    pub(crate) async fn remove_channel(&self, id: u32) {
        let mut chans = self.chans.lock().await;
        if let Some(slot) = chans.chans.get_mut(id as usize) {
            *slot = None;
        }
    }

    async fn route(&self, id: u32) -> Option<ChannelRoute> {
        let chans = self.chans.lock().await;
        chans
            .chans
            .get(id as usize)
            .and_then(|slot| slot.as_ref())
            .map(|entry| ChannelRoute {
                core: Arc::clone(&entry.core),
                stdout: entry.stdout.clone(),
                stderr: entry.stderr.clone(),
                control: entry.control.clone(),
            })
    }

    async fn take_channel(&self, id: u32) -> Option<ChannelEntry> {
        let mut chans = self.chans.lock().await;
        chans.chans.get_mut(id as usize).and_then(|slot| slot.take())
    }
}

/// The client side of an established SSH connection.
pub struct ClientConn {
    shared: Arc<ConnShared>,
    session_id: Vec<u8>,
    server_version: String,
    loop_handle: JoinHandle<()>,
}

impl ClientConn {
    /// Dials `addr` over TCP and establishes a connection.
    pub async fn dial(addr: &str, config: ClientConfig) -> SkiffResult<Self> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        let peer_addr = stream.peer_addr().ok();
        Self::connect_with_peer_addr(stream, addr, peer_addr, config).await
    }

    /// Establishes a connection over an arbitrary reliable byte stream.
    /// `dial_addr` is reported to the host-key checker.
    pub async fn connect<S>(stream: S, dial_addr: &str, config: ClientConfig) -> SkiffResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::connect_with_peer_addr(stream, dial_addr, None, config).await
    }

    async fn connect_with_peer_addr<S>(
        stream: S,
        dial_addr: &str,
        peer_addr: Option<SocketAddr>,
        mut config: ClientConfig,
    ) -> SkiffResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut rng: Box<dyn RngCore + Send> = config
            .rand
            .take()
            .unwrap_or_else(|| Box::new(rand::rngs::OsRng));

        let banner = config
            .client_version
            .clone()
            .unwrap_or_else(|| DEFAULT_CLIENT_VERSION.to_string());

        let (read_half, write_half) = tokio::io::split(stream);
        let mut read_half: BoxedRead = Box::new(read_half);
        let mut write_half: BoxedWrite = Box::new(write_half);

        version::write_version(&mut write_half, banner.as_bytes()).await?;
        let server_banner = version::read_version(&mut read_half).await?;

        let mut magics = HandshakeMagics {
            client_version: banner.into_bytes(),
            server_version: server_banner,
            client_kex_init: vec![],
            server_kex_init: vec![],
        };

        let mut reader = TransportReader::new(read_half, SERVER_KEYS);
        let mut writer = TransportWriter::new(write_half, CLIENT_KEYS);

        let result = handshake(
            &mut reader,
            &mut writer,
            &mut magics,
            &config,
            rng.as_mut(),
            dial_addr,
            peer_addr,
        )
        .await?;

        let mut auth_transport = AuthTransport::new(&mut reader, &mut writer);
        auth::authenticate(&mut auth_transport, &config.user, &config.auth, &result.h).await?;

        let (global_reply_tx, global_rx) = mpsc::channel(1);
        let shared = Arc::new(ConnShared {
            writer: Mutex::new(writer),
            chans: Mutex::new(ChanList { chans: Vec::new() }),
            forwards: ForwardList::new(),
            global_reply_tx,
            global_slot: Mutex::new(global_rx),
        });

        let loop_shared = Arc::clone(&shared);
        let loop_handle = tokio::spawn(async move {
            main_loop(reader, loop_shared).await;
        });

        Ok(Self {
            shared,
            session_id: result.h,
            server_version: String::from_utf8_lossy(&magics.server_version).into_owned(),
            loop_handle,
        })
    }

    /// The session identifier: H of the first key exchange.
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    /// The server's identification banner.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Opens a "session" channel and waits for the peer's confirmation.
    pub async fn open_session(&self) -> SkiffResult<ClientChannel> {
        let mut channel = self.shared.new_channel(ChannelState::Opening).await;
        let open = ChannelOpen {
            chan_type: "session".to_string(),
            peers_id: channel.local_id(),
            peers_window: CHANNEL_WINDOW,
            max_packet_size: CHANNEL_MAX_PACKET,
            type_specific_data: vec![],
        };
        self.shared.write_packet(&open.to_bytes()).await?;
        channel.wait_open().await?;
        Ok(channel)
    }

    /// Sends a global request and waits for the peer's answer. Only one
    /// global request is in flight at a time; the internal lock is held
    /// across the reply wait.
    pub async fn send_global_request(&self, request: &GlobalRequest) -> SkiffResult<RequestSuccess> {
        let mut slot = self.shared.global_slot.lock().await;
        self.shared.write_packet(&request.to_bytes()).await?;
        match slot.recv().await {
            Some(GlobalReply::Success(success)) => Ok(success),
            Some(GlobalReply::Failure) | None => Err(SkiffError::RequestFailed),
        }
    }

    /// Asks the server to listen on `addr:port` and forward accepted TCP
    /// connections to us. Port 0 lets the server choose; the bound port is
    /// taken from the reply.
    pub async fn request_port_forward(
        &self,
        addr: IpAddr,
        port: u32,
    ) -> SkiffResult<ForwardAccept> {
        let mut payload = BytesMut::new();
        write_tcp_addr(&mut payload, &addr, port);
        let reply = self
            .send_global_request(&GlobalRequest {
                request: "tcpip-forward".to_string(),
                want_reply: true,
                payload: payload.to_vec(),
            })
            .await?;

        let bound_port = if port == 0 {
            let mut offset = 0;
            wire::read_u32(&reply.payload, &mut offset)?
        } else {
            port
        };
        Ok(self.shared.forwards.register(addr, bound_port).await)
    }

    /// Cancels a forwarding previously established with
    /// [`request_port_forward`](Self::request_port_forward).
    pub async fn cancel_port_forward(&self, addr: IpAddr, port: u32) -> SkiffResult<()> {
        let mut payload = BytesMut::new();
        write_tcp_addr(&mut payload, &addr, port);
        self.send_global_request(&GlobalRequest {
            request: "cancel-tcpip-forward".to_string(),
            want_reply: true,
            payload: payload.to_vec(),
        })
        .await?;
        self.shared.forwards.remove(addr, port).await;
        Ok(())
    }

    /// Closes the underlying stream. The connection loop observes the
    /// closure and tears down every channel and forward queue.
    pub async fn close(&self) -> SkiffResult<()> {
        self.shared.writer.lock().await.shutdown().await
    }

    /// Waits until the connection loop has exited and teardown finished.
    pub async fn wait_closed(self) {
        let _ = self.loop_handle.await;
    }
}

/// The client half of the RFC 4253 Section 7 handshake.
#[allow(clippy::too_many_arguments)]
async fn handshake(
    reader: &mut TransportReader<BoxedRead>,
    writer: &mut TransportWriter<BoxedWrite>,
    magics: &mut HandshakeMagics,
    config: &ClientConfig,
    rng: &mut (dyn RngCore + Send),
    dial_addr: &str,
    peer_addr: Option<SocketAddr>,
) -> SkiffResult<KexResult> {
    let client_kex_init = KexInit::new(
        config.crypto.kexes(),
        strings(SUPPORTED_HOST_KEY_ALGOS),
        config.crypto.ciphers(),
        config.crypto.macs(),
        rng,
    );
    magics.client_kex_init = client_kex_init.to_bytes();
    writer.write_packet(&magics.client_kex_init).await?;

    let server_packet = reader.read_packet().await?;
    let server_kex_init = KexInit::from_bytes(&server_packet)?;
    magics.server_kex_init = server_packet;

    let agreed = find_agreed_algorithms(&client_kex_init, &server_kex_init)?;
    writer.set_pending_algorithms(PendingAlgorithms {
        cipher: agreed.cipher_client_server.clone(),
        mac: agreed.mac_client_server.clone(),
        compression: agreed.compression_client_server.clone(),
    });
    reader.set_pending_algorithms(PendingAlgorithms {
        cipher: agreed.cipher_server_client.clone(),
        mac: agreed.mac_server_client.clone(),
        compression: agreed.compression_server_client.clone(),
    });

    // The server guessed a KEX algorithm and sent its first packet early;
    // a wrong guess must be discarded (RFC 4253 Section 7).
    if server_kex_init.first_kex_follows
        && server_kex_init.kex_algos.first() != Some(&agreed.kex)
    {
        reader.read_packet().await?;
    }

    let result = run_kex(reader, writer, magics, &agreed, rng).await?;

    verify_host_key_signature(&agreed.host_key, &result)?;

    if let Some(checker) = &config.host_key_checker {
        checker
            .check(dial_addr, peer_addr, &agreed.host_key, &result.host_key)
            .await?;
    }

    writer.write_packet(&NewKeys.to_bytes()).await?;
    writer.setup_keys(&result.k_mpint, &result.h, &result.h, result.hash)?;

    let packet = reader.read_packet().await?;
    if packet.first() != Some(&(MessageType::NewKeys as u8)) {
        return Err(SkiffError::UnexpectedMessage {
            expected: MessageType::NewKeys as u8,
            got: packet.first().copied().unwrap_or(0),
        });
    }
    reader.setup_keys(&result.k_mpint, &result.h, &result.h, result.hash)?;

    Ok(result)
}

async fn run_kex(
    reader: &mut TransportReader<BoxedRead>,
    writer: &mut TransportWriter<BoxedWrite>,
    magics: &HandshakeMagics,
    agreed: &AgreedAlgorithms,
    rng: &mut (dyn RngCore + Send),
) -> SkiffResult<KexResult> {
    match agreed.kex.as_str() {
        KEX_ALGO_ECDH256 => kex_ecdh(EcdsaCurve::NistP256, reader, writer, magics, &agreed.kex).await,
        KEX_ALGO_ECDH384 => kex_ecdh(EcdsaCurve::NistP384, reader, writer, magics, &agreed.kex).await,
        KEX_ALGO_ECDH521 => kex_ecdh(EcdsaCurve::NistP521, reader, writer, magics, &agreed.kex).await,
        KEX_ALGO_DH14_SHA1 => kex_dh(dh_group14(), reader, writer, magics, &agreed.kex, rng).await,
        KEX_ALGO_DH1_SHA1 => kex_dh(dh_group1(), reader, writer, magics, &agreed.kex, rng).await,
        other => Err(SkiffError::Config(format!(
            "negotiated unimplemented key exchange '{}'",
            other
        ))),
    }
}

/// ECDH key exchange (RFC 5656 Section 4).
async fn kex_ecdh(
    curve: EcdsaCurve,
    reader: &mut TransportReader<BoxedRead>,
    writer: &mut TransportWriter<BoxedWrite>,
    magics: &HandshakeMagics,
    kex_algo: &str,
) -> SkiffResult<KexResult> {
    let hash = kex_hash_alg(kex_algo)
        .ok_or_else(|| SkiffError::Config(format!("no hash for '{}'", kex_algo)))?;

    let exchange = EcdhExchange::new(curve);
    let client_pub = exchange.public_bytes();
    let init = KexEcdhInit {
        client_pub: client_pub.clone(),
    };
    writer.write_packet(&init.to_bytes()).await?;

    let packet = reader.read_packet().await?;
    let reply = KexEcdhReply::from_bytes(&packet)?;

    let secret = exchange.shared_secret(&reply.server_pub)?;
    let k_mpint = wire::mpint_bytes(&secret);
    let h = ecdh_exchange_hash(
        hash,
        magics,
        &reply.host_key,
        &client_pub,
        &reply.server_pub,
        &k_mpint,
    );

    Ok(KexResult {
        h,
        k_mpint,
        host_key: reply.host_key,
        signature: reply.signature,
        hash,
    })
}

/// Classic Diffie-Hellman key exchange (RFC 4253 Section 8).
async fn kex_dh(
    group: &'static crate::ssh::kexdh::DhGroup,
    reader: &mut TransportReader<BoxedRead>,
    writer: &mut TransportWriter<BoxedWrite>,
    magics: &HandshakeMagics,
    kex_algo: &str,
    rng: &mut (dyn RngCore + Send),
) -> SkiffResult<KexResult> {
    let hash = kex_hash_alg(kex_algo)
        .ok_or_else(|| SkiffError::Config(format!("no hash for '{}'", kex_algo)))?;

    let exchange = DhExchange::new(group, rng);
    let init = KexDhInit {
        e: exchange.public.clone(),
    };
    writer.write_packet(&init.to_bytes()).await?;

    let packet = reader.read_packet().await?;
    let reply = KexDhReply::from_bytes(&packet)?;

    let k = exchange.shared_secret(&reply.y)?;
    let k_mpint = wire::mpint_bytes(&k.to_bytes_be());
    let h = dh_exchange_hash(
        hash,
        magics,
        &reply.host_key,
        &exchange.public,
        &reply.y,
        &k_mpint,
    );

    Ok(KexResult {
        h,
        k_mpint,
        host_key: reply.host_key,
        signature: reply.signature,
        hash,
    })
}

/// Verifies the server's signature over the exchange hash. The signature's
/// format string must equal the negotiated host-key algorithm.
fn verify_host_key_signature(host_key_algo: &str, result: &KexResult) -> SkiffResult<()> {
    let host_key = PublicKey::parse(&result.host_key)
        .map_err(|_| SkiffError::HostKeyRejected("could not parse host key".to_string()))?;

    let mut offset = 0;
    let sig = Signature::read_body(&result.signature, &mut offset)
        .map_err(|_| SkiffError::HostKeyRejected("signature parse error".to_string()))?;
    if offset != result.signature.len() {
        return Err(SkiffError::HostKeyRejected(
            "trailing bytes after signature".to_string(),
        ));
    }

    if sig.format != host_key_algo {
        return Err(SkiffError::HostKeyRejected(format!(
            "unexpected signature type '{}'",
            sig.format
        )));
    }

    if !host_key.verify(&result.h, &sig.blob)? {
        return Err(SkiffError::HostKeyRejected(
            "host key signature error".to_string(),
        ));
    }
    Ok(())
}

/// The connection loop: reads packets and routes them until the stream
/// fails, the peer disconnects, or an invariant breaks; then tears down
/// every channel and forward queue.
async fn main_loop(mut reader: TransportReader<BoxedRead>, shared: Arc<ConnShared>) {
    match run_loop(&mut reader, &shared).await {
        Ok(()) => debug!("connection loop: peer disconnected"),
        Err(err) => debug!("connection loop exited: {}", err),
    }

    let _ = shared.writer.lock().await.shutdown().await;

    let entries: Vec<ChannelEntry> = {
        let mut chans = shared.chans.lock().await;
        chans.chans.iter_mut().filter_map(|slot| slot.take()).collect()
    };
    for entry in entries {
        entry.core.set_state(ChannelState::Closed);
        entry.core.send_window.close().await;
        let _ = entry.control.send(ControlMsg::Close);
    }

    shared.forwards.close_all().await;
}

async fn run_loop(
    reader: &mut TransportReader<BoxedRead>,
    shared: &Arc<ConnShared>,
) -> SkiffResult<()> {
    loop {
        let packet = reader.read_packet().await?;
        let Some(&msg_type) = packet.first() else {
            continue;
        };

        // Channel data stays on a hand-parsed hot path; everything else
        // goes through the typed decoder.
        if msg_type == MessageType::ChannelData as u8 {
            handle_channel_data(shared, &packet).await?;
            continue;
        }
        if msg_type == MessageType::ChannelExtendedData as u8 {
            handle_extended_data(shared, &packet).await?;
            continue;
        }

        let msg = match message::decode(&packet) {
            Ok(msg) => msg,
            Err(SkiffError::UnexpectedMessage { got, .. }) => {
                warn!("connection loop: unhandled message type {}", got);
                continue;
            }
            Err(err) => return Err(err),
        };

        match msg {
            Message::ChannelOpen(open) => handle_chan_open(shared, open).await?,
            Message::ChannelOpenConfirmation(confirm) => {
                let route = expect_route(shared, confirm.peers_id).await?;
                let _ = route.control.send(ControlMsg::OpenConfirm {
                    remote_id: confirm.my_id,
                    window: confirm.my_window,
                    max_packet: confirm.max_packet_size,
                });
            }
            Message::ChannelOpenFailure(failure) => {
                let route = expect_route(shared, failure.peers_id).await?;
                let _ = route.control.send(ControlMsg::OpenFailure {
                    reason: failure.reason,
                    message: failure.message,
                });
            }
            Message::ChannelWindowAdjust(adjust) => {
                let route = expect_route(shared, adjust.peers_id).await?;
                if !route.core.send_window.add(adjust.additional_bytes).await {
                    return Err(SkiffError::WindowOverflow);
                }
            }
            Message::ChannelEof(eof) => {
                let route = expect_route(shared, eof.peers_id).await?;
                let _ = route.stdout.send(DataEvent::Eof).await;
                let _ = route.stderr.send(DataEvent::Eof).await;
                let _ = route.control.send(ControlMsg::Eof);
            }
            Message::ChannelClose(close) => {
                if let Some(entry) = shared.take_channel(close.peers_id).await {
                    entry.core.set_state(ChannelState::Closed);
                    entry.core.send_window.close().await;
                    let _ = entry.control.send(ControlMsg::Close);
                }
            }
            Message::ChannelRequest(request) => {
                let route = expect_route(shared, request.peers_id).await?;
                let _ = route.control.send(ControlMsg::Request {
                    name: request.request,
                    want_reply: request.want_reply,
                    payload: request.payload,
                });
            }
            Message::ChannelSuccess(success) => {
                let route = expect_route(shared, success.peers_id).await?;
                let _ = route.control.send(ControlMsg::RequestSuccess);
            }
            Message::ChannelFailure(failure) => {
                let route = expect_route(shared, failure.peers_id).await?;
                let _ = route.control.send(ControlMsg::RequestFailure);
            }
            Message::GlobalRequest(request) => {
                // Peer keepalives land here; refusing them is all OpenSSH
                // expects.
                if request.want_reply {
                    shared.write_packet(&RequestFailure.to_bytes()).await?;
                }
            }
            Message::RequestSuccess(success) => {
                let _ = shared
                    .global_reply_tx
                    .send(GlobalReply::Success(success))
                    .await;
            }
            Message::RequestFailure(_) => {
                let _ = shared.global_reply_tx.send(GlobalReply::Failure).await;
            }
            Message::Disconnect(disconnect) => {
                info!(
                    reason = disconnect.reason_code,
                    "peer disconnected: {}",
                    wire::safe_string(&disconnect.description)
                );
                return Ok(());
            }
            Message::Debug(dbg) => {
                debug!("peer debug: {}", wire::safe_string(&dbg.message));
            }
            Message::Ignore(_) | Message::Unimplemented(_) => {}
            other => {
                warn!("connection loop: unhandled message {:?}", other);
            }
        }
    }
}

async fn handle_channel_data(shared: &Arc<ConnShared>, packet: &[u8]) -> SkiffResult<()> {
    if packet.len() < 9 {
        return Err(SkiffError::MalformedMessage(
            "short CHANNEL_DATA packet".to_string(),
        ));
    }
    let mut offset = 1;
    let remote_id = wire::read_u32(packet, &mut offset)?;
    let length = wire::read_u32(packet, &mut offset)? as usize;
    let payload = &packet[offset..];
    if length != payload.len() {
        return Err(SkiffError::MalformedMessage(format!(
            "CHANNEL_DATA length {} does not match payload {}",
            length,
            payload.len()
        )));
    }

    let route = expect_route(shared, remote_id).await?;
    let _ = route.stdout.send(DataEvent::Data(payload.to_vec())).await;
    Ok(())
}

async fn handle_extended_data(shared: &Arc<ConnShared>, packet: &[u8]) -> SkiffResult<()> {
    if packet.len() < 13 {
        return Err(SkiffError::MalformedMessage(
            "short CHANNEL_EXTENDED_DATA packet".to_string(),
        ));
    }
    let mut offset = 1;
    let remote_id = wire::read_u32(packet, &mut offset)?;
    let data_type = wire::read_u32(packet, &mut offset)?;
    let length = wire::read_u32(packet, &mut offset)? as usize;
    let payload = &packet[offset..];
    if length != payload.len() {
        return Err(SkiffError::MalformedMessage(format!(
            "CHANNEL_EXTENDED_DATA length {} does not match payload {}",
            length,
            payload.len()
        )));
    }

    // RFC 4254 Section 5.2: data type 1 is stderr; other types are
    // silently discarded.
    if data_type == 1 {
        let route = expect_route(shared, remote_id).await?;
        let _ = route.stderr.send(DataEvent::Data(payload.to_vec())).await;
    }
    Ok(())
}

/// Looks up a channel addressed by the peer; a message for a nonexistent
/// channel is fatal to the connection.
async fn expect_route(shared: &Arc<ConnShared>, id: u32) -> SkiffResult<ChannelRoute> {
    shared.route(id).await.ok_or_else(|| {
        SkiffError::MalformedMessage(format!("message for unknown channel {}", id))
    })
}

/// Answers an inbound SSH_MSG_CHANNEL_OPEN.
async fn handle_chan_open(shared: &Arc<ConnShared>, open: ChannelOpen) -> SkiffResult<()> {
    if open.max_packet_size < MIN_CHANNEL_PACKET || open.max_packet_size >= (1 << 31) {
        return send_open_failure(
            shared,
            open.peers_id,
            ChannelOpenFailureReason::ConnectionFailed,
            "invalid max packet size",
        )
        .await;
    }

    match open.chan_type.as_str() {
        "forwarded-tcpip" => {
            let mut offset = 0;
            let Ok(listen) = parse_tcp_addr(&open.type_specific_data, &mut offset) else {
                return send_open_failure(
                    shared,
                    open.peers_id,
                    ChannelOpenFailureReason::ConnectionFailed,
                    "invalid request",
                )
                .await;
            };

            let Some(queue) = shared.forwards.lookup(listen.0, listen.1).await else {
                warn!(
                    "forwarded-tcpip open for unknown binding {}:{}",
                    listen.0, listen.1
                );
                // RFC 4254 Section 7.2: spurious incoming connections must
                // be rejected.
                return send_open_failure(
                    shared,
                    open.peers_id,
                    ChannelOpenFailureReason::ConnectionFailed,
                    "invalid request",
                )
                .await;
            };

            let Ok(originator) = parse_tcp_addr(&open.type_specific_data, &mut offset) else {
                return send_open_failure(
                    shared,
                    open.peers_id,
                    ChannelOpenFailureReason::ConnectionFailed,
                    "invalid request",
                )
                .await;
            };

            let channel = shared.new_channel(ChannelState::Accepting).await;
            let local_id = channel.local_id();
            debug!(
                "accepting forwarded-tcpip channel {} from {}:{}",
                local_id, originator.0, originator.1
            );
            {
                let core = channel.core();
                {
                    let mut inner = core.inner.lock().expect("channel lock poisoned");
                    inner.remote_id = open.peers_id;
                    inner.max_packet = open.max_packet_size;
                    inner.state = ChannelState::Open;
                }
                core.send_window.add(open.peers_window).await;
            }

            let confirm = ChannelOpenConfirmation {
                peers_id: open.peers_id,
                my_id: local_id,
                my_window: CHANNEL_WINDOW,
                max_packet_size: CHANNEL_MAX_PACKET,
            };
            shared.write_packet(&confirm.to_bytes()).await?;

            if queue
                .send(Forward {
                    channel,
                    originator,
                })
                .await
                .is_err()
            {
                // Acceptor dropped; the peer will see the close.
                shared.remove_channel(local_id).await;
            }
            Ok(())
        }
        other => {
            send_open_failure(
                shared,
                open.peers_id,
                ChannelOpenFailureReason::UnknownChannelType,
                &format!("unknown channel type: {}", other),
            )
            .await
        }
    }
}

async fn send_open_failure(
    shared: &Arc<ConnShared>,
    peers_id: u32,
    reason: ChannelOpenFailureReason,
    message: &str,
) -> SkiffResult<()> {
    let failure = ChannelOpenFailure {
        peers_id,
        reason,
        message: message.to_string(),
        language: "en_US.UTF-8".to_string(),
    };
    shared.write_packet(&failure.to_bytes()).await
}
