//! SSH (Secure Shell) client protocol engine.
//!
//! This module implements the client side of the SSH-2 protocol according to
//! RFC 4251-4254 and RFC 5656.
//!
//! # Architecture
//!
//! The engine is layered, leaves first:
//!
//! 1. **Wire codec** ([`wire`], [`message`]) - Binary primitives and typed
//!    protocol messages
//! 2. **Key layer** ([`pubkey`], [`cert`]) - Public keys, signatures, and
//!    OpenSSH v01 certificates
//! 3. **Transport layer** ([`transport`], [`cipher`], [`version`]) - Packet
//!    framing, per-direction cipher/MAC state, banner exchange
//! 4. **Handshake** ([`kex`], [`kexdh`], [`auth`]) - Algorithm negotiation,
//!    DH/ECDH key agreement, session-hash derivation, user-auth handoff
//! 5. **Connection layer** ([`connection`], [`channel`], [`window`],
//!    [`forward`], [`client`]) - Multiplexed, flow-controlled channels over
//!    the secured transport
//!
//! # Concurrency
//!
//! One spawned task owns the read side of the transport and demultiplexes
//! packets into per-channel state; application tasks write channels, open
//! channels, and issue global requests concurrently. The transport writer is
//! shared behind a single mutex held for one packet emission at a time.
//!
//! A slow channel consumer eventually blocks the demultiplexing loop on that
//! channel's delivery queue, which stalls every channel on the connection.
//! This is a known limitation of the single-reader design.

pub mod auth;
pub mod cert;
pub mod channel;
pub mod cipher;
pub mod client;
pub mod connection;
pub mod forward;
pub mod kex;
pub mod kexdh;
pub mod message;
pub mod pubkey;
pub mod transport;
pub mod version;
pub mod window;
pub mod wire;

pub use auth::{AuthMethod, NoneAuth, PasswordAuth};
pub use cert::OpenSshCertV01;
pub use channel::{ChannelState, ClientChannel, ControlMsg};
pub use client::{ClientConfig, ClientConn, CryptoConfig, HostKeyChecker};
pub use connection::ChannelOpenFailureReason;
pub use forward::{Forward, ForwardAccept};
pub use kex::{KexInit, NewKeys};
pub use kexdh::{HashAlg, KexResult};
pub use message::{Message, MessageType};
pub use pubkey::{PublicKey, Signature};
pub use transport::{TransportReader, TransportWriter};
pub use window::SendWindow;
