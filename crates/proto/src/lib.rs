//! # Skiff Proto
//!
//! Client-side SSH-2 protocol engine.
//!
//! This crate implements the client half of the SSH transport, key exchange,
//! and connection protocols (RFC 4251-4254, RFC 5656) over an arbitrary
//! reliable byte stream, together with the OpenSSH v01 certificate format.
//!
//! The engine lives in the [`ssh`] module; the crate root re-exports the
//! main entry points.

#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ssh;

pub use ssh::client::{ClientConfig, ClientConn, CryptoConfig, HostKeyChecker};
pub use ssh::pubkey::{PublicKey, Signature};
