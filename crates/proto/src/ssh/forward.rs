//! Remote port-forward bookkeeping.
//!
//! After a successful `tcpip-forward` global request the server opens
//! `forwarded-tcpip` channels toward us for every TCP connection it
//! accepts on the bound address. The forward list maps each bound
//! (IP, port) to a bounded queue of accepted channels; the connection loop
//! rejects opens for addresses with no entry (RFC 4254 Section 7.2 requires
//! spurious connections to be refused).

use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::{mpsc, Mutex};

use crate::ssh::channel::ClientChannel;

/// Accepted forwarded connections buffered per binding.
const ACCEPT_QUEUE: usize = 16;

/// One accepted forwarded-TCP connection.
pub struct Forward {
    /// The open channel carrying the connection.
    pub channel: ClientChannel,
    /// Address and port of the connection's originator, as reported by the
    /// peer.
    pub originator: (IpAddr, u32),
}

/// Application handle for accepting connections on one forwarded binding.
pub struct ForwardAccept {
    rx: mpsc::Receiver<Forward>,
}

impl ForwardAccept {
    /// Waits for the next forwarded connection. `None` once the binding is
    /// cancelled or the connection is torn down.
    pub async fn accept(&mut self) -> Option<Forward> {
        self.rx.recv().await
    }
}

/// The (IP, port) → accept-queue table. All mutation happens under one
/// lock; entries are dropped wholesale on teardown, which closes every
/// acceptor.
pub(crate) struct ForwardList {
    entries: Mutex<HashMap<(IpAddr, u32), mpsc::Sender<Forward>>>,
}

impl ForwardList {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a binding and returns the acceptor for it. A second
    /// registration of the same address replaces the first, closing its
    /// acceptor.
    pub(crate) async fn register(&self, addr: IpAddr, port: u32) -> ForwardAccept {
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        self.entries.lock().await.insert((addr, port), tx);
        ForwardAccept { rx }
    }

    /// The delivery queue for a binding, if registered.
    pub(crate) async fn lookup(&self, addr: IpAddr, port: u32) -> Option<mpsc::Sender<Forward>> {
        self.entries.lock().await.get(&(addr, port)).cloned()
    }

    /// Drops a binding, closing its acceptor.
    pub(crate) async fn remove(&self, addr: IpAddr, port: u32) {
        self.entries.lock().await.remove(&(addr, port));
    }

    /// Drops every binding. Called when the connection loop exits.
    pub(crate) async fn close_all(&self) {
        self.entries.lock().await.clear();
    }
}
