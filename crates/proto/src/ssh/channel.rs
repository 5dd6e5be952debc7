//! Runtime state of one multiplexed channel.
//!
//! A channel is shared between the connection loop, which appends inbound
//! data and posts control messages, and the application task holding the
//! [`ClientChannel`] handle. The table side owns the sending ends of the
//! delivery queues; dropping the table entry is what closes the mailbox,
//! and it happens exactly once, in the connection loop.
//!
//! Data delivery is backpressured: when a channel's queue is full the
//! connection loop blocks, which stalls every channel on the connection
//! until the slow consumer catches up.

use skiff_platform::{SkiffError, SkiffResult};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::ssh::client::ConnShared;
use crate::ssh::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelOpenFailureReason, ChannelRequest,
    ChannelWindowAdjust,
};
use crate::ssh::window::SendWindow;

/// Packets buffered per data stream before the connection loop blocks.
const DATA_QUEUE_PACKETS: usize = 32;

/// Overhead of a CHANNEL_DATA packet: type, recipient id, length prefix.
const CHANNEL_DATA_HEADER: u32 = 9;

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Local open sent, waiting for the peer's confirmation.
    Opening,
    /// Created for an inbound open that is being confirmed.
    Accepting,
    /// Open in both directions.
    Open,
    /// The peer refused our open.
    Rejected,
    /// One side has sent EOF or close.
    HalfClosed,
    /// The close exchange has completed.
    Closed,
}

/// Control messages delivered to a channel's mailbox by the connection loop.
#[derive(Debug)]
pub enum ControlMsg {
    /// The peer confirmed our open.
    OpenConfirm {
        /// Peer's id for the channel.
        remote_id: u32,
        /// Send window the peer grants us.
        window: u32,
        /// Largest packet the peer accepts.
        max_packet: u32,
    },
    /// The peer refused our open.
    OpenFailure {
        /// Rejection code.
        reason: ChannelOpenFailureReason,
        /// Peer-supplied description.
        message: String,
    },
    /// A channel request from the peer.
    Request {
        /// Request name.
        name: String,
        /// Whether the peer expects a reply.
        want_reply: bool,
        /// Raw request payload.
        payload: Vec<u8>,
    },
    /// The peer answered our channel request with success.
    RequestSuccess,
    /// The peer answered our channel request with failure.
    RequestFailure,
    /// The peer will send no more data.
    Eof,
    /// The peer closed the channel.
    Close,
}

/// One inbound data event: a chunk or end-of-stream.
#[derive(Debug)]
pub(crate) enum DataEvent {
    Data(Vec<u8>),
    Eof,
}

pub(crate) struct ChannelInner {
    pub remote_id: u32,
    pub max_packet: u32,
    pub state: ChannelState,
}

/// State shared by the table entry and the user handle.
pub(crate) struct ChannelCore {
    pub local_id: u32,
    pub send_window: SendWindow,
    pub inner: Mutex<ChannelInner>,
}

impl ChannelCore {
    pub(crate) fn state(&self) -> ChannelState {
        self.inner.lock().expect("channel lock poisoned").state
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.inner.lock().expect("channel lock poisoned").state = state;
    }

    pub(crate) fn remote_id(&self) -> u32 {
        self.inner.lock().expect("channel lock poisoned").remote_id
    }
}

/// The connection loop's side of a channel: shared core plus the sending
/// ends of the delivery queues.
pub(crate) struct ChannelEntry {
    pub core: Arc<ChannelCore>,
    pub stdout: mpsc::Sender<DataEvent>,
    pub stderr: mpsc::Sender<DataEvent>,
    pub control: mpsc::UnboundedSender<ControlMsg>,
}

/// Creates the paired table entry and user handle for channel `local_id`.
pub(crate) fn make_channel(
    local_id: u32,
    state: ChannelState,
    conn: Arc<ConnShared>,
) -> (ChannelEntry, ClientChannel) {
    let core = Arc::new(ChannelCore {
        local_id,
        send_window: SendWindow::new(0),
        inner: Mutex::new(ChannelInner {
            remote_id: 0,
            max_packet: 0,
            state,
        }),
    });

    let (stdout_tx, stdout_rx) = mpsc::channel(DATA_QUEUE_PACKETS);
    let (stderr_tx, stderr_rx) = mpsc::channel(DATA_QUEUE_PACKETS);
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let entry = ChannelEntry {
        core: Arc::clone(&core),
        stdout: stdout_tx,
        stderr: stderr_tx,
        control: control_tx,
    };
    let handle = ClientChannel {
        core,
        conn,
        stdout: DataReceiver::new(stdout_rx),
        stderr: DataReceiver::new(stderr_rx),
        control: control_rx,
    };
    (entry, handle)
}

/// Buffers one data stream on the consumer side.
struct DataReceiver {
    rx: mpsc::Receiver<DataEvent>,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl DataReceiver {
    fn new(rx: mpsc::Receiver<DataEvent>) -> Self {
        Self {
            rx,
            buf: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    /// Copies buffered bytes into `out`, waiting for the next chunk when
    /// empty. Returns 0 at end-of-stream.
    async fn read(&mut self, out: &mut [u8]) -> usize {
        loop {
            if self.pos < self.buf.len() {
                let n = out.len().min(self.buf.len() - self.pos);
                out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                self.pos += n;
                return n;
            }
            if self.eof {
                return 0;
            }
            match self.rx.recv().await {
                Some(DataEvent::Data(chunk)) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Some(DataEvent::Eof) | None => {
                    self.eof = true;
                }
            }
        }
    }
}

/// Application handle to one channel.
pub struct ClientChannel {
    core: Arc<ChannelCore>,
    conn: Arc<ConnShared>,
    stdout: DataReceiver,
    stderr: DataReceiver,
    control: mpsc::UnboundedReceiver<ControlMsg>,
}

impl ClientChannel {
    pub(crate) fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }

    /// Our id for this channel.
    pub fn local_id(&self) -> u32 {
        self.core.local_id
    }

    /// The peer's id for this channel, 0 until the open is confirmed.
    pub fn remote_id(&self) -> u32 {
        self.core.remote_id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    /// Waits for the peer's answer to our open request.
    pub async fn wait_open(&mut self) -> SkiffResult<()> {
        match self.control.recv().await {
            Some(ControlMsg::OpenConfirm {
                remote_id,
                window,
                max_packet,
            }) => {
                {
                    let mut inner = self.core.inner.lock().expect("channel lock poisoned");
                    inner.remote_id = remote_id;
                    inner.max_packet = max_packet;
                    inner.state = ChannelState::Open;
                }
                self.core.send_window.add(window).await;
                Ok(())
            }
            Some(ControlMsg::OpenFailure { reason, message }) => {
                self.core.set_state(ChannelState::Rejected);
                self.conn.remove_channel(self.core.local_id).await;
                Err(SkiffError::ConnectionFailed(format!(
                    "channel open refused ({:?}): {}",
                    reason, message
                )))
            }
            Some(other) => Err(SkiffError::UnexpectedMessage {
                expected: 91,
                got: control_discriminant(&other),
            }),
            None => Err(SkiffError::ChannelClosed),
        }
    }

    /// Reads from the channel's stdout stream. Returns 0 at end-of-stream.
    /// Consumed bytes are returned to the peer as window credit.
    pub async fn read_stdout(&mut self, out: &mut [u8]) -> SkiffResult<usize> {
        let n = self.stdout.read(out).await;
        self.replenish_window(n).await?;
        Ok(n)
    }

    /// Reads from the channel's stderr stream. Returns 0 at end-of-stream.
    pub async fn read_stderr(&mut self, out: &mut [u8]) -> SkiffResult<usize> {
        let n = self.stderr.read(out).await;
        self.replenish_window(n).await?;
        Ok(n)
    }

    async fn replenish_window(&self, consumed: usize) -> SkiffResult<()> {
        if consumed == 0 {
            return Ok(());
        }
        let adjust = ChannelWindowAdjust {
            peers_id: self.core.remote_id(),
            additional_bytes: consumed as u32,
        };
        self.conn.write_packet(&adjust.to_bytes()).await
    }

    /// Writes the whole buffer to the channel, reserving send-window
    /// capacity and splitting into packets the peer will accept.
    pub async fn write(&self, mut data: &[u8]) -> SkiffResult<()> {
        while !data.is_empty() {
            if !matches!(self.state(), ChannelState::Open) {
                return Err(SkiffError::ChannelClosed);
            }

            let max_packet = {
                let inner = self.core.inner.lock().expect("channel lock poisoned");
                inner.max_packet.saturating_sub(CHANNEL_DATA_HEADER).max(1)
            };
            let want = (data.len() as u32).min(max_packet);
            let granted = self.core.send_window.reserve(want).await? as usize;

            let msg = ChannelData {
                peers_id: self.core.remote_id(),
                data: data[..granted].to_vec(),
            };
            self.conn.write_packet(&msg.to_bytes()).await?;
            data = &data[granted..];
        }
        Ok(())
    }

    /// Sends a channel request. With `want_reply` the answer arrives on the
    /// mailbox as [`ControlMsg::RequestSuccess`] or
    /// [`ControlMsg::RequestFailure`].
    pub async fn send_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> SkiffResult<()> {
        let msg = ChannelRequest {
            peers_id: self.core.remote_id(),
            request: name.to_string(),
            want_reply,
            payload,
        };
        self.conn.write_packet(&msg.to_bytes()).await
    }

    /// Receives the next control message, or `None` once the connection
    /// loop has closed the mailbox.
    pub async fn next_control(&mut self) -> Option<ControlMsg> {
        self.control.recv().await
    }

    /// Announces that we will send no more data.
    pub async fn send_eof(&self) -> SkiffResult<()> {
        let msg = ChannelEof {
            peers_id: self.core.remote_id(),
        };
        self.core.set_state(ChannelState::HalfClosed);
        self.conn.write_packet(&msg.to_bytes()).await
    }

    /// Sends our half of the close exchange. The table entry is removed
    /// when the peer's close arrives.
    pub async fn close(&self) -> SkiffResult<()> {
        let msg = ChannelClose {
            peers_id: self.core.remote_id(),
        };
        self.core.set_state(ChannelState::HalfClosed);
        self.core.send_window.close().await;
        self.conn.write_packet(&msg.to_bytes()).await
    }
}

fn control_discriminant(msg: &ControlMsg) -> u8 {
    match msg {
        ControlMsg::OpenConfirm { .. } => 91,
        ControlMsg::OpenFailure { .. } => 92,
        ControlMsg::Request { .. } => 98,
        ControlMsg::RequestSuccess => 99,
        ControlMsg::RequestFailure => 100,
        ControlMsg::Eof => 96,
        ControlMsg::Close => 97,
    }
}
