//! SSH binary packet transport (RFC 4253 Section 6).
//!
//! One [`TransportReader`] and one [`TransportWriter`] wrap the two halves
//! of the underlying byte stream. Each half carries its own cipher, MAC,
//! and monotonically increasing sequence counter; before the first NEWKEYS
//! both run the `none` cipher with no MAC.
//!
//! # Packet format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length, minimum 4)
//! byte[m]   mac (over sequence number and the unencrypted packet)
//! ```
//!
//! The packet (including the length field) is encrypted; the MAC trails it
//! in the clear. Total packet length is aligned to the cipher block size,
//! or 8 bytes before keys are installed.

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ssh::cipher::{cipher_modes, CipherState, MacAlgo, MacKey};
use crate::ssh::kexdh::{derive_key_material, HashAlg};

/// Maximum packet size accepted from the peer (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding length (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// The direction-specific letters of the RFC 4253 Section 7.2 key
/// expansion: IV, encryption key, and MAC key.
#[derive(Debug, Clone, Copy)]
pub struct DirectionTags {
    /// Initial-IV letter.
    pub iv: u8,
    /// Encryption-key letter.
    pub key: u8,
    /// MAC-key letter.
    pub mac: u8,
}

/// Tags for the client-to-server direction.
pub const CLIENT_KEYS: DirectionTags = DirectionTags {
    iv: b'A',
    key: b'C',
    mac: b'E',
};

/// Tags for the server-to-client direction.
pub const SERVER_KEYS: DirectionTags = DirectionTags {
    iv: b'B',
    key: b'D',
    mac: b'F',
};

/// Algorithm names negotiated for one direction, held until the matching
/// NEWKEYS installs keys for them.
#[derive(Debug, Clone)]
pub struct PendingAlgorithms {
    /// Cipher name.
    pub cipher: String,
    /// MAC name.
    pub mac: String,
    /// Compression name; only "none" is negotiable.
    pub compression: String,
}

/// The write half of the transport.
pub struct TransportWriter<W> {
    stream: W,
    tags: DirectionTags,
    sequence: u32,
    cipher: Option<CipherState>,
    mac: Option<MacKey>,
    pending: Option<PendingAlgorithms>,
}

impl<W: AsyncWrite + Unpin> TransportWriter<W> {
    /// Wraps a write half. `tags` names the key-expansion letters of this
    /// direction: [`CLIENT_KEYS`] when this peer is the client.
    pub fn new(stream: W, tags: DirectionTags) -> Self {
        Self {
            stream,
            tags,
            sequence: 0,
            cipher: None,
            mac: None,
            pending: None,
        }
    }

    /// Records the negotiated algorithms; they take effect at
    /// [`setup_keys`](Self::setup_keys).
    pub fn set_pending_algorithms(&mut self, pending: PendingAlgorithms) {
        self.pending = Some(pending);
    }

    /// Frames, MACs, encrypts, and writes one packet payload.
    pub async fn write_packet(&mut self, payload: &[u8]) -> SkiffResult<()> {
        if payload.len() > MAX_PACKET_SIZE {
            return Err(SkiffError::MalformedMessage(format!(
                "outbound packet of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_PACKET_SIZE
            )));
        }

        let block = self.cipher.as_ref().map_or(8, |c| c.block_size().max(8));
        let mut padding_len = block - (5 + payload.len()) % block;
        if padding_len < MIN_PADDING_LEN {
            padding_len += block;
        }

        let packet_len = 1 + payload.len() + padding_len;
        let mut packet = BytesMut::with_capacity(4 + packet_len);
        packet.put_u32(packet_len as u32);
        packet.put_u8(padding_len as u8);
        packet.put_slice(payload);

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);
        packet.put_slice(&padding);

        let tag = self.mac.as_ref().map(|mac| mac.sign(self.sequence, &packet));

        let mut packet = packet.to_vec();
        if let Some(cipher) = &mut self.cipher {
            cipher.apply(&mut packet);
        }

        self.stream.write_all(&packet).await?;
        if let Some(tag) = tag {
            self.stream.write_all(&tag).await?;
        }
        self.stream.flush().await?;

        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    /// Derives and installs this direction's IV, cipher key, and MAC key
    /// from the key-exchange outputs (RFC 4253 Section 7.2). Called right
    /// after NEWKEYS has been sent on this direction.
    pub fn setup_keys(
        &mut self,
        k_mpint: &[u8],
        h: &[u8],
        session_id: &[u8],
        hash: HashAlg,
    ) -> SkiffResult<()> {
        let (cipher, mac) = derive_direction_keys(
            self.pending.take(),
            self.tags,
            k_mpint,
            h,
            session_id,
            hash,
        )?;
        self.cipher = Some(cipher);
        self.mac = Some(mac);
        Ok(())
    }

    /// Shuts down the underlying write half.
    pub async fn shutdown(&mut self) -> SkiffResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// The read half of the transport.
pub struct TransportReader<R> {
    stream: R,
    tags: DirectionTags,
    sequence: u32,
    cipher: Option<CipherState>,
    mac: Option<MacKey>,
    pending: Option<PendingAlgorithms>,
}

impl<R: AsyncRead + Unpin> TransportReader<R> {
    /// Wraps a read half. `tags` names the key-expansion letters of this
    /// direction: [`SERVER_KEYS`] when this peer is the client.
    pub fn new(stream: R, tags: DirectionTags) -> Self {
        Self {
            stream,
            tags,
            sequence: 0,
            cipher: None,
            mac: None,
            pending: None,
        }
    }

    /// Records the negotiated algorithms; they take effect at
    /// [`setup_keys`](Self::setup_keys).
    pub fn set_pending_algorithms(&mut self, pending: PendingAlgorithms) {
        self.pending = Some(pending);
    }

    /// Reads, decrypts, and authenticates one packet, returning its payload.
    pub async fn read_packet(&mut self) -> SkiffResult<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        self.stream.read_exact(&mut len_bytes).await?;
        if let Some(cipher) = &mut self.cipher {
            cipher.apply(&mut len_bytes);
        }

        let packet_len = u32::from_be_bytes(len_bytes) as usize;
        if packet_len < 1 + MIN_PADDING_LEN {
            return Err(SkiffError::MalformedMessage(format!(
                "packet length {} below minimum",
                packet_len
            )));
        }
        if packet_len > MAX_PACKET_SIZE {
            return Err(SkiffError::MalformedMessage(format!(
                "packet length {} exceeds the {} byte limit",
                packet_len, MAX_PACKET_SIZE
            )));
        }

        let mut body = vec![0u8; packet_len];
        self.stream.read_exact(&mut body).await?;
        if let Some(cipher) = &mut self.cipher {
            cipher.apply(&mut body);
        }

        if let Some(mac) = &self.mac {
            let mut tag = vec![0u8; mac.mac_size()];
            self.stream.read_exact(&mut tag).await?;

            let mut plain = Vec::with_capacity(4 + packet_len);
            plain.extend_from_slice(&len_bytes);
            plain.extend_from_slice(&body);
            mac.verify(self.sequence, &plain, &tag)?;
        }

        let padding_len = body[0] as usize;
        if padding_len < MIN_PADDING_LEN || 1 + padding_len > packet_len {
            return Err(SkiffError::MalformedMessage(format!(
                "padding length {} invalid for packet length {}",
                padding_len, packet_len
            )));
        }

        self.sequence = self.sequence.wrapping_add(1);
        Ok(body[1..packet_len - padding_len].to_vec())
    }

    /// Derives and installs this direction's IV, cipher key, and MAC key
    /// from the key-exchange outputs (RFC 4253 Section 7.2). Called right
    /// after NEWKEYS has been read on this direction.
    pub fn setup_keys(
        &mut self,
        k_mpint: &[u8],
        h: &[u8],
        session_id: &[u8],
        hash: HashAlg,
    ) -> SkiffResult<()> {
        let (cipher, mac) = derive_direction_keys(
            self.pending.take(),
            self.tags,
            k_mpint,
            h,
            session_id,
            hash,
        )?;
        self.cipher = Some(cipher);
        self.mac = Some(mac);
        Ok(())
    }
}

fn derive_direction_keys(
    pending: Option<PendingAlgorithms>,
    tags: DirectionTags,
    k_mpint: &[u8],
    h: &[u8],
    session_id: &[u8],
    hash: HashAlg,
) -> SkiffResult<(CipherState, MacKey)> {
    let pending = pending.ok_or_else(|| {
        SkiffError::Config("setup_keys without negotiated algorithms".to_string())
    })?;

    let mode = cipher_modes()
        .get(pending.cipher.as_str())
        .ok_or_else(|| SkiffError::Config(format!("no cipher mode for '{}'", pending.cipher)))?;
    let mac_algo = MacAlgo::from_name(&pending.mac)
        .ok_or_else(|| SkiffError::Config(format!("no MAC implementation for '{}'", pending.mac)))?;

    let iv = derive_key_material(hash, k_mpint, h, session_id, tags.iv, mode.iv_size);
    let key = derive_key_material(hash, k_mpint, h, session_id, tags.key, mode.key_size);
    let mac_key = derive_key_material(hash, k_mpint, h, session_id, tags.mac, mac_algo.key_size());

    let cipher = CipherState::new(&pending.cipher, &key, &iv)?;
    let mac = MacKey::new(&pending.mac, &mac_key)?;
    Ok((cipher, mac))
}
