/// Classic protocol framing
///
/// Packets are `u24le length | u8 seq | payload`. The relay forwards bytes
/// verbatim and only tracks packet boundaries so the per-direction sequence
/// counter stays in step with the peers.
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{read_once, write_fully, CopyOutcome};

pub const HEADER_LEN: usize = 4;

/// Incremental packet-boundary scanner. Relayed bytes are appended to a
/// pending buffer and complete packets are consumed off its front; after a
/// scan the buffer holds at most a partial header (payload still owed is
/// tracked as a count), so a packet split across reads is carried into the
/// next call.
#[derive(Debug, Default)]
struct PacketScanner {
    pending: BytesMut,
    remaining: usize,
}

impl PacketScanner {
    /// Feed one chunk; returns the number of packets completed inside it.
    fn scan(&mut self, chunk: &[u8]) -> u64 {
        self.pending.extend_from_slice(chunk);
        let mut completed = 0;
        loop {
            if self.remaining > 0 {
                let take = self.remaining.min(self.pending.len());
                self.pending.advance(take);
                self.remaining -= take;
                if self.remaining > 0 {
                    break;
                }
                completed += 1;
            }
            if self.pending.len() < HEADER_LEN {
                break;
            }
            let mut header = self.pending.split_to(HEADER_LEN);
            let payload_len = header.get_uint_le(3) as usize;
            self.remaining = payload_len;
            if payload_len == 0 {
                completed += 1;
            }
        }
        completed
    }
}

/// One direction's classic-protocol byte pump.
#[derive(Debug, Default)]
pub struct ClassicFramer {
    seq: u8,
    frames: u64,
    pass_through: bool,
    scanner: PacketScanner,
}

impl ClassicFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    pub fn frames_complete(&self) -> u64 {
        self.frames
    }

    pub fn set_pass_through(&mut self, pass_through: bool) {
        self.pass_through = pass_through;
    }

    /// One bounded read, one complete write-out. The sequence counter
    /// advances by the number of packets completed in this chunk, wrapping
    /// modulo 256, and only once the handshake is done; a packet split
    /// across reads advances it on the read that completes it.
    pub async fn copy_packets<R, W>(
        &mut self,
        from: &mut R,
        to: &mut W,
        buf: &mut [u8],
        handshake_done: bool,
    ) -> io::Result<CopyOutcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let n = read_once(from, buf).await?;
        if n == 0 {
            return Ok(CopyOutcome::Eof);
        }

        if !self.pass_through {
            let packets = self.scanner.scan(&buf[..n]);
            self.frames += packets;
            if handshake_done {
                self.seq = self.seq.wrapping_add(packets as u8);
            }
        }

        if let Err(e) = write_fully(to, &buf[..n]).await {
            debug!("Write error: {}", e);
            return Err(e);
        }
        Ok(CopyOutcome::Relayed(n))
    }
}

/// Build an ERR packet (`0xff | u16le code | '#' sqlstate | message`) with
/// sequence number 0, as sent to a client rejected before the handshake.
pub fn error_packet(code: u16, sql_state: &str, message: &str) -> Bytes {
    debug_assert_eq!(sql_state.len(), 5);
    let payload_len = 1 + 2 + 1 + sql_state.len() + message.len();
    let mut packet = BytesMut::with_capacity(HEADER_LEN + payload_len);
    packet.put_uint_le(payload_len as u64, 3);
    packet.put_u8(0); // seq
    packet.put_u8(0xff);
    packet.put_u16_le(code);
    packet.put_u8(b'#');
    packet.put_slice(sql_state.as_bytes());
    packet.put_slice(message.as_bytes());
    packet.freeze()
}
