/// Extended protocol framing
///
/// Messages are `u32le length | u8 type | payload`, with the length counting
/// the type byte. A `ConnectionClose` message (type 3, length 1) marks the
/// orderly end of a session: the bytes are still relayed, and end-of-stream
/// afterwards is a clean shutdown rather than a relay failure.
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{read_once, write_fully, CopyOutcome};

pub const HEADER_LEN: usize = 5;
pub const MESSAGE_CONNECTION_CLOSE: u8 = 3;
pub const MESSAGE_NOTICE: u8 = 11;

/// The exact wire form of a `ConnectionClose` message.
pub const CONNECTION_CLOSE_MESSAGE: [u8; 5] = [0x01, 0x00, 0x00, 0x00, 0x03];

/// Incremental message-boundary scanner, same pending-buffer scheme as the
/// classic variant: whole messages are consumed off the front, a split
/// header waits in the buffer for the next chunk.
#[derive(Debug, Default)]
struct MessageScanner {
    pending: BytesMut,
    remaining: usize,
}

struct ScanReport {
    completed: u64,
    saw_close: bool,
}

impl MessageScanner {
    fn scan(&mut self, chunk: &[u8]) -> ScanReport {
        self.pending.extend_from_slice(chunk);
        let mut report = ScanReport {
            completed: 0,
            saw_close: false,
        };
        loop {
            if self.remaining > 0 {
                let take = self.remaining.min(self.pending.len());
                self.pending.advance(take);
                self.remaining -= take;
                if self.remaining > 0 {
                    break;
                }
                report.completed += 1;
            }
            if self.pending.len() < HEADER_LEN {
                break;
            }
            let mut header = self.pending.split_to(HEADER_LEN);
            let length = header.get_u32_le() as usize;
            let msg_type = header.get_u8();
            // the length field counts the type byte
            self.remaining = length.saturating_sub(1);
            if self.remaining == 0 {
                report.completed += 1;
                if length == 1 && msg_type == MESSAGE_CONNECTION_CLOSE {
                    report.saw_close = true;
                }
            }
        }
        report
    }
}

/// One direction's extended-protocol byte pump.
#[derive(Debug, Default)]
pub struct ExtendedFramer {
    frames: u64,
    graceful_close: bool,
    pass_through: bool,
    scanner: MessageScanner,
}

impl ExtendedFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_complete(&self) -> u64 {
        self.frames
    }

    pub fn graceful_close(&self) -> bool {
        self.graceful_close
    }

    pub fn set_pass_through(&mut self, pass_through: bool) {
        self.pass_through = pass_through;
    }

    pub async fn copy_packets<R, W>(
        &mut self,
        from: &mut R,
        to: &mut W,
        buf: &mut [u8],
        _handshake_done: bool,
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
            let report = self.scanner.scan(&buf[..n]);
            self.frames += report.completed;
            if report.saw_close {
                self.graceful_close = true;
            }
        }

        if let Err(e) = write_fully(to, &buf[..n]).await {
            debug!("Write error: {}", e);
            return Err(e);
        }
        Ok(CopyOutcome::Relayed(n))
    }
}

/// Build a fatal notice frame carrying an error code, sent to clients that
/// are rejected before a backend is attached.
pub fn fatal_notice(code: u16) -> Bytes {
    // payload: severity marker + little-endian code
    let mut frame = BytesMut::with_capacity(HEADER_LEN + 3);
    frame.put_u32_le(1 + 3); // type byte + payload
    frame.put_u8(MESSAGE_NOTICE);
    frame.put_u8(0x01);
    frame.put_u16_le(code);
    frame.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{ScriptedReader, ScriptedWriter};

    fn message(msg_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut m = BytesMut::with_capacity(HEADER_LEN + payload.len());
        m.put_u32_le(1 + payload.len() as u32);
        m.put_u8(msg_type);
        m.put_slice(payload);
        m.to_vec()
    }

    #[tokio::test]
    async fn test_messages_are_counted_and_relayed() {
        let mut chunk = message(1, b"\x08\x01");
        chunk.extend(message(2, b""));
        let mut reader = ScriptedReader::new([chunk.clone()]);
        let mut writer = ScriptedWriter::sink();
        let mut framer = ExtendedFramer::new();
        let mut buf = vec![0u8; 128];

        let out = framer
            .copy_packets(&mut reader, &mut writer, &mut buf, true)
            .await
            .unwrap();

        assert_eq!(out, CopyOutcome::Relayed(chunk.len()));
        assert_eq!(writer.written, chunk);
        assert_eq!(framer.frames_complete(), 2);
        assert!(!framer.graceful_close());
    }

    #[tokio::test]
    async fn test_connection_close_is_detected_and_still_relayed() {
        assert_eq!(
            CONNECTION_CLOSE_MESSAGE.to_vec(),
            message(MESSAGE_CONNECTION_CLOSE, b"")
        );

        let mut reader = ScriptedReader::new([CONNECTION_CLOSE_MESSAGE.to_vec()]);
        let mut writer = ScriptedWriter::sink();
        let mut framer = ExtendedFramer::new();
        let mut buf = vec![0u8; 64];

        let out = framer
            .copy_packets(&mut reader, &mut writer, &mut buf, true)
            .await
            .unwrap();

        assert_eq!(out, CopyOutcome::Relayed(5));
        assert_eq!(writer.written, CONNECTION_CLOSE_MESSAGE);
        assert!(framer.graceful_close());

        // EOF after the close message: clean end, reported as Eof
        let out = framer
            .copy_packets(&mut reader, &mut writer, &mut buf, true)
            .await
            .unwrap();
        assert_eq!(out, CopyOutcome::Eof);
    }

    #[tokio::test]
    async fn test_close_detection_across_split_reads() {
        let close = CONNECTION_CLOSE_MESSAGE.to_vec();
        let mut reader = ScriptedReader::new([close[..3].to_vec(), close[3..].to_vec()]);
        let mut writer = ScriptedWriter::sink();
        let mut framer = ExtendedFramer::new();
        let mut buf = vec![0u8; 64];

        framer
            .copy_packets(&mut reader, &mut writer, &mut buf, true)
            .await
            .unwrap();
        assert!(!framer.graceful_close());

        framer
            .copy_packets(&mut reader, &mut writer, &mut buf, true)
            .await
            .unwrap();
        assert!(framer.graceful_close());
        assert_eq!(writer.written, close);
    }

    #[tokio::test]
    async fn test_large_message_with_same_type_is_not_close() {
        // type 3 but length > 1: not a ConnectionClose
        let msg = message(MESSAGE_CONNECTION_CLOSE, b"xx");
        let mut reader = ScriptedReader::new([msg]);
        let mut writer = ScriptedWriter::sink();
        let mut framer = ExtendedFramer::new();
        let mut buf = vec![0u8; 64];

        framer
            .copy_packets(&mut reader, &mut writer, &mut buf, true)
            .await
            .unwrap();
        assert_eq!(framer.frames_complete(), 1);
        assert!(!framer.graceful_close());
    }

    #[test]
    fn test_fatal_notice_layout() {
        let frame = fatal_notice(1040);
        let length = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(length as usize, frame.len() - 4);
        assert_eq!(frame[4], MESSAGE_NOTICE);
        assert_eq!(u16::from_le_bytes([frame[6], frame[7]]), 1040);
    }
}
