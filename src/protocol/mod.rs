/// Wire-protocol framing for the relay
///
/// The router understands just enough of two wire protocols to count frames
/// and to emit rejection frames: the classic protocol
/// (`u24le length | u8 seq | payload`) and the extended protocol
/// (`u32le length | u8 type | payload`). Payloads are never inspected.
pub mod classic;
pub mod extended;

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use self::classic::ClassicFramer;
use self::extended::ExtendedFramer;

/// Selects the framer variant and the default destination port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Classic,
    Extended,
}

impl ProtocolKind {
    pub fn default_port(self) -> u16 {
        match self {
            ProtocolKind::Classic => 3306,
            ProtocolKind::Extended => 33060,
        }
    }

    /// Parse the configuration value (`"classic"` or `"x"`).
    pub fn from_config(value: &str) -> Option<Self> {
        match value {
            "classic" => Some(ProtocolKind::Classic),
            "x" => Some(ProtocolKind::Extended),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProtocolKind::Classic => "classic",
            ProtocolKind::Extended => "x",
        }
    }
}

/// What one `copy_packets` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// This many bytes were read and fully written out.
    Relayed(usize),
    /// The read side returned end-of-stream; nothing was written.
    Eof,
}

/// Why a connection attempt is being rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TooManyConnections,
    HostBlocked,
    NoBackend,
}

/// One direction's protocol-aware byte pump.
#[derive(Debug)]
pub enum Framer {
    Classic(ClassicFramer),
    Extended(ExtendedFramer),
}

impl Framer {
    pub fn new(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::Classic => Framer::Classic(ClassicFramer::new()),
            ProtocolKind::Extended => Framer::Extended(ExtendedFramer::new()),
        }
    }

    /// Perform one bounded read from `from` into `buf` and write everything
    /// read to `to`, looping over partial writes. Frame scanning updates the
    /// per-direction counters; bytes are always forwarded verbatim.
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
        match self {
            Framer::Classic(f) => f.copy_packets(from, to, buf, handshake_done).await,
            Framer::Extended(f) => f.copy_packets(from, to, buf, handshake_done).await,
        }
    }

    /// Current classic sequence counter; `None` for the extended protocol.
    pub fn seq(&self) -> Option<u8> {
        match self {
            Framer::Classic(f) => Some(f.seq()),
            Framer::Extended(_) => None,
        }
    }

    /// Complete frames seen by this direction so far.
    pub fn frames_complete(&self) -> u64 {
        match self {
            Framer::Classic(f) => f.frames_complete(),
            Framer::Extended(f) => f.frames_complete(),
        }
    }

    /// True once the extended close message has been relayed; EOF after this
    /// is a clean shutdown, not a failure. Always false for classic.
    pub fn graceful_close(&self) -> bool {
        match self {
            Framer::Classic(_) => false,
            Framer::Extended(f) => f.graceful_close(),
        }
    }

    /// Disable frame scanning (opaque relay, e.g. after a TLS switch).
    pub fn set_pass_through(&mut self, pass_through: bool) {
        match self {
            Framer::Classic(f) => f.set_pass_through(pass_through),
            Framer::Extended(f) => f.set_pass_through(pass_through),
        }
    }

    /// Rejection bytes a client receives when admission fails.
    pub fn rejection_frame(kind: ProtocolKind, reason: RejectReason) -> Bytes {
        match kind {
            ProtocolKind::Classic => match reason {
                RejectReason::TooManyConnections => {
                    classic::error_packet(1040, "08004", "Too many connections")
                }
                RejectReason::HostBlocked => classic::error_packet(
                    1129,
                    "HY000",
                    "Host is blocked because of many connection errors",
                ),
                RejectReason::NoBackend => {
                    classic::error_packet(2003, "HY000", "Can't connect to backend server")
                }
            },
            ProtocolKind::Extended => match reason {
                RejectReason::TooManyConnections => extended::fatal_notice(1040),
                RejectReason::HostBlocked => extended::fatal_notice(1129),
                RejectReason::NoBackend => extended::fatal_notice(2003),
            },
        }
    }
}

/// Retry budget for writes that accept zero bytes. Exhausting it surfaces as
/// `WriteZero` instead of spinning forever.
const MAX_ZERO_WRITE_RETRIES: u32 = 64;

/// Write `data` completely, treating a zero-length write as retryable.
pub(crate) async fn write_fully<W>(to: &mut W, mut data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut zero_budget = MAX_ZERO_WRITE_RETRIES;
    while !data.is_empty() {
        let n = to.write(data).await?;
        if n == 0 {
            zero_budget -= 1;
            if zero_budget == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer stopped accepting bytes",
                ));
            }
            tokio::task::yield_now().await;
            continue;
        }
        zero_budget = MAX_ZERO_WRITE_RETRIES;
        data = &data[n..];
    }
    Ok(())
}

/// Shared single-read helper for both framers.
pub(crate) async fn read_once<R>(from: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    from.read(buf).await
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted streams for byte-pump tests: reads serve pre-loaded chunks,
    //! writes follow a step script (accept n / accept zero / fail).
    use std::collections::VecDeque;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    pub struct ScriptedReader {
        chunks: VecDeque<Vec<u8>>,
    }

    impl ScriptedReader {
        pub fn new<I: IntoIterator<Item = Vec<u8>>>(chunks: I) -> Self {
            Self {
                chunks: chunks.into_iter().collect(),
            }
        }
    }

    impl AsyncRead for ScriptedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if let Some(chunk) = self.chunks.pop_front() {
                assert!(chunk.len() <= buf.remaining(), "chunk larger than buffer");
                buf.put_slice(&chunk);
            }
            Poll::Ready(Ok(()))
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub enum WriteStep {
        /// Accept up to this many bytes.
        Accept(usize),
        /// Accept nothing (must be retried by the caller).
        Zero,
        /// Fail the write.
        Error,
    }

    pub struct ScriptedWriter {
        steps: VecDeque<WriteStep>,
        pub written: Vec<u8>,
    }

    impl ScriptedWriter {
        pub fn new<I: IntoIterator<Item = WriteStep>>(steps: I) -> Self {
            Self {
                steps: steps.into_iter().collect(),
                written: Vec::new(),
            }
        }

        /// A writer that accepts everything in one go, forever.
        pub fn sink() -> Self {
            Self {
                steps: VecDeque::new(),
                written: Vec::new(),
            }
        }
    }

    impl AsyncWrite for ScriptedWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            match self.steps.pop_front() {
                None => {
                    self.written.extend_from_slice(buf);
                    Poll::Ready(Ok(buf.len()))
                }
                Some(WriteStep::Accept(n)) => {
                    let n = n.min(buf.len());
                    self.written.extend_from_slice(&buf[..n]);
                    Poll::Ready(Ok(n))
                }
                Some(WriteStep::Zero) => Poll::Ready(Ok(0)),
                Some(WriteStep::Error) => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "scripted write failure",
                ))),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }
}
