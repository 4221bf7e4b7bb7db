// src/fdtable/tunnel.rs
//! Tunneled connection state
//!
//! An `OverlayConnection` owns one overlay byte stream and presents it with
//! real-socket blocking semantics. A pump thread drains the transport into the
//! read buffer; application reads take data from the buffer or wait on a
//! condvar. The state machine is explicit — {Open, Eof, Broken, Closed} — so
//! every blocking call has a defined wakeup for every transition, including a
//! local close racing a blocked read.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::overlay::OverlayStream;

/// Pump read chunk size
const RECV_CHUNK: usize = 16 * 1024;

/// Read-buffer high water mark; the pump stalls above this until drained
const READ_HIGH_WATER: usize = 1024 * 1024;

/// Write-buffer cap; writes beyond this report partial acceptance
const WRITE_HIGH_WATER: usize = 256 * 1024;

/// Grace period for the best-effort flush during close
const CLOSE_FLUSH_GRACE: Duration = Duration::from_secs(2);

/// Connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    /// Live in both directions
    Open,
    /// Peer finished sending; buffered data still readable
    Eof,
    /// Transport failed mid-stream
    Broken,
    /// Locally closed
    Closed,
}

/// Outcome of a tunneled read
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes copied into the caller's buffer
    Data(usize),
    /// Orderly end of stream
    Eof,
    /// Non-blocking descriptor with nothing buffered
    WouldBlock,
    /// `SO_RCVTIMEO` expired
    TimedOut,
    /// Descriptor closed locally while the read was in flight
    Closed,
    /// Transport broken mid-stream
    Reset,
}

/// Outcome of a tunneled write
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Bytes accepted (buffered or flushed); may be short
    Accepted(usize),
    /// Non-blocking descriptor with no buffer space
    WouldBlock,
    /// Descriptor closed locally
    Closed,
    /// Transport broken mid-stream
    Reset,
}

/// Readiness snapshot for poll/select emulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Mutable core, one mutator at a time
struct Core {
    read_buf: BytesMut,
    write_buf: BytesMut,
    phase: Phase,
    recv_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
}

/// A live tunneled byte stream with socket-call semantics
pub struct OverlayConnection {
    /// Overlay hostname this tunnel serves
    hostname: String,

    /// Destination port the application asked for
    port: u16,

    /// Underlying transport, shared with the pump thread
    stream: Arc<dyn OverlayStream>,

    core: Mutex<Core>,

    /// Signaled on incoming data and every phase transition
    readable: Condvar,

    /// Signaled when the read buffer drains below the high water mark
    drained: Condvar,
}

impl OverlayConnection {
    /// Wrap a freshly dialed stream and start its pump thread
    pub fn spawn(
        hostname: impl Into<String>,
        port: u16,
        stream: Box<dyn OverlayStream>,
    ) -> Arc<Self> {
        let conn = Arc::new(Self {
            hostname: hostname.into(),
            port,
            stream: Arc::from(stream),
            core: Mutex::new(Core {
                read_buf: BytesMut::new(),
                write_buf: BytesMut::new(),
                phase: Phase::Open,
                recv_timeout: None,
                send_timeout: None,
            }),
            readable: Condvar::new(),
            drained: Condvar::new(),
        });

        let pump = Arc::clone(&conn);
        let spawned = thread::Builder::new()
            .name(format!("sockveil-pump-{}", conn.hostname))
            .spawn(move || pump.run_pump());
        if let Err(e) = spawned {
            // Thread exhaustion in the host process; a pumpless tunnel can
            // only ever be broken.
            warn!(host = %conn.hostname, error = %e, "pump thread unavailable");
            conn.core.lock().phase = Phase::Broken;
        }

        conn
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Record timeouts taken from the descriptor's socket options
    pub fn set_timeouts(&self, recv: Option<Duration>, send: Option<Duration>) {
        let mut core = self.core.lock();
        core.recv_timeout = recv;
        core.send_timeout = send;
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        self.core.lock().recv_timeout = timeout;
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) {
        self.core.lock().send_timeout = timeout;
    }

    /// Transport-to-buffer pump; exits on EOF, transport error, or close
    fn run_pump(self: Arc<Self>) {
        let mut chunk = vec![0u8; RECV_CHUNK];
        loop {
            match self.stream.recv(&mut chunk) {
                Ok(0) => {
                    let mut core = self.core.lock();
                    if core.phase == Phase::Open {
                        core.phase = Phase::Eof;
                    }
                    self.readable.notify_all();
                    trace!(host = %self.hostname, "tunnel eof");
                    return;
                }
                Ok(n) => {
                    let mut core = self.core.lock();
                    core.read_buf.extend_from_slice(&chunk[..n]);
                    self.readable.notify_all();

                    // Backpressure: stall until the application drains.
                    while core.read_buf.len() >= READ_HIGH_WATER && core.phase == Phase::Open {
                        self.drained.wait(&mut core);
                    }
                    if core.phase == Phase::Closed {
                        return;
                    }
                }
                Err(e) => {
                    let mut core = self.core.lock();
                    if core.phase == Phase::Open || core.phase == Phase::Eof {
                        // A recv failing after local close is expected teardown.
                        core.phase = Phase::Broken;
                        warn!(host = %self.hostname, error = %e, "tunnel transport broken");
                    }
                    self.readable.notify_all();
                    return;
                }
            }
        }
    }

    /// Read with real-socket semantics
    pub fn read(&self, buf: &mut [u8], nonblocking: bool) -> ReadOutcome {
        if buf.is_empty() {
            return ReadOutcome::Data(0);
        }

        let mut core = self.core.lock();
        let deadline = core.recv_timeout.map(|t| Instant::now() + t);

        loop {
            if !core.read_buf.is_empty() {
                let n = core.read_buf.len().min(buf.len());
                buf[..n].copy_from_slice(&core.read_buf[..n]);
                core.read_buf.advance(n);
                self.drained.notify_one();
                return ReadOutcome::Data(n);
            }

            match core.phase {
                Phase::Eof => return ReadOutcome::Eof,
                Phase::Broken => return ReadOutcome::Reset,
                Phase::Closed => return ReadOutcome::Closed,
                Phase::Open => {}
            }

            if nonblocking {
                return ReadOutcome::WouldBlock;
            }

            match deadline {
                Some(deadline) => {
                    if self.readable.wait_until(&mut core, deadline).timed_out() {
                        return ReadOutcome::TimedOut;
                    }
                }
                None => self.readable.wait(&mut core),
            }
        }
    }

    /// Write with real-socket semantics: append, then flush opportunistically
    pub fn write(&self, buf: &[u8], nonblocking: bool) -> WriteOutcome {
        let mut core = self.core.lock();

        match core.phase {
            Phase::Closed => return WriteOutcome::Closed,
            Phase::Broken => return WriteOutcome::Reset,
            // EOF is peer-side; our direction may still be open.
            Phase::Eof | Phase::Open => {}
        }

        // Backlog from an earlier partial flush goes out first.
        if !core.write_buf.is_empty() {
            if let Err(outcome) = self.flush_locked(&mut core, None) {
                return outcome;
            }
        }

        let space = WRITE_HIGH_WATER.saturating_sub(core.write_buf.len());
        if space == 0 {
            return if nonblocking {
                WriteOutcome::WouldBlock
            } else {
                WriteOutcome::Reset
            };
        }

        let accepted = buf.len().min(space);
        core.write_buf.extend_from_slice(&buf[..accepted]);

        if let Err(outcome) = self.flush_locked(&mut core, None) {
            // Bytes are in the buffer; only report failure if none were taken.
            if accepted == 0 {
                return outcome;
            }
        }

        WriteOutcome::Accepted(accepted)
    }

    /// Drain the write buffer into the transport. `deadline` bounds the
    /// attempt; `None` drains until empty or the transport fails. A transport
    /// accepting zero bytes without error counts as broken.
    fn flush_locked(&self, core: &mut Core, deadline: Option<Instant>) -> Result<(), WriteOutcome> {
        while !core.write_buf.is_empty() {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(());
                }
            }
            match self.stream.send(&core.write_buf) {
                Ok(0) => {
                    if core.phase == Phase::Open || core.phase == Phase::Eof {
                        core.phase = Phase::Broken;
                        self.readable.notify_all();
                    }
                    return Err(WriteOutcome::Reset);
                }
                Ok(n) => {
                    core.write_buf.advance(n);
                }
                Err(e) => {
                    debug!(host = %self.hostname, error = %e, "tunnel flush failed");
                    if core.phase == Phase::Open || core.phase == Phase::Eof {
                        core.phase = Phase::Broken;
                        self.readable.notify_all();
                    }
                    return Err(WriteOutcome::Reset);
                }
            }
        }
        Ok(())
    }

    /// Close the tunnel: bounded best-effort flush, transport shutdown, wake
    /// every waiter. Idempotent; returns false when already closed.
    pub fn close(&self) -> bool {
        let mut core = self.core.lock();
        if core.phase == Phase::Closed {
            return false;
        }

        let deadline = Instant::now() + CLOSE_FLUSH_GRACE;
        let _ = self.flush_locked(&mut core, Some(deadline));

        core.phase = Phase::Closed;
        core.read_buf.clear();
        self.readable.notify_all();
        self.drained.notify_all();
        drop(core);

        // Unblocks the pump thread sitting in transport recv.
        self.stream.shutdown();
        debug!(host = %self.hostname, "tunnel closed");
        true
    }

    /// Readiness snapshot for poll/select emulation
    pub fn readiness(&self) -> Readiness {
        let core = self.core.lock();
        let buffered = !core.read_buf.is_empty();
        match core.phase {
            Phase::Open => Readiness {
                readable: buffered,
                writable: true,
                error: false,
            },
            Phase::Eof => Readiness {
                readable: true,
                writable: true,
                error: false,
            },
            Phase::Broken => Readiness {
                readable: true,
                writable: true,
                error: true,
            },
            Phase::Closed => Readiness {
                readable: true,
                writable: false,
                error: true,
            },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.core.lock().phase == Phase::Closed
    }
}

impl Drop for OverlayConnection {
    fn drop(&mut self) {
        self.stream.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::{Result, ShimError};
    use parking_lot::Mutex as PlMutex;
    use std::collections::VecDeque;
    use std::sync::mpsc;

    /// Scriptable in-memory transport for exercising the state machine
    struct ScriptedStream {
        incoming: PlMutex<VecDeque<Vec<u8>>>,
        sent: PlMutex<Vec<u8>>,
        wakeup: (PlMutex<bool>, Condvar),
        /// Max bytes accepted per send call; models partial transport writes
        send_quota: usize,
        fail_sends: bool,
    }

    impl ScriptedStream {
        fn new(send_quota: usize) -> Self {
            Self {
                incoming: PlMutex::new(VecDeque::new()),
                sent: PlMutex::new(Vec::new()),
                wakeup: (PlMutex::new(false), Condvar::new()),
                send_quota,
                fail_sends: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail_sends: true,
                ..Self::new(usize::MAX)
            }
        }

        fn push_incoming(&self, data: &[u8]) {
            self.incoming.lock().push_back(data.to_vec());
            let (lock, cv) = &self.wakeup;
            *lock.lock() = true;
            cv.notify_all();
        }
    }

    impl OverlayStream for ScriptedStream {
        fn send(&self, buf: &[u8]) -> Result<usize> {
            if self.fail_sends {
                return Err(ShimError::Transport("send failed".to_string()));
            }
            let n = buf.len().min(self.send_quota);
            self.sent.lock().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn recv(&self, buf: &mut [u8]) -> Result<usize> {
            loop {
                if let Some(chunk) = self.incoming.lock().pop_front() {
                    if chunk.is_empty() {
                        return Ok(0);
                    }
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                let (lock, cv) = &self.wakeup;
                let mut flag = lock.lock();
                if *flag {
                    *flag = false;
                    continue;
                }
                if cv.wait_for(&mut flag, Duration::from_millis(200)).timed_out() {
                    return Err(ShimError::Transport("shutdown".to_string()));
                }
                *flag = false;
            }
        }

        fn shutdown(&self) {
            self.push_incoming(&[]);
        }
    }

    fn connection(quota: usize) -> (Arc<OverlayConnection>, Arc<ScriptedStream>) {
        let stream = Arc::new(ScriptedStream::new(quota));
        let boxed: Box<dyn OverlayStream> = Box::new(ArcStream(Arc::clone(&stream)));
        (OverlayConnection::spawn("svc.ziti", 80, boxed), stream)
    }

    /// Box-able handle sharing one scripted stream with the test
    struct ArcStream(Arc<ScriptedStream>);

    impl OverlayStream for ArcStream {
        fn send(&self, buf: &[u8]) -> Result<usize> {
            self.0.send(buf)
        }
        fn recv(&self, buf: &mut [u8]) -> Result<usize> {
            self.0.recv(buf)
        }
        fn shutdown(&self) {
            self.0.shutdown();
        }
    }

    #[test]
    fn test_read_drains_buffered_data() {
        let (conn, stream) = connection(usize::MAX);
        stream.push_incoming(b"hello world");

        let mut buf = [0u8; 5];
        assert_eq!(conn.read(&mut buf, false), ReadOutcome::Data(5));
        assert_eq!(&buf, b"hello");

        let mut rest = [0u8; 16];
        assert_eq!(conn.read(&mut rest, false), ReadOutcome::Data(6));
        assert_eq!(&rest[..6], b" world");
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let (conn, _stream) = connection(usize::MAX);
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf, true), ReadOutcome::WouldBlock);
    }

    #[test]
    fn test_recv_timeout_honored() {
        let (conn, _stream) = connection(usize::MAX);
        conn.set_recv_timeout(Some(Duration::from_millis(50)));

        let start = Instant::now();
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf, false), ReadOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_eof_after_data() {
        let (conn, stream) = connection(usize::MAX);
        stream.push_incoming(b"tail");
        stream.push_incoming(&[]);

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf, false), ReadOutcome::Data(4));
        assert_eq!(conn.read(&mut buf, false), ReadOutcome::Eof);
    }

    #[test]
    fn test_write_flushes_through_transport() {
        let (conn, stream) = connection(usize::MAX);
        assert_eq!(conn.write(b"request", false), WriteOutcome::Accepted(7));
        assert_eq!(stream.sent.lock().as_slice(), b"request");
    }

    #[test]
    fn test_partial_transport_write_buffers_remainder() {
        let (conn, stream) = connection(3);
        // Transport takes 3 bytes per pass; the rest stays buffered but the
        // application sees every byte accepted.
        assert_eq!(conn.write(b"abcdef", false), WriteOutcome::Accepted(6));
        assert!(stream.sent.lock().len() >= 3);
    }

    #[test]
    fn test_write_after_transport_failure_resets() {
        let stream = Arc::new(ScriptedStream::failing());
        let boxed: Box<dyn OverlayStream> = Box::new(ArcStream(Arc::clone(&stream)));
        let conn = OverlayConnection::spawn("svc.ziti", 80, boxed);

        assert_eq!(conn.write(b"x", false), WriteOutcome::Accepted(1));
        // Flush failed behind the scenes; the next write observes the break.
        assert_eq!(conn.write(b"y", false), WriteOutcome::Reset);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (conn, _stream) = connection(usize::MAX);
        assert!(conn.close());
        assert!(!conn.close());
        assert!(!conn.close());
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let (conn, _stream) = connection(usize::MAX);
        let reader = Arc::clone(&conn);
        let (tx, rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 8];
            let outcome = reader.read(&mut buf, false);
            tx.send(outcome).unwrap();
        });

        // Let the reader reach the condvar wait.
        thread::sleep(Duration::from_millis(50));
        conn.close();

        let outcome = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("blocked read must return promptly after close");
        assert_eq!(outcome, ReadOutcome::Closed);
        handle.join().unwrap();
    }

    #[test]
    fn test_read_and_write_after_close() {
        let (conn, _stream) = connection(usize::MAX);
        conn.close();

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf, false), ReadOutcome::Closed);
        assert_eq!(conn.write(b"late", false), WriteOutcome::Closed);
    }

    #[test]
    fn test_readiness_transitions() {
        let (conn, stream) = connection(usize::MAX);
        let idle = conn.readiness();
        assert!(!idle.readable);
        assert!(idle.writable);

        stream.push_incoming(b"data");
        // Wait for the pump to land the bytes.
        let deadline = Instant::now() + Duration::from_secs(1);
        while !conn.readiness().readable && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(conn.readiness().readable);

        conn.close();
        let closed = conn.readiness();
        assert!(closed.readable);
        assert!(!closed.writable);
        assert!(closed.error);
    }
}
