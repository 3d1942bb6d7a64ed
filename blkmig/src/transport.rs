//! The rate-limited byte-transport contract (§6, C14) and two reference transports.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// What the migration core needs from the byte transport: raw/big-endian put-get,
/// a rate budget, and a sticky error slot.
pub trait Transport {
    fn put_u8(&mut self, v: u8) -> io::Result<()>;
    fn get_u8(&mut self) -> io::Result<u8>;
    fn put_be64(&mut self, v: u64) -> io::Result<()>;
    fn get_be64(&mut self) -> io::Result<u64>;
    fn put_bytes(&mut self, buf: &[u8]) -> io::Result<()>;
    fn get_bytes(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// True iff the outbound buffer is full and the producer should stop for now.
    fn rate_limited(&self) -> bool;
    /// Bytes of in-flight + queued data allowed before `rate_limited` trips.
    fn rate_limit_bytes(&self) -> u64;
    fn flush(&mut self) -> io::Result<()>;
    /// A sticky transport error, if one has been recorded. `io::Error` is not `Clone`,
    /// so callers get the message rather than the original error.
    fn sticky_error(&self) -> Option<String>;
}

/// An in-process byte-buffer transport with a settable per-call rate budget, used
/// by the test suite to exercise the pause/resume behavior of the rate limiter
/// deterministically.
pub struct MemTransport {
    buf: Vec<u8>,
    read_pos: usize,
    rate_limit_bytes: u64,
    bytes_this_window: u64,
    sticky_error: Option<io::Error>,
}

impl MemTransport {
    pub fn new(rate_limit_bytes: u64) -> Self {
        Self {
            buf: Vec::new(),
            read_pos: 0,
            rate_limit_bytes,
            bytes_this_window: 0,
            sticky_error: None,
        }
    }

    /// Resets the rate-limit window, as if a new transport tick began.
    pub fn reset_window(&mut self) {
        self.bytes_this_window = 0;
    }

    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn set_sticky_error(&mut self, e: io::Error) {
        self.sticky_error = Some(e);
    }

    /// Wraps the already-written buffer for reading, e.g. to feed a receiver.
    pub fn into_reader(self) -> MemTransport {
        MemTransport {
            buf: self.buf,
            read_pos: 0,
            rate_limit_bytes: u64::MAX,
            bytes_this_window: 0,
            sticky_error: None,
        }
    }
}

impl Transport for MemTransport {
    fn put_u8(&mut self, v: u8) -> io::Result<()> {
        self.buf.push(v);
        self.bytes_this_window += 1;
        Ok(())
    }

    fn get_u8(&mut self) -> io::Result<u8> {
        let v = *self
            .buf
            .get(self.read_pos)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        self.read_pos += 1;
        Ok(v)
    }

    fn put_be64(&mut self, v: u64) -> io::Result<()> {
        self.put_bytes(&v.to_be_bytes())
    }

    fn get_be64(&mut self) -> io::Result<u64> {
        let mut b = [0u8; 8];
        self.get_bytes(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    fn put_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(buf);
        self.bytes_this_window += buf.len() as u64;
        Ok(())
    }

    fn get_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let end = self.read_pos + buf.len();
        let src = self
            .buf
            .get(self.read_pos..end)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(src);
        self.read_pos = end;
        Ok(())
    }

    fn rate_limited(&self) -> bool {
        self.bytes_this_window >= self.rate_limit_bytes
    }

    fn rate_limit_bytes(&self) -> u64 {
        self.rate_limit_bytes
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn sticky_error(&self) -> Option<String> {
        self.sticky_error.as_ref().map(|e| e.to_string())
    }
}

/// A thin token-bucket rate limiter over [`TcpStream`], used by the demo binary.
pub struct TcpTransport {
    stream: TcpStream,
    rate_limit_bytes: u64,
    window_start: Instant,
    bytes_this_window: AtomicU64,
    sticky_error: Mutex<Option<io::Error>>,
}

const WINDOW: std::time::Duration = std::time::Duration::from_millis(100);

impl TcpTransport {
    pub fn new(stream: TcpStream, rate_limit_bytes_per_sec: u64) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            // budget per 100ms window
            rate_limit_bytes: rate_limit_bytes_per_sec / 10,
            window_start: Instant::now(),
            bytes_this_window: AtomicU64::new(0),
            sticky_error: Mutex::new(None),
        })
    }

    fn maybe_roll_window(&mut self) {
        if self.window_start.elapsed() >= WINDOW {
            self.window_start = Instant::now();
            self.bytes_this_window.store(0, Ordering::Relaxed);
        }
    }

    fn record_error(&self, e: &io::Error) {
        *self.sticky_error.lock().unwrap() = Some(io::Error::new(e.kind(), e.to_string()));
    }
}

impl Transport for TcpTransport {
    fn put_u8(&mut self, v: u8) -> io::Result<()> {
        self.put_bytes(&[v])
    }

    fn get_u8(&mut self) -> io::Result<u8> {
        let mut b = [0u8; 1];
        self.get_bytes(&mut b)?;
        Ok(b[0])
    }

    fn put_be64(&mut self, v: u64) -> io::Result<()> {
        self.put_bytes(&v.to_be_bytes())
    }

    fn get_be64(&mut self) -> io::Result<u64> {
        let mut b = [0u8; 8];
        self.get_bytes(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    fn put_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        self.maybe_roll_window();
        match self.stream.write_all(buf) {
            Ok(()) => {
                self.bytes_this_window
                    .fetch_add(buf.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    fn get_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    fn rate_limited(&self) -> bool {
        self.bytes_this_window.load(Ordering::Relaxed) >= self.rate_limit_bytes
    }

    fn rate_limit_bytes(&self) -> u64 {
        self.rate_limit_bytes
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().inspect_err(|e| self.record_error(e))
    }

    fn sticky_error(&self) -> Option<String> {
        self.sticky_error.lock().unwrap().as_ref().map(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_transport_round_trip() {
        let mut t = MemTransport::new(u64::MAX);
        t.put_be64(0x0102030405060708).unwrap();
        t.put_u8(7).unwrap();
        t.put_bytes(b"hello").unwrap();

        let mut r = t.into_reader();
        assert_eq!(r.get_be64().unwrap(), 0x0102030405060708);
        assert_eq!(r.get_u8().unwrap(), 7);
        let mut buf = [0u8; 5];
        r.get_bytes(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn rate_limit_trips_and_resets() {
        let mut t = MemTransport::new(4);
        assert!(!t.rate_limited());
        t.put_bytes(&[1, 2, 3, 4]).unwrap();
        assert!(t.rate_limited());
        t.reset_window();
        assert!(!t.rate_limited());
    }
}
