//! Buffered streams over non-blocking sockets
//!
//! [`InputStream`] and [`OutputStream`] absorb partial reads and writes so the
//! protocol layer above can work in whole messages. Neither knows anything
//! about framing; a short result means "try again on the next readiness
//! event" unless the stream reports itself closed.

use std::io::{self, Read, Write};

fn is_transient(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Fixed-capacity read buffer
///
/// Invariant: `copied <= read <= capacity`. A physical read happens only
/// once everything read so far has been handed out.
pub struct InputStream<S> {
    source: S,
    buf: Box<[u8]>,
    read: usize,
    copied: usize,
    closed: bool,
    last_error: Option<io::ErrorKind>,
}

impl<S: Read> InputStream<S> {
    pub fn new(source: S, capacity: usize) -> Self {
        InputStream {
            source,
            buf: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            copied: 0,
            closed: false,
            last_error: None,
        }
    }

    fn available(&self) -> usize {
        self.read - self.copied
    }

    fn copy_out(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.available());
        dst[..n].copy_from_slice(&self.buf[self.copied..self.copied + n]);
        self.copied += n;
        n
    }

    /// Refill the empty buffer with as much as the source has ready
    fn fill(&mut self) -> usize {
        if self.closed {
            self.last_error = Some(io::ErrorKind::ConnectionReset);
            return 0;
        }
        debug_assert_eq!(self.available(), 0);

        self.read = 0;
        self.copied = 0;
        while self.read < self.buf.len() {
            match self.source.read(&mut self.buf[self.read..]) {
                Ok(0) => {
                    // Orderly shutdown by the peer
                    self.closed = true;
                    self.last_error = Some(io::ErrorKind::ConnectionReset);
                    break;
                }
                Ok(n) => self.read += n,
                Err(e) if is_transient(e.kind()) => {
                    self.last_error = Some(e.kind());
                    break;
                }
                Err(e) => {
                    log::warn!("Input stream read failed: {}", e);
                    self.closed = true;
                    self.last_error = Some(e.kind());
                    break;
                }
            }
        }
        self.read
    }

    /// Copy up to `dst.len()` bytes, reading from the source at most once
    ///
    /// A short count is not an error unless [`InputStream::is_closed`] is true.
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let copied = self.copy_out(dst);
        if copied == dst.len() {
            return copied;
        }
        if self.fill() == 0 {
            return copied;
        }
        copied + self.copy_out(&mut dst[copied..])
    }

    /// True if buffered data is available, reading from the source if needed
    pub fn has_data(&mut self) -> bool {
        if self.available() > 0 {
            return true;
        }
        self.fill();
        self.available() > 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn last_error(&self) -> Option<io::ErrorKind> {
        self.last_error
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn get_ref(&self) -> &S {
        &self.source
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

/// Fixed-capacity write buffer
///
/// Invariant: `wrote <= copied <= capacity`. The stream is either fully
/// flushed with the whole capacity free, or holds one contiguous pending
/// region.
pub struct OutputStream<S> {
    sink: S,
    buf: Box<[u8]>,
    copied: usize,
    wrote: usize,
    closed: bool,
    last_error: Option<io::ErrorKind>,
}

impl<S: Write> OutputStream<S> {
    pub fn new(sink: S, capacity: usize) -> Self {
        OutputStream {
            sink,
            buf: vec![0u8; capacity].into_boxed_slice(),
            copied: 0,
            wrote: 0,
            closed: false,
            last_error: None,
        }
    }

    fn free_space(&self) -> usize {
        self.buf.len() - self.copied
    }

    fn pending(&self) -> usize {
        self.copied - self.wrote
    }

    /// Write pending bytes; returns how many reached the sink
    fn flush_pending(&mut self) -> usize {
        if self.closed {
            self.last_error = Some(io::ErrorKind::ConnectionReset);
            return 0;
        }
        let to_write = self.pending();
        if to_write == 0 {
            return 0;
        }

        let mut wrote = 0;
        while wrote < to_write {
            let start = self.wrote + wrote;
            match self.sink.write(&self.buf[start..self.copied]) {
                Ok(0) => {
                    self.closed = true;
                    self.last_error = Some(io::ErrorKind::WriteZero);
                    break;
                }
                Ok(n) => wrote += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.last_error = Some(e.kind());
                    break;
                }
                Err(e) => {
                    log::warn!("Output stream write failed: {}", e);
                    self.closed = true;
                    self.last_error = Some(e.kind());
                    break;
                }
            }
        }

        if wrote == to_write {
            self.copied = 0;
            self.wrote = 0;
        } else {
            self.wrote += wrote;
        }
        wrote
    }

    /// Accept `src` into the buffer
    ///
    /// When `src` does not fit, pending bytes are flushed first; if that
    /// flush does not drain completely nothing is accepted and 0 is returned.
    pub fn write(&mut self, src: &[u8]) -> usize {
        if self.closed {
            return 0;
        }
        if self.free_space() < src.len() && (!self.flush() || self.free_space() != self.buf.len()) {
            return 0;
        }
        let n = src.len().min(self.free_space());
        self.buf[self.copied..self.copied + n].copy_from_slice(&src[..n]);
        self.copied += n;
        n
    }

    /// Try to write every pending byte; true when nothing is left pending
    pub fn flush(&mut self) -> bool {
        let to_write = self.pending();
        to_write == self.flush_pending()
    }

    pub fn has_data(&self) -> bool {
        self.pending() != 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn last_error(&self) -> Option<io::ErrorKind> {
        self.last_error
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn get_ref(&self) -> &S {
        &self.sink
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}
