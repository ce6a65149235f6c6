//! re-export of [bytes] crate types plus a small set of buffering helpers used by the
//! read/write loop in [crate::io::AsyncIo] consumers.

pub use bytes::*;

use core::fmt;

use std::io;

/// A new type for help implementing [io::Write] and [fmt::Write] traits.
pub struct BufMutWriter<'a, B>(pub &'a mut B);

impl<B: BufMut> io::Write for BufMutWriter<'_, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<B: BufMut> fmt::Write for BufMutWriter<'_, B> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.put_slice(s.as_bytes());
        Ok(())
    }
}

/// an outgoing buffer that remembers whether it still wants a flush after its bytes have
/// drained, so a caller driving non-blocking io knows when `io::Write::flush` still needs
/// a poll.
pub struct WriteBuf {
    buf: BytesMut,
    want_flush: bool,
}

impl WriteBuf {
    #[inline]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            want_flush: false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// clear remaining bytes in buffer and set flush flag to false.
    /// this would make a following [WriteBuf::want_write_io] call return false.
    #[inline]
    pub fn clear(&mut self) {
        self.buf.clear();
        self.want_flush = false;
    }

    #[inline]
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    /// flag if the buffer still has something for [WriteBuf::do_io] to push to io, either
    /// unsent bytes or a pending flush.
    #[inline]
    pub fn want_write_io(&self) -> bool {
        !self.buf.is_empty() || self.want_flush
    }

    /// write into the inner [BytesMut] with a closure that outputs a `Result`. on error the
    /// buffer is rolled back to its length before the call.
    pub fn write_buf<F, T, E>(&mut self, func: F) -> Result<T, E>
    where
        F: FnOnce(&mut BytesMut) -> Result<T, E>,
    {
        let len = self.buf.len();
        let res = func(&mut self.buf);
        if res.is_err() {
            self.buf.truncate(len);
        } else {
            self.want_flush = false;
        }
        res
    }

    /// drain buffered bytes into `io`, stopping on `WouldBlock` or once the io has been
    /// flushed. non-blocking; must be called again when the io becomes writable again.
    pub fn do_io<Io: io::Write>(&mut self, io: &mut Io) -> io::Result<()> {
        loop {
            if self.want_flush {
                match io.flush() {
                    Ok(_) => self.want_flush = false,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
                break;
            }
            match io.write(&self.buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.buf.advance(n);
                    if self.buf.is_empty() {
                        self.want_flush = true;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Default for WriteBuf {
    fn default() -> Self {
        Self::new()
    }
}
