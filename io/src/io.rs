//! re-export of [tokio::io] types and extended AsyncIo trait on top of it.

pub use tokio::io::{AsyncRead, AsyncWrite, Interest, ReadBuf, Ready};

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use std::io;

/// A wrapper trait for a non-blocking network io type with additional methods needed to
/// drive it from a hand rolled read/write loop instead of `AsyncRead`/`AsyncWrite`.
///
/// `ready` returns a boxed future rather than an opaque associated type so the trait stays
/// object safe: the driver type erases its io to `Box<dyn AsyncIo + Send>` when a caller
/// supplies their own transport through [crate::io::AsyncIo] instead of connecting one of
/// the built in [crate::net] stream types.
pub trait AsyncIo: io::Read + io::Write + Unpin {
    /// asynchronously wait for the IO type and return its state as [Ready].
    ///
    /// the only error cause of `ready` should be runtime shutdown; actual IO errors are
    /// exposed from the [io::Read]/[io::Write] methods instead.
    fn ready(&self, interest: Interest) -> Pin<Box<dyn Future<Output = io::Result<Ready>> + Send + '_>>;

    /// a poll version of [AsyncIo::ready], kept for callers that can't await (e.g. inside
    /// another `Future::poll` impl).
    fn poll_ready(&self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<Ready>>;

    /// hint if IO can be vectored write.
    fn is_vectored_write(&self) -> bool;

    /// poll shutdown the write half of Self.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl<T: AsyncIo + ?Sized> AsyncIo for Box<T> {
    #[inline]
    fn ready(&self, interest: Interest) -> Pin<Box<dyn Future<Output = io::Result<Ready>> + Send + '_>> {
        (**self).ready(interest)
    }

    #[inline]
    fn poll_ready(&self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<Ready>> {
        (**self).poll_ready(interest, cx)
    }

    #[inline]
    fn is_vectored_write(&self) -> bool {
        (**self).is_vectored_write()
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut **self.get_mut()).poll_shutdown(cx)
    }
}

/// An adapter for an [AsyncIo] type to implement [io::Write] by way of its non-blocking
/// `try_write`-style methods.
pub struct StdIoAdapter<'a, Io>(pub &'a mut Io);

impl<Io> io::Write for StdIoAdapter<'_, Io>
where
    Io: AsyncIo,
{
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    #[inline]
    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.0.write_vectored(bufs)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
