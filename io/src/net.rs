//! wrapper types around [tokio::net] streams that implement [crate::io::AsyncIo].

mod tcp;
#[cfg(unix)]
mod unix;

#[cfg(not(target_family = "wasm"))]
pub use tcp::TcpSocket;
pub use tcp::{TcpListener, TcpStream};
#[cfg(unix)]
pub use unix::{UnixListener, UnixStream};

use std::io;

macro_rules! default_aio_impl {
    ($ty: ty) => {
        impl crate::io::AsyncIo for $ty {
            #[inline]
            fn ready(
                &self,
                interest: crate::io::Interest,
            ) -> ::core::pin::Pin<Box<dyn ::core::future::Future<Output = ::std::io::Result<crate::io::Ready>> + Send + '_>>
            {
                Box::pin(self.0.ready(interest))
            }

            fn poll_ready(
                &self,
                interest: crate::io::Interest,
                cx: &mut ::core::task::Context<'_>,
            ) -> ::core::task::Poll<::std::io::Result<crate::io::Ready>> {
                match interest {
                    crate::io::Interest::READABLE => self.0.poll_read_ready(cx).map_ok(|_| crate::io::Ready::READABLE),
                    crate::io::Interest::WRITABLE => self.0.poll_write_ready(cx).map_ok(|_| crate::io::Ready::WRITABLE),
                    _ => unimplemented!("tokio does not support poll_ready for BOTH read and write ready"),
                }
            }

            fn is_vectored_write(&self) -> bool {
                crate::io::AsyncWrite::is_write_vectored(&self.0)
            }

            fn poll_shutdown(
                self: ::core::pin::Pin<&mut Self>,
                cx: &mut ::core::task::Context<'_>,
            ) -> ::core::task::Poll<::std::io::Result<()>> {
                crate::io::AsyncWrite::poll_shutdown(::core::pin::Pin::new(&mut self.get_mut().0), cx)
            }
        }

        impl ::std::io::Read for $ty {
            #[inline]
            fn read(&mut self, buf: &mut [u8]) -> ::std::io::Result<usize> {
                self.0.try_read(buf)
            }
        }

        impl ::std::io::Write for $ty {
            #[inline]
            fn write(&mut self, buf: &[u8]) -> ::std::io::Result<usize> {
                self.0.try_write(buf)
            }

            #[inline]
            fn write_vectored(&mut self, bufs: &[::std::io::IoSlice<'_>]) -> ::std::io::Result<usize> {
                self.0.try_write_vectored(bufs)
            }

            #[inline]
            fn flush(&mut self) -> ::std::io::Result<()> {
                Ok(())
            }
        }
    };
}

use default_aio_impl;

/// A collection of listener types of different protocol.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    pub async fn accept(&self) -> io::Result<Stream> {
        match *self {
            Self::Tcp(ref tcp) => {
                let (stream, addr) = tcp.accept().await?;

                // This two way conversion is to deregister stream from the listener thread's poll
                // and re-register it to current thread's poll.
                let stream = stream.into_std()?;
                let stream = TcpStream::from_std(stream)?;
                Ok(Stream::Tcp(stream, addr))
            }
            #[cfg(unix)]
            Self::Unix(ref unix) => {
                let (stream, addr) = unix.accept().await?;

                let stream = stream.into_std()?;
                let stream = UnixStream::from_std(stream)?;
                Ok(Stream::Unix(stream, addr))
            }
        }
    }
}

/// A collection of stream types of different protocol.
pub enum Stream {
    Tcp(TcpStream, std::net::SocketAddr),
    #[cfg(unix)]
    Unix(UnixStream, tokio::net::unix::SocketAddr),
}

impl From<Stream> for TcpStream {
    fn from(stream: Stream) -> Self {
        match stream {
            Stream::Tcp(tcp, _) => tcp,
            #[cfg(unix)]
            _ => unreachable!("Can not be casted to TcpStream"),
        }
    }
}

#[cfg(unix)]
impl From<Stream> for UnixStream {
    fn from(stream: Stream) -> Self {
        match stream {
            Stream::Unix(unix, _) => unix,
            _ => unreachable!("Can not be casted to UnixStream"),
        }
    }
}
