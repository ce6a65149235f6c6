pub(crate) mod codec;
pub(crate) mod generic;

mod connect;

pub(crate) use codec::Response;
pub(crate) use connect::connect_info;
pub(crate) use generic::DriverTx;

use core::{
    future::{Future, IntoFuture},
    net::SocketAddr,
    pin::Pin,
};

use postgres_protocol::message::backend;
use xitca_io::net::TcpStream;

use super::{client::Client, config::Config, error::Error, iter::AsyncLendingIterator};

use self::generic::GenericDriver;

#[cfg(unix)]
use xitca_io::net::UnixStream;

pub(super) async fn connect(cfg: &mut Config) -> Result<(Client, Driver), Error> {
    let mut err = None;
    let hosts = cfg.get_hosts().to_vec();
    for host in hosts {
        match self::connect::connect_host(host, cfg).await {
            Ok((tx, session, drv)) => return Ok((Client::new(tx, session), drv)),
            Err(e) => err = Some(e),
        }
    }

    Err(err.unwrap())
}

pub(super) async fn connect_io<Io>(io: Io, cfg: &mut Config) -> Result<(Client, Driver), Error>
where
    Io: xitca_io::io::AsyncIo + Send + 'static,
{
    self::connect::connect_io(io, cfg)
        .await
        .map(|(tx, session, drv)| (Client::new(tx, session), drv))
}

/// async driver of [Client](crate::Client).
/// it handles IO and emits server sent messages that do not belong to any query through the
/// [AsyncLendingIterator] trait impl.
///
/// # Examples:
/// ```rust,ignore
/// use std::future::IntoFuture;
///
/// // drive the connection and listen to server notify at the same time.
/// fn drive_with_server_notify(mut drv: Driver) {
///     tokio::spawn(async move {
///         while let Ok(Some(_msg)) = drv.try_next().await {
///             // handling here must be non-blocking to avoid starving the driver.
///         }
///     });
/// }
///
/// // drive the connection without handling notify.
/// fn drive_only(drv: Driver) {
///     tokio::spawn(drv.into_future());
/// }
/// ```
pub struct Driver {
    inner: _Driver,
}

impl Driver {
    pub(super) fn tcp(drv: GenericDriver<TcpStream>) -> Self {
        Self {
            inner: _Driver::Tcp(drv),
        }
    }

    #[cfg(unix)]
    pub(super) fn unix(drv: GenericDriver<UnixStream>) -> Self {
        Self {
            inner: _Driver::Unix(drv),
        }
    }

    pub(super) fn dynamic(drv: GenericDriver<Box<dyn xitca_io::io::AsyncIo + Send>>) -> Self {
        Self {
            inner: _Driver::Dynamic(drv),
        }
    }

    /// write a single pre-encoded buffer directly to the socket, bypassing the request
    /// queue. used for one-off messages sent on a throwaway connection, e.g. `CancelRequest`.
    pub(crate) async fn send(&mut self, msg: xitca_io::bytes::BytesMut) -> Result<(), Error> {
        match self.inner {
            _Driver::Tcp(ref mut drv) => drv.send(msg).await,
            #[cfg(unix)]
            _Driver::Unix(ref mut drv) => drv.send(msg).await,
            _Driver::Dynamic(ref mut drv) => drv.send(msg).await,
        }
    }

    // run till the connection is closed by Client.
    async fn run_till_closed(mut self) {
        loop {
            match self.try_next().await {
                Ok(Some(_)) => continue,
                _ => return,
            }
        }
    }
}

enum _Driver {
    Tcp(GenericDriver<TcpStream>),
    #[cfg(unix)]
    Unix(GenericDriver<UnixStream>),
    Dynamic(GenericDriver<Box<dyn xitca_io::io::AsyncIo + Send>>),
}

impl AsyncLendingIterator for Driver {
    type Ok<'i>
        = backend::Message
    where
        Self: 'i;
    type Err = Error;

    #[inline]
    async fn try_next(&mut self) -> Result<Option<Self::Ok<'_>>, Self::Err> {
        match self.inner {
            _Driver::Tcp(ref mut drv) => drv.try_next().await,
            #[cfg(unix)]
            _Driver::Unix(ref mut drv) => drv.try_next().await,
            _Driver::Dynamic(ref mut drv) => drv.try_next().await,
        }
    }
}

impl IntoFuture for Driver {
    type Output = ();
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run_till_closed())
    }
}

async fn dns_resolve(host: &str, ports: &[u16]) -> Result<Vec<SocketAddr>, Error> {
    let addrs = tokio::net::lookup_host((host, 0))
        .await?
        .flat_map(|mut addr| {
            ports.iter().map(move |port| {
                addr.set_port(*port);
                addr
            })
        })
        .collect::<Vec<_>>();
    Ok(addrs)
}
