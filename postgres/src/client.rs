use super::{driver::DriverTx, handshake::BackendSession};

/// low level handle to a single established connection.
///
/// pairs a sender into the driver's request queue with the session state captured
/// during handshake (process id/secret key, negotiated transaction read-only mode).
/// application facing query/session/model APIs are built on top of this handle.
pub struct Client {
    pub(crate) tx: DriverTx,
    pub(crate) session: BackendSession,
}

impl Client {
    pub(crate) fn new(tx: DriverTx, session: BackendSession) -> Self {
        Self { tx, session }
    }

    pub(crate) fn tx(&self) -> &DriverTx {
        &self.tx
    }

    pub(crate) fn session(&self) -> &BackendSession {
        &self.session
    }

    /// a lossy hint of running state of io driver. an io driver shutdown can happen
    /// at the same time this api is called.
    pub fn closed(&self) -> bool {
        self.tx.is_closed()
    }
}
