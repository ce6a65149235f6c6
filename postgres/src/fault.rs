//! classified, application-facing error type.
//!
//! [`crate::error::Error`] is the low-level wire/IO error the driver and handshake modules
//! raise internally; [`Fault`] is what [`crate::session::Session`] and [`crate::store::Store`]
//! actually return. every fault carries the [`crate::error::Error`] (or other cause) it was
//! classified from, so `source()` still reaches the original `DbError`/`io::Error`/etc.

use core::fmt;

use std::{error, sync::Arc};

use super::error::Error;

/// a classified failure raised above the wire-protocol layer.
///
/// `ConnectionError`/`QueryError` carry their cause behind an `Arc` rather than owning
/// [`Error`] directly: a single fault raised mid-command is latched once and then delivered to
/// every queued sink's `end()` in turn (see `crate::command`), which needs `Fault` to be
/// cheaply `Clone`-able.
#[derive(Debug, Clone)]
pub enum Fault {
    /// pool-level or handshake failure; client acquisition failure; protocol stream
    /// termination.
    ConnectionError(Arc<Error>),
    /// illegal session transition: execute on a closed session, close twice, flush on a
    /// readonly session, or any other action invalid in the session's current state.
    SessionError(String),
    /// malformed query text, an unsupported protocol message (`PortalSuspended`, `CopyIn`,
    /// `CopyOutResponse`, ...), or a server-side `ErrorResponse` promoted through a command.
    QueryError(Arc<Error>),
    /// result-sink conversion failure on a `DataRow` that is not already a domain error.
    ParseError(String),
    /// schema construction failure, illegal reload of a dirty model, readonly-field mutation
    /// at flush, or a selector/schema mismatch.
    ModelError(String),
}

impl Fault {
    pub(crate) fn connection(e: Error) -> Self {
        Self::ConnectionError(Arc::new(e))
    }

    pub(crate) fn query(e: Error) -> Self {
        Self::QueryError(Arc::new(e))
    }

    pub(crate) fn session(msg: impl Into<String>) -> Self {
        Self::SessionError(msg.into())
    }

    pub(crate) fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    pub(crate) fn model(msg: impl Into<String>) -> Self {
        Self::ModelError(msg.into())
    }

    /// true for faults that imply the underlying connection is no longer trustworthy and
    /// should be discarded rather than returned to the pool.
    pub(crate) fn poisons_connection(&self) -> bool {
        match self {
            Self::ConnectionError(_) | Self::QueryError(_) => true,
            Self::SessionError(_) | Self::ParseError(_) | Self::ModelError(_) => false,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionError(e) => write!(f, "connection error: {e}"),
            Self::SessionError(msg) => write!(f, "session error: {msg}"),
            Self::QueryError(e) => write!(f, "query error: {e}"),
            Self::ParseError(msg) => write!(f, "parse error: {msg}"),
            Self::ModelError(msg) => write!(f, "model error: {msg}"),
        }
    }
}

impl error::Error for Fault {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::ConnectionError(e) | Self::QueryError(e) => Some(e.as_ref()),
            Self::SessionError(_) | Self::ParseError(_) | Self::ModelError(_) => None,
        }
    }
}

impl From<Error> for Fault {
    /// connection- and handshake-layer errors arrive already bearing the driver's own
    /// classification (`DriverDown`, `DbError`, io errors, ...); everything from this
    /// crate's own connect/acquire path is a [`Fault::ConnectionError`] by default. callers
    /// with a more specific classification (e.g. a server `ErrorResponse` surfaced mid-command,
    /// which is a [`Fault::QueryError`]) should construct the variant directly instead of
    /// going through this conversion.
    fn from(e: Error) -> Self {
        Self::connection(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_is_prefixed_by_kind() {
        let f = Fault::session("cannot execute on a closed session");
        assert_eq!(f.to_string(), "session error: cannot execute on a closed session");
    }

    #[test]
    fn connection_and_query_errors_poison_the_connection() {
        assert!(Fault::connection(Error::unexpected()).poisons_connection());
        assert!(Fault::query(Error::unexpected()).poisons_connection());
        assert!(!Fault::session("x").poisons_connection());
        assert!(!Fault::parse("x").poisons_connection());
        assert!(!Fault::model("x").poisons_connection());
    }
}
