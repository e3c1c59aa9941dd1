//! Server related errors.
use core::fmt;

use std::error;
use std::io;

use super::tls::TlsError;

/// Errors raised by the server.
#[derive(Debug)]
pub enum Error {
    /// The listening socket could not be set up.
    Bind(io::Error),

    /// The worker pool could not be started.
    Pool(io::Error),

    /// The TLS context could not be created.
    Tls(TlsError),

    /// An attempt to send a [`ServerCommand`] to the server failed.
    ///
    /// [`ServerCommand`]: crate::net::server::ServerCommand
    CommandCouldNotBeSent,
}

//--- From

impl From<TlsError> for Error {
    fn from(err: TlsError) -> Self {
        Error::Tls(err)
    }
}

//--- Display and Error

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Bind(err) => write!(f, "cannot bind listener: {err}"),
            Error::Pool(err) => write!(f, "cannot start workers: {err}"),
            Error::Tls(err) => write!(f, "cannot set up TLS: {err}"),
            Error::CommandCouldNotBeSent => {
                write!(f, "server command could not be sent")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Bind(err) | Error::Pool(err) => Some(err),
            Error::Tls(err) => Some(err),
            Error::CommandCouldNotBeSent => None,
        }
    }
}
