//! Error types for the 9P2000 protocol stack.

use std::fmt;
use std::io;

/// The error type used throughout this crate.
///
/// Application-level failures travel the wire as `Rerror` messages; the
/// client surfaces those as [`Error::Message`] carrying the `ename` string
/// unmodified. Everything else describes a local failure of the transport,
/// the codec, or the session.
#[derive(Debug)]
pub enum Error {
    /// Transport or host I/O failure.
    Io(io::Error),

    /// An `Rerror` received from the peer, or a protocol-level failure
    /// that is reported to the peer as one. The string is the `ename`.
    Message(String),

    /// The server answered the version handshake with something other
    /// than "9P2000".
    UnsupportedVersion,

    /// A frame declared a size larger than the negotiated msize.
    MessageTooLarge,

    /// A `Stat` did not fit its own size field.
    StatTooLarge,

    /// The client coordinator has shut down; no further requests can be
    /// sent.
    ClientClosed,

    /// A frame carried a type code outside the 9P2000 message set.
    InvalidMessageType(u8),

    /// An address string did not match any of the accepted forms.
    InvalidAddress(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "{}", err),
            Error::Message(ename) => write!(f, "{}", ename),
            Error::UnsupportedVersion => write!(f, "unsupported version"),
            Error::MessageTooLarge => write!(f, "message larger than msize"),
            Error::StatTooLarge => write!(f, "stat larger than its size field"),
            Error::ClientClosed => write!(f, "client closed"),
            Error::InvalidMessageType(typ) => write!(f, "invalid message type: {}", typ),
            Error::InvalidAddress(addr) => write!(f, "invalid address: {}", addr),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<String> for Error {
    fn from(ename: String) -> Self {
        Error::Message(ename)
    }
}

impl From<&str> for Error {
    fn from(ename: &str) -> Self {
        Error::Message(ename.to_owned())
    }
}

impl Error {
    /// Whether the underlying cause is a clean end-of-stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}
