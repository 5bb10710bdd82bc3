use std::io;
use std::net;

pub type NetResult<T> = Result<T, NetError>;

/// Two level error taxonomy for all socket plumbing. `Wait` means the operation could
/// not complete yet and should be retried on the next pass; `Fatal` terminates the
/// connection.
#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(FaultKind),
}

#[derive(Debug, Eq, PartialEq)]
pub enum FaultKind {
    /// The peer closed the stream.
    Closed,
    /// The send side made no progress for too many consecutive passes.
    Stalled,
    EmptyFrame,
    FrameTooLarge,
    Crypto,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            io::ErrorKind::Interrupted => NetError::Wait,
            io::ErrorKind::UnexpectedEof => NetError::Fatal(FaultKind::Closed),
            kind => NetError::Fatal(FaultKind::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetError::Fatal(FaultKind::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}
