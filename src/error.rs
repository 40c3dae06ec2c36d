//! Broker error taxonomy.
//!
//! Transient I/O (EAGAIN/EWOULDBLOCK/EINTR) never surfaces here — it is
//! absorbed at the read/write sites and control returns to the poll loop.
//! These variants are the conditions that end an attach.

use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The client closed its half of the WebSocket stream, possibly
    /// mid-frame.
    #[error("client closed the inbound stream")]
    ClientEof,

    /// A client data frame arrived without the MASK bit. RFC 6455
    /// requires client frames to be masked; this is a protocol
    /// violation, not a recoverable condition.
    #[error("client sent an unmasked frame")]
    UnmaskedFrame,

    #[error("read inbound frames from client: {0}")]
    InboundRead(Errno),

    #[error("read session socket: {0}")]
    SessionRead(Errno),

    #[error("write session socket: {0}")]
    SessionWrite(Errno),

    #[error("poll: {0}")]
    Poll(Errno),

    #[error("connect to session socket {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("set fd non-blocking: {0}")]
    NonBlocking(Errno),

    #[error("unexpected signal: {0}")]
    UnexpectedSignal(i32),
}
