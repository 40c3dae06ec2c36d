//! Core of a browser-accessible terminal session broker.
//!
//! Sits between a WebSocket-speaking browser client and a shell attached
//! to a PTY:
//!
//!   Browser <-> websocket server (fd 0/1) <-> term-broker <-> session master <-> shell PTY
//!
//! Inbound, the broker deframes masked client frames ([`inbound`]) and
//! translates the client's backslash escape language into raw terminal
//! input plus window-size changes ([`keys`]). Outbound, it filters PTY
//! output through an approximate single-line screen model to produce a
//! clean text log and a re-encoded client stream ([`filter`]). Sessions
//! survive detach/reattach through a Unix-domain socket rendezvous
//! ([`attach`]).

pub mod attach;
pub mod error;
pub mod filter;
pub mod frames;
pub mod inbound;
pub mod keys;
pub mod query;
pub mod session;

pub use error::BrokerError;
pub use session::SessionState;

/// Unrecoverable invariant violation. No cleanup is worth attempting at
/// this point; callers dump diagnostic state first where one exists.
pub(crate) fn fatal(msg: &str) -> ! {
    tracing::error!("{msg}");
    std::process::exit(1);
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::os::fd::{AsRawFd, OwnedFd};

    use nix::errno::Errno;
    use nix::unistd;

    pub fn pipe_pair() -> (OwnedFd, OwnedFd) {
        unistd::pipe().expect("pipe")
    }

    /// Read to EOF. The write end must already be closed.
    pub fn drain(fd: &OwnedFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match unistd::read(fd.as_raw_fd(), &mut buf) {
                Ok(0) => return out,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(Errno::EINTR) => continue,
                Err(e) => panic!("drain: {e}"),
            }
        }
    }

    /// Read whatever is currently buffered without waiting for EOF.
    pub fn read_avail(fd: &OwnedFd) -> Vec<u8> {
        crate::attach::set_nonblocking(fd.as_raw_fd()).expect("set non-blocking");
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match unistd::read(fd.as_raw_fd(), &mut buf) {
                Ok(0) => return out,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(Errno::EAGAIN) => return out,
                Err(Errno::EINTR) => continue,
                Err(e) => panic!("read_avail: {e}"),
            }
        }
    }
}
