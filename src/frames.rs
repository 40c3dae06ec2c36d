//! Outbound WebSocket framing.
//!
//! Server-to-client frames are unmasked, so encapsulation is just a
//! short header in front of the payload. Header and payload go out in a
//! single `writev` so a frame is never interleaved with other stdout
//! writers.

use std::io::IoSlice;
use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::sys::uio::writev;
use tracing::warn;

use crate::session::full_write;

/// Write one FIN+text frame around `payload`. The client-bound stream is
/// escape-encoded ASCII, so text framing is always valid.
pub fn write_frame(fd: RawFd, payload: &[u8]) {
    let mut header = [0u8; 10];
    header[0] = 0x81;
    let hlen = match payload.len() {
        n if n < 126 => {
            header[1] = n as u8;
            2
        }
        n if n <= u16::MAX as usize => {
            header[1] = 126;
            header[2..4].copy_from_slice(&(n as u16).to_be_bytes());
            4
        }
        n => {
            header[1] = 127;
            header[2..10].copy_from_slice(&(n as u64).to_be_bytes());
            10
        }
    };

    let iov = [IoSlice::new(&header[..hlen]), IoSlice::new(payload)];
    let wrote = match writev(unsafe { BorrowedFd::borrow_raw(fd) }, &iov) {
        Ok(n) => n,
        Err(Errno::EINTR) => 0,
        Err(e) => {
            warn!(error = %e, "writing outbound frame");
            return;
        }
    };

    // Rare short writev (frame larger than the pipe buffer): push the
    // remainder out with plain blocking-style writes.
    let total = hlen + payload.len();
    if wrote >= total {
        return;
    }
    if wrote < hlen {
        full_write(fd, "frame header", &header[wrote..hlen]);
        full_write(fd, "frame payload", payload);
    } else {
        full_write(fd, "frame payload", &payload[wrote - hlen..]);
    }
}
