//! Mutable state of one attached session.
//!
//! Everything the keystroke translator and the terminal filter need is
//! gathered in [`SessionState`] so the whole session resets with a single
//! `Default` assignment. The session master owns one instance per live
//! shell and threads it into [`crate::keys::process_kbd`] and
//! [`crate::filter::process_tty_out`].

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;
use nix::unistd;
use tracing::{info, warn};

use crate::fatal;
use crate::filter::{TermModel, ESC_BUF_SZ, LINE_BUF_SZ};
use crate::keys::KbdParser;

/// Aggregate session state. Owns the keystroke-parser and screen-model
/// bundles, the client-bound output buffer, and the optional log fds.
#[derive(Default)]
pub struct SessionState {
    pub kbd: KbdParser,
    pub term: TermModel,

    /// When set, client-bound output is also written to stdout after
    /// each `process_tty_out` call.
    pub rwout: bool,

    /// Client-bound output for the most recent `process_tty_out` call:
    /// hex-escaped bytes plus screen-state mnemonics, newline-terminated.
    pub rwoutbuf: Vec<u8>,

    /// Plain-text log (completed lines of the screen model).
    pub logfd: Option<OwnedFd>,
    /// Raw log (unmodified PTY output).
    pub rawlogfd: Option<OwnedFd>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything, including any open logs.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Client-bound bytes produced by the most recent
    /// [`crate::filter::process_tty_out`] call, for delivery to attached
    /// clients.
    pub fn client_out(&self) -> &[u8] {
        &self.rwoutbuf
    }
}

/// Write the whole buffer to a blocking fd, retrying on EINTR. A short
/// write of zero bytes means the fd is not actually blocking, which is a
/// setup bug. Other errors are reported and the rest of the buffer is
/// dropped.
pub fn full_write(fd: RawFd, desc: &str, buf: &[u8]) {
    let mut left = buf;
    while !left.is_empty() {
        match unistd::write(unsafe { BorrowedFd::borrow_raw(fd) }, left) {
            Ok(0) => fatal(&format!("zero-length write, fd should be blocking: {desc}")),
            Ok(n) => left = &left[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!(desc, error = %e, "write failed");
                return;
            }
        }
    }
}

/// Open an append-only log for the given terminal id. Returns `None` on
/// failure; the session simply runs without that log.
pub fn open_log(termid: &str, suffix: &str) -> Option<OwnedFd> {
    let path = format!("/tmp/log.{termid}{suffix}");
    match OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o600)
        .open(&path)
    {
        Ok(f) => Some(OwnedFd::from(f)),
        Err(e) => {
            warn!(path = %path, error = %e, "cannot open log");
            None
        }
    }
}

/// Write the preamble to the PTY on first attach, then drop it so a
/// reattach does not replay it.
pub fn send_pream(ptyfd: RawFd, pream: &mut Option<Vec<u8>>) {
    if let Some(p) = pream.take() {
        full_write(ptyfd, "pream", &p);
    }
}

/// Dump the session's parser and screen-model state to
/// `/tmp/dump.<pid>.<seq>`. Requested by the client's `\d` escape, and
/// taken automatically before an invariant-violation abort.
pub fn dump_state(wts: &SessionState) {
    static SEQ: AtomicU32 = AtomicU32::new(0);

    let path = format!(
        "/tmp/dump.{}.{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    );
    let mut f = match File::create(&path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path, error = %e, "could not open state dump file");
            return;
        }
    };

    let tag = wts.kbd.mode.dump_tag();
    let res = (|| -> io::Result<()> {
        writeln!(f, "escp: {} ({})", tag, tag as char)?;
        writeln!(
            f,
            "linebuf: (pos={}, sz={})",
            wts.term.linepos, wts.term.linesz
        )?;
        write_escaped(&mut f, &wts.term.linebuf[..wts.term.linesz.min(LINE_BUF_SZ)])?;
        writeln!(f, "escbuf: ({} bytes)", wts.term.escsz)?;
        write_escaped(&mut f, &wts.term.escbuf[..wts.term.escsz.min(ESC_BUF_SZ)])?;
        writeln!(f, "altscr:  {}", wts.term.altscren as u8)?;
        writeln!(f, "appcurs: {}", wts.term.appcursor as u8)
    })();

    match res {
        Ok(()) => info!(path = %path, "state dumped"),
        Err(e) => warn!(path = %path, error = %e, "writing state dump"),
    }
}

/// One buffer as a dump line: printables literal, the rest `\OOO` octal.
fn write_escaped(f: &mut File, buf: &[u8]) -> io::Result<()> {
    for &b in buf {
        if b >= b' ' && b != 0x7f {
            f.write_all(&[b])?;
        } else {
            write!(f, "\\{b:03o}")?;
        }
    }
    f.write_all(b"\n")
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;
    use crate::test_util::{drain, pipe_pair};

    #[test]
    fn full_write_delivers_everything() {
        let (r, w) = pipe_pair();
        full_write(w.as_raw_fd(), "test", b"hello pipe");
        drop(w);
        assert_eq!(drain(&r), b"hello pipe");
    }

    #[test]
    fn pream_written_once_then_dropped() {
        let (r, w) = pipe_pair();
        let mut pream = Some(b"stty -echo\n".to_vec());
        send_pream(w.as_raw_fd(), &mut pream);
        assert!(pream.is_none());
        send_pream(w.as_raw_fd(), &mut pream);
        drop(w);
        assert_eq!(drain(&r), b"stty -echo\n");
    }

    #[test]
    fn open_log_creates_append_only_file() {
        let termid = format!("logtest{}", std::process::id());
        let fd = open_log(&termid, ".raw").expect("open log");
        full_write(fd.as_raw_fd(), "log", b"alpha");
        drop(fd);
        let fd = open_log(&termid, ".raw").expect("reopen log");
        full_write(fd.as_raw_fd(), "log", b"beta");
        drop(fd);

        let path = format!("/tmp/log.{termid}.raw");
        let content = std::fs::read(&path).expect("read log back");
        std::fs::remove_file(&path).ok();
        assert_eq!(content, b"alphabeta");
    }

    #[test]
    fn dump_requested_by_client_escape() {
        use std::collections::HashSet;

        fn dump_files() -> HashSet<std::path::PathBuf> {
            let prefix = format!("dump.{}.", std::process::id());
            std::fs::read_dir("/tmp")
                .expect("read /tmp")
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
                .map(|e| e.path())
                .collect()
        }

        let mut wts = SessionState::new();
        crate::filter::process_tty_out(&mut wts, b"partial line\x1b]0;ti");

        let before = dump_files();
        let (_r, w) = pipe_pair();
        crate::keys::write_to_subproc_core(&mut wts, w.as_raw_fd(), b"\\d");
        let after = dump_files();

        let new: Vec<_> = after.difference(&before).collect();
        assert_eq!(new.len(), 1, "exactly one dump file written");
        let content = std::fs::read_to_string(new[0]).expect("read dump");
        assert!(content.contains("linebuf: (pos=12, sz=12)"));
        assert!(content.contains("partial line"));
        assert!(content.contains("escbuf: (6 bytes)"));
        assert!(content.contains("\\033]0;ti"));
        assert!(content.contains("altscr:  0"));
        assert!(content.contains("appcurs: 0"));
        std::fs::remove_file(new[0]).ok();
    }

    #[test]
    fn reset_clears_everything() {
        let mut wts = SessionState::new();
        wts.term.linebuf[0] = b'x';
        wts.term.linesz = 1;
        wts.term.altscren = true;
        wts.rwoutbuf.extend_from_slice(b"leftover");
        wts.reset();
        assert_eq!(wts.term.linesz, 0);
        assert!(!wts.term.altscren);
        assert!(wts.rwoutbuf.is_empty());
        assert!(wts.logfd.is_none());
    }
}
