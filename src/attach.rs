//! Attach-side I/O loop.
//!
//! One attach binds the websocket client on stdin/stdout to a running
//! session's Unix-domain rendezvous socket. Client frames are decoded and
//! queued for the socket; bytes from the session master are framed back
//! to the client. Both fds are non-blocking and multiplexed with
//! `poll(2)`; a short poll tick lets the loop notice signal flags set by
//! the handlers.

use std::fs;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd;
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::frames;
use crate::inbound::FrameDecoder;
use crate::session::full_write;

/// Socket read/write chunk size for the attach loop.
pub(crate) const BUF_SIZE: usize = 4096;

/// A socket file whose inode is this old with nothing accepting on it is
/// debris from a dead master.
const STALE_SOCKET_SECS: i64 = 300;

/// `sun_path` capacity; longer socket paths need the chdir workaround.
const SUN_PATH_MAX: usize = 108;

/// How an attach ended on purpose.
#[derive(Debug, PartialEq, Eq)]
pub enum AttachEnd {
    /// The session master closed the socket (shell exited).
    Eof,
    /// SIGHUP or SIGINT: detach, leaving the session running.
    Detached(i32),
}

static DETACH_SIGNAL: AtomicI32 = AtomicI32::new(0);
static FATAL_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_detach(sig: i32) {
    DETACH_SIGNAL.store(sig, Ordering::Relaxed);
}

extern "C" fn handle_fatal(sig: i32) {
    FATAL_SIGNAL.store(sig, Ordering::Relaxed);
}

/// Rendezvous socket path for a terminal id.
pub fn session_socket_path(termid: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/dtach.{termid}"))
}

pub fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Connect to the session rendezvous socket.
///
/// ECONNREFUSED needs a second look: plain files refuse too, and a
/// leftover socket from a dead master refuses forever. The former is
/// reported as ENOTSOCK; the latter is unlinked once it is old enough so
/// a fresh master can bind the name.
fn connect_once(path: &Path) -> std::io::Result<UnixStream> {
    match UnixStream::connect(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            if let Ok(md) = fs::metadata(path) {
                if !md.file_type().is_socket() {
                    return Err(std::io::Error::from_raw_os_error(libc::ENOTSOCK));
                }
                if is_stale(&md) {
                    warn!(path = %path.display(), "unlinking stale session socket");
                    let _ = fs::remove_file(path);
                }
            }
            Err(e)
        }
        Err(e) => Err(e),
    }
}

fn is_stale(md: &fs::Metadata) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    now - md.ctime() > STALE_SOCKET_SECS
}

/// `connect_once`, with a chdir retry when the path does not fit in
/// `sockaddr_un`.
pub fn connect_session_socket(path: &Path) -> std::io::Result<UnixStream> {
    if path.as_os_str().len() < SUN_PATH_MAX {
        return connect_once(path);
    }

    let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
        return Err(std::io::Error::from_raw_os_error(libc::ENAMETOOLONG));
    };
    let saved = std::env::current_dir()?;
    std::env::set_current_dir(dir)?;
    let res = connect_once(Path::new(name));
    if let Err(e) = std::env::set_current_dir(&saved) {
        warn!(dir = %saved.display(), error = %e, "restoring working directory");
    }
    res
}

fn install_signal_handlers() {
    unsafe {
        signal::signal(Signal::SIGHUP, SigHandler::Handler(handle_detach)).ok();
        signal::signal(Signal::SIGINT, SigHandler::Handler(handle_detach)).ok();
        signal::signal(Signal::SIGTERM, SigHandler::Handler(handle_fatal)).ok();
        signal::signal(Signal::SIGQUIT, SigHandler::Handler(handle_fatal)).ok();
        // Socket writes may race a vanishing peer; log-file limits are
        // not worth dying for either.
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn).ok();
        signal::signal(Signal::SIGXFSZ, SigHandler::SigIgn).ok();
    }
}

/// Run one attach against the rendezvous socket at `sock_path` until the
/// session ends, the user detaches, or something breaks.
pub fn run_attach(sock_path: &Path) -> Result<AttachEnd, BrokerError> {
    let stream = connect_session_socket(sock_path).map_err(|source| BrokerError::Connect {
        path: sock_path.to_path_buf(),
        source,
    })?;
    let sock = stream.as_raw_fd();

    set_nonblocking(libc::STDIN_FILENO).map_err(BrokerError::NonBlocking)?;
    set_nonblocking(sock).map_err(BrokerError::NonBlocking)?;
    install_signal_handlers();

    // No-op escape: tells the master it is OK to start reading the
    // shell, now that someone is listening.
    full_write(sock, "wake probe", b"\\N");
    info!(socket = %sock_path.display(), "attached");

    let mut decoder = FrameDecoder::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; BUF_SIZE];

    loop {
        let fatal_sig = FATAL_SIGNAL.load(Ordering::Relaxed);
        if fatal_sig != 0 {
            return Err(BrokerError::UnexpectedSignal(fatal_sig));
        }
        let detach_sig = DETACH_SIGNAL.load(Ordering::Relaxed);
        if detach_sig != 0 {
            return Ok(AttachEnd::Detached(detach_sig));
        }

        let mut sock_flags = PollFlags::POLLIN;
        if !pending.is_empty() {
            sock_flags |= PollFlags::POLLOUT;
        }
        let mut poll_fds = [
            PollFd::new(
                unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) },
                PollFlags::POLLIN,
            ),
            PollFd::new(unsafe { BorrowedFd::borrow_raw(sock) }, sock_flags),
        ];

        // Short timeout so the signal flags above are rechecked.
        match poll(&mut poll_fds, PollTimeout::from(100u16)) {
            Ok(0) => continue,
            Err(Errno::EINTR | Errno::EAGAIN) => continue,
            Err(e) => return Err(BrokerError::Poll(e)),
            Ok(_) => {}
        }

        let stdin_ev = poll_fds[0].revents().unwrap_or(PollFlags::empty());
        let sock_ev = poll_fds[1].revents().unwrap_or(PollFlags::empty());

        // Session output -> client.
        if sock_ev.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
            match unistd::read(sock, &mut buf) {
                Ok(0) => return Ok(AttachEnd::Eof),
                Ok(n) => frames::write_frame(libc::STDOUT_FILENO, &buf[..n]),
                Err(Errno::EAGAIN | Errno::EINTR) => {}
                Err(e) => return Err(BrokerError::SessionRead(e)),
            }
        }

        // Client frames -> pending input for the session.
        if stdin_ev.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
            decoder.decode_available(libc::STDIN_FILENO, &mut pending, libc::STDOUT_FILENO)?;
        }

        // Drain pending input; keep whatever the socket won't take yet.
        if !pending.is_empty() && sock_ev.contains(PollFlags::POLLOUT) {
            match unistd::write(unsafe { BorrowedFd::borrow_raw(sock) }, &pending) {
                Ok(n) => {
                    pending.drain(..n);
                }
                Err(Errno::EAGAIN | Errno::EINTR) => {}
                Err(e) => return Err(BrokerError::SessionWrite(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::unix::net::UnixListener;

    use super::*;

    fn temp_name(tag: &str) -> PathBuf {
        PathBuf::from(format!("/tmp/term-broker-test.{}.{tag}", std::process::id()))
    }

    #[test]
    fn connect_reaches_a_live_listener() {
        let path = temp_name("live");
        let _ = fs::remove_file(&path);
        let listener = UnixListener::bind(&path).expect("bind");

        let mut client = connect_session_socket(&path).expect("connect");
        use std::io::Write;
        client.write_all(b"\\N").expect("probe");

        let (mut server_side, _) = listener.accept().expect("accept");
        let mut probe = [0u8; 2];
        server_side.read_exact(&mut probe).expect("read probe");
        assert_eq!(&probe, b"\\N");

        fs::remove_file(&path).ok();
    }

    #[test]
    fn refused_regular_file_reports_not_a_socket() {
        let path = temp_name("plainfile");
        fs::write(&path, b"not a socket").expect("create file");
        let err = connect_session_socket(&path).expect_err("must fail");
        assert_eq!(err.raw_os_error(), Some(libc::ENOTSOCK));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn fresh_dead_socket_is_not_unlinked() {
        let path = temp_name("deadsock");
        let _ = fs::remove_file(&path);
        drop(UnixListener::bind(&path).expect("bind"));

        let err = connect_session_socket(&path).expect_err("nobody accepting");
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
        // Too young for stale cleanup; the file must survive.
        assert!(path.exists());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn overlong_path_connects_via_chdir() {
        let dir = PathBuf::from(format!(
            "/tmp/term-broker-test.{}.{}",
            std::process::id(),
            "d".repeat(120)
        ));
        fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("sock");
        assert!(path.as_os_str().len() >= SUN_PATH_MAX);

        let prev_cwd = std::env::current_dir().expect("cwd");
        let listener = {
            std::env::set_current_dir(&dir).expect("chdir");
            let l = UnixListener::bind("sock").expect("bind short name");
            std::env::set_current_dir(&prev_cwd).expect("chdir back");
            l
        };

        let _client = connect_session_socket(&path).expect("connect long path");
        listener.accept().expect("accept");
        assert_eq!(std::env::current_dir().expect("cwd"), prev_cwd);

        fs::remove_file(&path).ok();
        fs::remove_dir(&dir).ok();
    }

    #[test]
    fn socket_path_derived_from_termid() {
        assert_eq!(
            session_socket_path("work1"),
            PathBuf::from("/tmp/dtach.work1")
        );
    }
}
