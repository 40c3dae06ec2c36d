//! term-broker: attach a websocket client to a running shell session.
//!
//! Spawned by the websocket server with the client's frames on stdin and
//! the reply stream on stdout, CGI-style. The session to join is named by
//! `termid` in `QUERY_STRING`; the session master delivers the shell and
//! PTY side and is reached over the rendezvous socket.

use tracing::{debug, error, info, warn};

use term_broker::attach::{self, AttachEnd};
use term_broker::frames;
use term_broker::query::Query;

fn main() {
    // stdout carries websocket frames; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::INFO)
        .init();

    let query = Query::from_env();

    match std::env::var("HOME") {
        Ok(home) => {
            if let Err(e) = std::env::set_current_dir(&home) {
                warn!(home = %home, error = %e, "chdir to home");
            }
        }
        Err(_) => warn!("HOME is not set"),
    }

    let Some(termid) = query.termid.as_deref() else {
        error!("no termid= in QUERY_STRING; cannot locate a session socket");
        std::process::exit(1);
    };
    if query.pream.is_some() {
        debug!("preamble present; the session master writes it on first attach");
    }

    let sock = attach::session_socket_path(termid);
    info!(termid, socket = %sock.display(), "attaching");

    match attach::run_attach(&sock) {
        Ok(AttachEnd::Eof) => {
            info!("EOF - session terminated");
            frames::write_frame(libc::STDOUT_FILENO, b"EOF - session terminated");
        }
        Ok(AttachEnd::Detached(sig)) => {
            info!(signal = sig, "detached");
            frames::write_frame(libc::STDOUT_FILENO, format!("detached with signal: {sig}").as_bytes());
        }
        Err(e) => {
            error!(error = %e, "attach failed");
            frames::write_frame(libc::STDOUT_FILENO, format!("attach error: {e}").as_bytes());
            std::process::exit(1);
        }
    }
}
