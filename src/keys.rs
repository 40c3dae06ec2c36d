//! Client-to-shell keystroke translation.
//!
//! The browser client sends logical keystrokes in a small backslash
//! escape language rather than raw terminal bytes: `\n` literal newlines
//! are padding and are dropped, `\\n` is the Enter key, `\\w` carries a
//! window-size update as eight decimal digits (RRRRCCCC), and the arrow,
//! Home and End keys are single-letter escapes expanded here according to
//! the shell's application-cursor mode. Everything else passes through.

use std::os::fd::RawFd;

use nix::errno::Errno;
use tracing::warn;

use crate::fatal;
use crate::session::{dump_state, full_write, SessionState};

/// Parser position in the inbound escape language.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KbdMode {
    /// Forwarding raw characters.
    #[default]
    Raw,
    /// A backslash was seen; the next byte selects the escape.
    Escape,
    /// Accumulating the eight window-size digits.
    WinSize,
}

impl KbdMode {
    /// Single-byte tag used in state dumps.
    pub(crate) fn dump_tag(self) -> u8 {
        match self {
            KbdMode::Raw => 0,
            KbdMode::Escape => b'1',
            KbdMode::WinSize => b'w',
        }
    }
}

/// Keystroke-translator state: parser mode, the window-size accumulator,
/// and a small buffer that coalesces key bytes into fewer PTY writes.
#[derive(Default)]
pub struct KbdParser {
    pub mode: KbdMode,
    winsize: [u8; 8],
    wsi: usize,
    kbuf: [u8; 8],
    kbufsz: usize,

    /// True when a window-size sequence completed during the current
    /// `process_kbd` call.
    pub sendsigwin: bool,
}

/// Translate client payload bytes into raw terminal input written to
/// `ptyfd`, then apply any completed window-size update with
/// `TIOCSWINSZ`.
pub fn process_kbd(wts: &mut SessionState, ptyfd: RawFd, buf: &[u8]) {
    write_to_subproc_core(wts, ptyfd, buf);

    if !wts.kbd.sendsigwin {
        return;
    }
    let ws = libc::winsize {
        ws_row: wts.term.swrow,
        ws_col: wts.term.swcol,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    if unsafe { libc::ioctl(ptyfd, libc::TIOCSWINSZ, &ws) } < 0 {
        warn!(error = %Errno::last(), "setting window size");
    }
}

/// The translation core: escape-language scan plus key-byte coalescing.
/// Window-size results land in the screen-model geometry; the ioctl is
/// the caller's job.
pub(crate) fn write_to_subproc_core(wts: &mut SessionState, outfd: RawFd, buf: &[u8]) {
    if wts.kbd.kbufsz != 0 {
        fatal(&format!(
            "expected key buffer to be empty, has {} bytes",
            wts.kbd.kbufsz
        ));
    }
    wts.kbd.sendsigwin = false;

    for &byte in buf {
        // Newlines in the client stream are framing padding, not Enter.
        if byte == b'\n' {
            continue;
        }

        match wts.kbd.mode {
            KbdMode::Raw => {
                if byte == b'\\' {
                    wts.kbd.mode = KbdMode::Escape;
                } else {
                    add_key_byte(wts, outfd, byte);
                }
            }

            KbdMode::Escape => {
                let mut cursmv = 0u8;
                wts.kbd.mode = KbdMode::Raw;

                match byte {
                    b'n' => add_key_byte(wts, outfd, b'\n'),
                    b'\\' => add_key_byte(wts, outfd, b'\\'),

                    b'w' => {
                        wts.kbd.wsi = 0;
                        wts.kbd.mode = KbdMode::WinSize;
                    }

                    b'd' => dump_state(wts),

                    // No-op escape; the attach client sends it as a wake
                    // probe so the master starts reading.
                    b'N' => {}

                    // Directions, End, Home.
                    b'^' => cursmv = b'A',
                    b'v' => cursmv = b'B',
                    b'>' => cursmv = b'C',
                    b'<' => cursmv = b'D',
                    b'e' => cursmv = b'F',
                    b'h' => cursmv = b'H',

                    _ => warn!(byte, "unknown inbound escape"),
                }

                if cursmv != 0 {
                    add_key_byte(wts, outfd, 0x1b);
                    // Application cursor mode does O rather than [.
                    add_key_byte(wts, outfd, if wts.term.appcursor { b'O' } else { b'[' });
                    add_key_byte(wts, outfd, cursmv);
                }
            }

            KbdMode::WinSize => {
                wts.kbd.winsize[wts.kbd.wsi] = byte;
                wts.kbd.wsi += 1;
                if wts.kbd.wsi < wts.kbd.winsize.len() {
                    continue;
                }

                match parse_winsize(&wts.kbd.winsize) {
                    Some((rows, cols)) => {
                        wts.term.swrow = rows;
                        wts.term.swcol = cols;
                        wts.kbd.sendsigwin = true;
                    }
                    None => warn!(
                        winsize = %String::from_utf8_lossy(&wts.kbd.winsize),
                        "invalid winsize"
                    ),
                }
                wts.kbd.mode = KbdMode::Raw;
            }
        }
    }

    finish_kbuf(wts, outfd);
}

/// Rows in the first four digits, columns in the last four.
fn parse_winsize(ws: &[u8; 8]) -> Option<(u16, u16)> {
    let field = |s: &[u8]| -> Option<u16> {
        std::str::from_utf8(s).ok()?.trim_start().parse().ok()
    };
    Some((field(&ws[..4])?, field(&ws[4..])?))
}

fn add_key_byte(wts: &mut SessionState, outfd: RawFd, b: u8) {
    if wts.kbd.kbufsz == wts.kbd.kbuf.len() {
        finish_kbuf(wts, outfd);
    }
    wts.kbd.kbuf[wts.kbd.kbufsz] = b;
    wts.kbd.kbufsz += 1;
}

fn finish_kbuf(wts: &mut SessionState, outfd: RawFd) {
    if wts.kbd.kbufsz == 0 {
        return;
    }
    full_write(outfd, "keyboard buffer", &wts.kbd.kbuf[..wts.kbd.kbufsz]);
    wts.kbd.kbufsz = 0;
}
