//! Shell-to-client terminal output filter.
//!
//! PTY output is scanned byte by byte against an approximate model of a
//! single screen line. The model is enough to recover clean text for the
//! session log (backspace, carriage return, delete-to-EOL and
//! delete-ahead are replayed; escape sequences are held aside) without
//! being a terminal emulator. A small whitelist of CSI/OSC sequences that
//! change screen state — alternate screen, application cursor mode — is
//! interpreted and re-announced to attached clients as mnemonics; the
//! rest of the stream is hex-escaped so the client-bound channel stays
//! printable ASCII.

use std::os::fd::{AsRawFd, RawFd};

use crate::fatal;
use crate::session::{dump_state, full_write, SessionState};

pub const LINE_BUF_SZ: usize = 1024;
pub const ESC_BUF_SZ: usize = 1024;

/// Screen-model state: the line being composed for the text log, any
/// escape sequence in flight, screen flags, and the last negotiated
/// window geometry.
pub struct TermModel {
    pub linebuf: [u8; LINE_BUF_SZ],
    /// Cursor within the line. Cursor-motion escapes can push this out of
    /// `[0, linesz]`; stores clamp it modulo the buffer size, so a
    /// malformed stream garbles the log but never memory.
    pub linepos: usize,
    /// High-water mark of the current line.
    pub linesz: usize,

    pub escbuf: [u8; ESC_BUF_SZ],
    pub escsz: usize,

    pub altscren: bool,
    pub appcursor: bool,

    pub swrow: u16,
    pub swcol: u16,
}

impl Default for TermModel {
    fn default() -> Self {
        Self {
            linebuf: [0; LINE_BUF_SZ],
            linepos: 0,
            linesz: 0,
            escbuf: [0; ESC_BUF_SZ],
            escsz: 0,
            altscren: false,
            appcursor: false,
            swrow: 0,
            swcol: 0,
        }
    }
}

/// Filter one chunk of PTY output.
///
/// Side effects: raw bytes appended to the raw log, completed lines
/// appended to the text log, and `wts.rwoutbuf` rebuilt with this call's
/// client-bound encoding plus the trailing newline separator. When
/// `wts.rwout` is set the client-bound bytes are also written to stdout.
pub fn process_tty_out(wts: &mut SessionState, buf: &[u8]) {
    wts.rwoutbuf.clear();

    if let Some(fd) = &wts.rawlogfd {
        full_write(fd.as_raw_fd(), "raw log", buf);
    }

    for &b in buf {
        scan_byte(wts, b);
        delete_chars_ahead(&mut wts.term);
        putrout(&mut wts.rwoutbuf, b);
    }

    putroutraw(&mut wts.rwoutbuf, "\n");

    if wts.rwout {
        full_write(libc::STDOUT_FILENO, "client-bound output", &wts.rwoutbuf);
    }
}

/// Re-announce the current screen state to a newly attached client.
pub fn recount_state(wts: &SessionState, fd: RawFd) {
    let mn: &[u8] = if wts.term.altscren { b"\\s2" } else { b"\\s1" };
    full_write(fd, "screen state recount", mn);
}

/// Advance the line model and escape accumulator by one byte.
fn scan_byte(wts: &mut SessionState, b: u8) {
    let t = &mut wts.term;

    if b == b'\r' {
        t.escsz = 0;
        // Snap to the start of the current visual row.
        if t.swcol > 0 {
            t.linepos -= t.linepos % t.swcol as usize;
        } else {
            t.linepos = 0;
        }
        return;
    }

    if b == 0x08 {
        if t.linepos > 0 {
            t.linepos -= 1;
        }
        return;
    }

    // The bell is also the terminator for ESC ] sequences.
    if b == 0x07 {
        t.escsz = 0;
    }

    if b.is_ascii_uppercase() && consume_esc(t, b"\x1b[") {
        match b {
            // Delete to end of line.
            b'K' => t.linesz = t.linepos,
            // Up one row.
            b'A' => t.linepos = t.linepos.wrapping_sub(t.swcol as usize) % LINE_BUF_SZ,
            // Right one column.
            b'C' => t.linepos += 1,
            _ => {}
        }
        return;
    }

    if b.is_ascii_lowercase() {
        if consume_esc(t, b"\x1b[?1") {
            t.appcursor = b == b'h';
            return;
        }
        if consume_esc(t, b"\x1b[?47") || consume_esc(t, b"\x1b[?1047") {
            t.altscren = b == b'h';
            putroutraw(&mut wts.rwoutbuf, if b == b'h' { "\\s2" } else { "\\s1" });
            return;
        }
        if consume_esc(t, b"\x1b[?1049") {
            t.altscren = b == b'h';
            // h: save cursor+state, alternate screen, clear.
            // l: primary screen, restore cursor+state.
            putroutraw(
                &mut wts.rwoutbuf,
                if b == b'h' { "\\ss\\s2\\cl" } else { "\\s1\\rs" },
            );
            return;
        }
        // Any other final byte ends a CSI we do not interpret.
        if t.escsz > 1 && t.escbuf[1] == b'[' {
            t.escsz = 0;
            return;
        }
    }

    if b == 0x1b || t.escsz > 0 {
        if b == 0x1b {
            t.escsz = 0;
        }
        // A runaway sequence saturates the buffer; excess bytes of it are
        // dropped until something resets the accumulator.
        if t.escsz < ESC_BUF_SZ {
            t.escbuf[t.escsz] = b;
            t.escsz += 1;
        }
        return;
    }

    if b == b'\n' {
        t.linepos = t.linesz;
    }
    if b == 0x07 {
        return;
    }

    t.linebuf[t.linepos % LINE_BUF_SZ] = b;
    t.linepos += 1;
    if t.linesz < t.linepos {
        t.linesz = t.linepos;
    }

    if b != b'\n' && t.linesz < LINE_BUF_SZ {
        return;
    }

    // Line completed, or the buffer is full: flush to the text log.
    if wts.term.linesz > LINE_BUF_SZ {
        dump_state(wts);
        fatal("line buffer high-water mark exceeds capacity, state dumped");
    }
    if let Some(fd) = &wts.logfd {
        full_write(
            fd.as_raw_fd(),
            "text log",
            &wts.term.linebuf[..wts.term.linesz],
        );
    }
    wts.term.linesz = 0;
    wts.term.linepos = 0;
}

/// If `escbuf` holds exactly `pref`, consume it and report a match.
fn consume_esc(t: &mut TermModel, pref: &[u8]) -> bool {
    if t.escsz != pref.len() || t.escbuf[..t.escsz] != *pref {
        return false;
    }
    t.escsz = 0;
    true
}

/// Apply a completed `ESC [ <digits> P` (delete N characters ahead) to
/// the line model. The sequence stays in `escbuf` until the stream
/// resets it, so this probe runs after every byte and matches at most
/// once per sequence arrival.
fn delete_chars_ahead(t: &mut TermModel) {
    if t.escsz < 4 || t.escsz > ESC_BUF_SZ {
        return;
    }
    let last = t.escsz - 1;
    if t.escbuf[last] != b'P' || t.escbuf[1] != b'[' {
        return;
    }

    let digits = &t.escbuf[2..last];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return;
    }
    let mut cnt = 0usize;
    for &d in digits {
        cnt = cnt.saturating_mul(10).saturating_add((d - b'0') as usize);
    }

    let Some(end) = t.linepos.checked_add(cnt) else {
        return;
    };
    if t.linesz <= end {
        return;
    }

    t.linesz -= cnt;
    let tail = t.linesz - t.linepos;
    t.linebuf
        .copy_within(t.linepos + cnt..t.linepos + cnt + tail, t.linepos);
}

/// Encode one byte for the client: printable ASCII other than `\` is
/// itself, everything else becomes `\hh`.
fn putrout(out: &mut Vec<u8>, b: u8) {
    if b == b'\\' || b < b' ' || b > b'~' {
        out.push(b'\\');
        out.push(hexdig(b >> 4));
        out.push(hexdig(b));
    } else {
        out.push(b);
    }
}

/// Append a pre-encoded mnemonic.
fn putroutraw(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
}

fn hexdig(v: u8) -> u8 {
    let v = v & 0x0f;
    v + if v < 10 { b'0' } else { b'W' }
}
