//! The single-line status renderer
//!
//! `<spinner> <bar> <percent> (<free> MiB) <jobs>`
//!
//! The bar shows where the host's memory is, in four zones: resident in
//! this build's descendants, used by everything else, imminent (reserved
//! or historically-peaked but not yet resident), and free.
//!
//! Output discipline: the renderer owns a *duplicated* stderr descriptor,
//! so it never contends for the stream the recipes write to.  When both
//! stderr and stdout are terminals it repaints in place with a
//! save/up/column/restore escape sequence; otherwise it writes plain
//! newline-terminated lines so piped output stays parseable.  A write
//! that fails with broken-pipe or bad-descriptor disables the renderer
//! permanently.
//!
//! The terminal is queried exactly once, at monitor-thread start, for its
//! width; the query saves and restores the terminal attributes around
//! itself and a failure disables the renderer rather than risking a
//! wedged terminal.

use crate::internal_prelude::*;

use std::sync::atomic::AtomicI32;

/// Width of the bar, in columns
const BAR_WIDTH: usize = 20;

/// Spinner frames, one per repaint
const SPINNER: &[u8] = b"-\\|/";

/// Everything one repaint needs to know
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatusSnapshot {
    /// Host memory as of this tick
    pub(crate) host: HostMemory,
    /// Total RSS of the build's descendants
    pub(crate) build_rss: Mib,
    /// Reserved plus unused peaks
    pub(crate) imminent: Mib,
    /// Live jobs
    pub(crate) jobs: usize,
}

/// The renderer's private output channel
///
/// Shared with [`MemGuard::stop_now`](crate::MemGuard::stop_now), which
/// must be able to restore the terminal without waiting for the monitor
/// thread.  A closed channel (`fd == -1`) is the permanent disabled
/// state.
#[derive(Debug)]
pub(crate) struct TermChannel {
    /// The duplicated descriptor, or -1 once closed
    fd: AtomicI32,
    /// Are we repainting a terminal (vs writing plain lines)?
    tty: bool,
}

impl TermChannel {
    /// Write `buf`, closing the channel on EPIPE/EBADF.
    ///
    /// Returns whether the channel is still usable.
    #[cfg(unix)]
    fn write_all(&self, buf: &[u8]) -> bool {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return false;
        }
        // SAFETY: plain write(2) on a descriptor we dup'ed and still own.
        let rc = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(libc::EPIPE) | Some(libc::EBADF)) {
                self.close();
                return false;
            }
        }
        true
    }

    /// See the unix variant.
    #[cfg(not(unix))]
    fn write_all(&self, _buf: &[u8]) -> bool {
        false
    }

    /// Is this channel still willing to write?
    pub(crate) fn is_open(&self) -> bool {
        self.fd.load(Ordering::Acquire) >= 0
    }

    /// Put the terminal back in a usable state.
    ///
    /// Carriage return, erase to end of line, newline.  Async-signal-safe
    /// (one `write`), so the embedding tool's fatal-signal cleanup may
    /// call it.
    pub(crate) fn restore_terminal(&self) {
        if self.tty {
            let _ = self.write_all(b"\r\x1b[K\n");
        }
    }

    /// Close the descriptor; further writes are no-ops.
    pub(crate) fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        #[cfg(unix)]
        if fd >= 0 {
            // SAFETY: we owned this descriptor and hand it back exactly once.
            unsafe {
                let _ = libc::close(fd);
            }
        }
        #[cfg(not(unix))]
        let _ = fd;
    }
}

/// The status renderer
///
/// Owned by the monitor thread; repaint cadence is the monitor's
/// business.
#[derive(Debug)]
pub(crate) struct StatusRenderer {
    /// Output channel, shared with the immediate-stop path
    channel: Arc<TermChannel>,
    /// Cached terminal width (or a plain-mode default)
    width: usize,
    /// Which spinner frame is next
    frame: usize,
}

impl StatusRenderer {
    /// Set up the renderer: duplicate stderr, cache the terminal width.
    ///
    /// Returns `None` (no renderer) when the display is configured off,
    /// stderr cannot be duplicated, or the width query fails.
    #[cfg(unix)]
    pub(crate) fn new(display: bool) -> Option<StatusRenderer> {
        use std::io::IsTerminal as _;

        if !display {
            return None;
        }

        let tty = std::io::stderr().is_terminal() && std::io::stdout().is_terminal();

        // SAFETY: dup(2) of a descriptor this process certainly has.
        let fd = unsafe { libc::dup(libc::STDERR_FILENO) };
        if fd < 0 {
            return None;
        }
        let channel = Arc::new(TermChannel {
            fd: AtomicI32::new(fd),
            tty,
        });

        let width = if tty {
            match query_width_isolated(fd) {
                Some(w) => w,
                None => {
                    channel.close();
                    return None;
                }
            }
        } else {
            80
        };

        Some(StatusRenderer {
            channel,
            width,
            frame: 0,
        })
    }

    /// No terminals here.
    #[cfg(not(unix))]
    pub(crate) fn new(_display: bool) -> Option<StatusRenderer> {
        None
    }

    /// A handle for the immediate-stop path.
    pub(crate) fn channel(&self) -> Arc<TermChannel> {
        Arc::clone(&self.channel)
    }

    /// Repaint.  Returns whether the renderer is still usable.
    pub(crate) fn render(&mut self, snap: &StatusSnapshot) -> bool {
        if !self.channel.is_open() {
            return false;
        }
        let line = format_status_line(snap, self.frame);
        self.frame = self.frame.wrapping_add(1);

        let mut out = Vec::with_capacity(line.len() + 16);
        if self.channel.tty {
            // Save cursor, up one line, column 0, status, restore.
            out.extend_from_slice(b"\x1b7\x1b[A\r");
            let clipped = line.len().min(self.width.saturating_sub(1));
            out.extend_from_slice(&line.as_bytes()[..clipped]);
            out.extend_from_slice(b"\x1b[K\x1b8");
        } else {
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
        }
        self.channel.write_all(&out)
    }

    /// Restore the terminal and close the channel.  Monitor exit path.
    pub(crate) fn finish(self) {
        self.channel.restore_terminal();
        self.channel.close();
    }
}

/// One isolated width query.
///
/// Saves the terminal attributes, asks for the window size, and restores
/// the attributes whatever happens, so that a racing recipe that toggles
/// the terminal never sees our query.
#[cfg(unix)]
fn query_width_isolated(fd: i32) -> Option<usize> {
    // SAFETY: tcgetattr/ioctl/tcsetattr on our own descriptor, with a
    // zero-initialized termios/winsize to fill in.
    unsafe {
        let mut saved: libc::termios = mem::zeroed();
        if libc::tcgetattr(fd, &mut saved) != 0 {
            return None;
        }
        let mut ws: libc::winsize = mem::zeroed();
        let rc = libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws);
        let _ = libc::tcsetattr(fd, libc::TCSANOW, &saved);
        if rc != 0 || ws.ws_col == 0 {
            return None;
        }
        Some(usize::from(ws.ws_col))
    }
}

/// Compose one status line.  Pure, for the tests.
fn format_status_line(snap: &StatusSnapshot, frame: usize) -> String {
    let spinner = char::from(SPINNER[frame % SPINNER.len()]);
    let bar = format_bar(snap);
    format!(
        "{spinner} [{bar}] {:>3}% ({}) {} jobs",
        snap.host.used_percent(),
        snap.host.avail,
        snap.jobs,
    )
}

/// The four-zone bar.
///
/// Zones in order: build-tracked memory (`#`), other used memory (`=`),
/// imminent (`+`), free (space).  Widths are proportional to each zone's
/// share of total memory; rounding slack goes to the free zone.
fn format_bar(snap: &StatusSnapshot) -> String {
    let total = snap.host.total.as_u64().max(1);
    let build = snap.build_rss.as_u64().min(total);
    let used = snap
        .host
        .total
        .saturating_sub(snap.host.avail)
        .as_u64()
        .saturating_sub(build)
        .min(total - build);
    let imminent = snap.imminent.as_u64().min(total - build - used);

    /// Proportional width of one zone
    fn cols(amount: u64, total: u64) -> usize {
        usize::try_from(amount.saturating_mul(BAR_WIDTH as u64) / total).unwrap_or(0)
    }

    let w_build = cols(build, total);
    let w_used = cols(used, total);
    let w_imminent = cols(imminent, total);
    let w_free = BAR_WIDTH.saturating_sub(w_build + w_used + w_imminent);

    let mut bar = String::with_capacity(BAR_WIDTH);
    bar.extend(std::iter::repeat_n('#', w_build));
    bar.extend(std::iter::repeat_n('=', w_used));
    bar.extend(std::iter::repeat_n('+', w_imminent));
    bar.extend(std::iter::repeat_n(' ', w_free));
    bar
}
