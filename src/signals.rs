//! Unified signal source: SIGALRM and SIGTERM are funneled onto a self-pipe
//! the event loop polls like any other fd, exactly like the source's
//! `u_pipefd`/`sig_handler` pair. SIGPIPE is ignored outright so a write to
//! a peer that already closed its end surfaces as an `EPIPE` `Result`
//! instead of killing the process.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, ServerError};

/// Re-arm interval for `SIGALRM`, in seconds. The event loop calls
/// `schedule_alarm()` once per tick, matching `Utils::timer_handler`'s
/// `alarm(TIMESLOT)`.
pub const TIMESLOT: u32 = 5;

/// Which flags fired since the last `drain`, the demux §4.5 asks for:
/// `timeout` (the periodic `SIGALRM`, gating the timer sweep + re-arm) and
/// `stop` (`SIGTERM`, gating the event loop's exit).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalEvents {
    pub timeout: bool,
    pub stop: bool,
}

/// Read end of the self-pipe, registered with epoll by the caller.
///
/// `signal_hook`'s pipe handler writes the same indicator byte regardless
/// of which registered signal fired, so the pipe's contents alone can't
/// tell `SIGALRM` and `SIGTERM` apart — its only job is making sure
/// `epoll_wait` returns promptly. The demux itself is two flags, each set
/// directly by its own raw handler via `signal_hook::flag::register`.
pub struct SignalPipe {
    read_end: UnixStream,
    _write_end: UnixStream,
    alarm: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
}

impl SignalPipe {
    /// Builds the pipe and installs handlers for `SIGALRM` and `SIGTERM`;
    /// ignores `SIGPIPE`. Must be called once, after the epoll instance
    /// exists but before the event loop starts polling.
    pub fn install() -> Result<Self> {
        let (read_end, write_end) = UnixStream::pair().map_err(ServerError::SelfPipe)?;
        read_end.set_nonblocking(true).map_err(ServerError::SelfPipe)?;

        let alarm = Arc::new(AtomicBool::new(false));
        let terminated = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGALRM, alarm.clone())
            .map_err(ServerError::SignalInstall)?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, terminated.clone())
            .map_err(ServerError::SignalInstall)?;

        signal_hook::low_level::pipe::register(
            signal_hook::consts::SIGALRM,
            write_end.try_clone().map_err(ServerError::SelfPipe)?,
        )
        .map_err(ServerError::SignalInstall)?;
        signal_hook::low_level::pipe::register(
            signal_hook::consts::SIGTERM,
            write_end.try_clone().map_err(ServerError::SelfPipe)?,
        )
        .map_err(ServerError::SignalInstall)?;
        // SIG_IGN: an empty handler means a write to a closed peer surfaces
        // as EPIPE on the next syscall instead of killing the process.
        unsafe {
            signal_hook::low_level::register(signal_hook::consts::SIGPIPE, || {})
                .map_err(ServerError::SignalInstall)?;
        }

        schedule_alarm();

        Ok(Self {
            read_end,
            _write_end: write_end,
            alarm,
            terminated,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.read_end.as_raw_fd()
    }

    /// Drains every pending wakeup byte from the pipe and reports which
    /// signals fired since the last call. `timeout` is cleared on read, the
    /// way the source clears its local flag after acting on it; `stop`
    /// latches — once `SIGTERM` arrives the loop is expected to exit.
    pub fn drain(&mut self) -> io::Result<SignalEvents> {
        let mut buf = [0u8; 64];
        loop {
            match self.read_end.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(SignalEvents {
            timeout: self.alarm.swap(false, Ordering::SeqCst),
            stop: self.terminated.load(Ordering::SeqCst),
        })
    }
}

/// Re-arms the next `SIGALRM`. Called once after the timer list's `tick`
/// completes, matching `Utils::timer_handler`.
pub fn schedule_alarm() {
    unsafe {
        libc::alarm(TIMESLOT);
    }
}
