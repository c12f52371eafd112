//! Deferred signal delivery.
//!
//! Real signal handlers must be async-safe, so they do exactly two things:
//! set a per-signal pending flag and write one byte into a self-pipe (both
//! provided by `signal-hook`). The pipe's read end is registered with the
//! poller, which turns signal arrival into an ordinary wakeup; the actual
//! handler work runs in the scheduler's signal pass at the top of the loop.
//!
//! Signal number 0 cannot be delivered by the kernel; it is the internal
//! broadcast channel used to wake every proxy management task at once.

use std::collections::VecDeque;
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The internal broadcast pseudo-signal.
pub const SIG_INTERNAL: i32 = 0;

/// Pending-signal state for one worker.
#[derive(Debug)]
pub struct Signals {
    pipe_r: UnixStream,
    pipe_w: UnixStream,
    watched: Vec<(i32, Arc<AtomicBool>)>,
    internal: VecDeque<i32>,
}

impl Signals {
    /// Creates the self-pipe. No signals are watched yet.
    pub fn new() -> std::io::Result<Self> {
        let (pipe_r, pipe_w) = UnixStream::pair()?;
        pipe_r.set_nonblocking(true)?;
        pipe_w.set_nonblocking(true)?;
        Ok(Self {
            pipe_r,
            pipe_w,
            watched: Vec::new(),
            internal: VecDeque::new(),
        })
    }

    /// The fd to register with the poller for read interest.
    #[must_use]
    pub fn pipe_fd(&self) -> RawFd {
        self.pipe_r.as_raw_fd()
    }

    /// Starts watching an OS signal.
    pub fn watch(&mut self, sig: i32) -> std::io::Result<()> {
        let flag = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(sig, Arc::clone(&flag))
            .map_err(std::io::Error::other)?;
        signal_hook::low_level::pipe::register_raw(sig, self.pipe_w.as_raw_fd())
            .map_err(std::io::Error::other)?;
        self.watched.push((sig, flag));
        Ok(())
    }

    /// Queues an internal broadcast, processed by the next signal pass.
    pub fn raise_internal(&mut self) {
        self.internal.push_back(SIG_INTERNAL);
    }

    /// True when a pass would find something to do.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.internal.is_empty() || self.watched.iter().any(|(_, f)| f.load(Ordering::Relaxed))
    }

    /// Collects pending signals and clears their state. Also drains the
    /// wake pipe so the poller goes back to sleep afterwards.
    pub fn drain(&mut self) -> Vec<i32> {
        let mut buf = [0u8; 64];
        while matches!(self.pipe_r.read(&mut buf), Ok(n) if n > 0) {}

        let mut out: Vec<i32> = self.internal.drain(..).collect();
        for (sig, flag) in &self.watched {
            if flag.swap(false, Ordering::Relaxed) {
                out.push(*sig);
            }
        }
        out
    }
}
