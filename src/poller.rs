//! File-descriptor readiness tracking with speculative I/O.
//!
//! Each registered fd tracks one state per direction:
//!
//! - `Idle`: not interested
//! - `Spec`: try the I/O optimistically, without asking the kernel first
//! - `Wait`: interest registered with the kernel poller
//! - `Stop`: was `Wait`, interest withdrawn, kernel cleanup pending
//!
//! A freshly accepted connection goes straight to `Spec` for reads, and a
//! freshly connected one to `Spec` for writes: the first I/O attempt almost
//! always succeeds, which saves one registration syscall per connection.
//! Only when an attempt reports "would block" does the direction demote to
//! `Wait` ([`Poller::cant`]). A direction is never `Spec` and `Wait` at the
//! same time, so the speculative list can never exceed half the tracked
//! directions, which bounds the work done per pass.
//!
//! `Stop` entries sit in the speculative list so the next pass can flush
//! their kernel registration lazily, batching deregistrations.
//!
//! The kernel side is the `polling` crate (epoll/kqueue behind one API).
//! Its notifications are oneshot: after an event fires the registration is
//! disarmed and must be re-armed with `modify()`, which [`Poller::wait`]
//! does right after collecting events for directions still in `Wait`.

use crate::ticks::MAX_DELAY_MS;
use polling::{Event, Poller as KernelPoller};
use slab::Slab;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Number of speculative completions considered "enough work" for one
/// pass; with this many in hand the kernel poll runs with a zero timeout
/// so polled fds cannot be starved by a busy speculative list.
pub const MIN_RETURN_EVENTS: usize = 25;

/// Handle to a tracked fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

/// An I/O direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    /// Readable side.
    Read,
    /// Writable side.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum DirState {
    #[default]
    Idle,
    Spec,
    Wait,
    Stop,
}

#[derive(Debug)]
struct FdEntry<O> {
    raw: RawFd,
    owner: O,
    r: DirState,
    w: DirState,
    /// Back-reference into the speculative list for O(1) removal.
    spec_pos: Option<usize>,
    /// Whether the kernel poller currently knows this fd.
    registered: bool,
}

/// One readiness event handed to the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct FdEvent<O> {
    /// The fd the event belongs to.
    pub token: Token,
    /// Owner tag installed at registration.
    pub owner: O,
    /// Read readiness (or speculative read attempt requested).
    pub readable: bool,
    /// Write readiness (or speculative write attempt requested).
    pub writable: bool,
    /// True when this event came from the speculative pass, not the kernel.
    pub speculative: bool,
}

/// Readiness tracker for all fds of one worker.
pub struct Poller<O> {
    kernel: KernelPoller,
    fds: Slab<FdEntry<O>>,
    spec: Vec<usize>,
}

impl<O> std::fmt::Debug for Poller<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("fds", &self.fds.len())
            .field("spec", &self.spec.len())
            .finish_non_exhaustive()
    }
}

impl<O: Copy> Poller<O> {
    /// Creates the tracker and its kernel poller.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            kernel: KernelPoller::new()?,
            fds: Slab::new(),
            spec: Vec::new(),
        })
    }

    /// Number of tracked fds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// True when no fd is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Starts tracking an fd. No interest is requested yet.
    pub fn register(&mut self, raw: RawFd, owner: O) -> Token {
        Token(self.fds.insert(FdEntry {
            raw,
            owner,
            r: DirState::Idle,
            w: DirState::Idle,
            spec_pos: None,
            registered: false,
        }))
    }

    /// Stops tracking an fd. The caller closes it afterwards.
    pub fn unregister(&mut self, tok: Token) {
        if !self.fds.contains(tok.0) {
            return;
        }
        self.spec_remove(tok.0);
        let entry = self.fds.remove(tok.0);
        if entry.registered {
            let _ = self.kernel.delete(entry.raw);
        }
    }

    /// The owner tag of a tracked fd.
    #[must_use]
    pub fn owner(&self, tok: Token) -> Option<O> {
        self.fds.get(tok.0).map(|e| e.owner)
    }

    fn dir_mut(e: &mut FdEntry<O>, dir: Dir) -> &mut DirState {
        match dir {
            Dir::Read => &mut e.r,
            Dir::Write => &mut e.w,
        }
    }

    /// Requests interest in a direction. A new interest starts speculative.
    pub fn want(&mut self, tok: Token, dir: Dir) {
        let Some(e) = self.fds.get_mut(tok.0) else {
            return;
        };
        match *Self::dir_mut(e, dir) {
            DirState::Idle => {
                *Self::dir_mut(e, dir) = DirState::Spec;
                self.spec_add(tok.0);
            }
            DirState::Stop => {
                // interest came back before the lazy flush ran
                *Self::dir_mut(e, dir) = DirState::Wait;
                self.spec_trim(tok.0);
                self.sync_kernel(tok.0);
            }
            DirState::Spec | DirState::Wait => {}
        }
    }

    /// Reports that an I/O attempt would block: the direction moves under
    /// kernel supervision (and is re-armed if it already was there).
    pub fn cant(&mut self, tok: Token, dir: Dir) {
        let Some(e) = self.fds.get_mut(tok.0) else {
            return;
        };
        *Self::dir_mut(e, dir) = DirState::Wait;
        self.spec_trim(tok.0);
        self.sync_kernel(tok.0);
    }

    /// Drops interest in a direction.
    pub fn stop(&mut self, tok: Token, dir: Dir) {
        let Some(e) = self.fds.get_mut(tok.0) else {
            return;
        };
        match *Self::dir_mut(e, dir) {
            DirState::Spec => {
                *Self::dir_mut(e, dir) = DirState::Idle;
                self.spec_trim(tok.0);
            }
            DirState::Wait => {
                // flushed lazily by the next speculative pass
                *Self::dir_mut(e, dir) = DirState::Stop;
                self.spec_add(tok.0);
            }
            DirState::Idle | DirState::Stop => {}
        }
    }

    /// Collects ready events: first the speculative pass, then the kernel
    /// poll. The kernel poll uses a zero timeout whenever the speculative
    /// pass produced work; past [`MIN_RETURN_EVENTS`] speculative events
    /// the call returns at once and polled fds get their turn on the next
    /// iteration, which the spec-list size bound keeps close. Returns the
    /// number of events appended.
    pub fn wait(
        &mut self,
        timeout: Option<u32>,
        events: &mut Vec<FdEvent<O>>,
    ) -> io::Result<usize> {
        let before = events.len();

        // Pass 1: speculative list. Flush Stop entries, emit Spec ones.
        let mut i = 0;
        while i < self.spec.len() {
            let key = self.spec[i];
            let e = &mut self.fds[key];
            if e.r == DirState::Stop {
                e.r = DirState::Idle;
            }
            if e.w == DirState::Stop {
                e.w = DirState::Idle;
            }
            let rd = e.r == DirState::Spec;
            let wr = e.w == DirState::Spec;
            let owner = e.owner;
            if rd || wr {
                events.push(FdEvent {
                    token: Token(key),
                    owner,
                    readable: rd,
                    writable: wr,
                    speculative: true,
                });
                i += 1;
            } else {
                self.sync_kernel(key);
                self.spec_remove(key);
                // spec_remove swapped another key into position i
            }
        }
        let spec_events = events.len() - before;
        if spec_events >= MIN_RETURN_EVENTS {
            // enough work in hand; the kernel poll runs next iteration,
            // by which time most of these will have demoted to Wait
            return Ok(spec_events);
        }

        // Pass 2: kernel poll, non-blocking when speculative work exists.
        let kto = if spec_events > 0 {
            Some(Duration::ZERO)
        } else {
            Some(Duration::from_millis(u64::from(
                timeout.unwrap_or(MAX_DELAY_MS).min(MAX_DELAY_MS),
            )))
        };
        let mut kevents: Vec<Event> = Vec::with_capacity(64);
        match self.kernel.wait(&mut kevents, kto) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        for kev in &kevents {
            let Some(e) = self.fds.get(kev.key) else {
                continue;
            };
            let rd = kev.readable && e.r == DirState::Wait;
            let wr = kev.writable && e.w == DirState::Wait;
            if rd || wr {
                events.push(FdEvent {
                    token: Token(kev.key),
                    owner: e.owner,
                    readable: rd,
                    writable: wr,
                    speculative: false,
                });
            }
            // oneshot notification consumed: re-arm what is still wanted
            self.sync_kernel(kev.key);
        }

        Ok(events.len() - before)
    }

    /// Recreates the kernel poller, re-registering every waited fd. Must
    /// be called in the child after a `fork()` so readiness queues are not
    /// shared across processes.
    pub fn reopen(&mut self) -> io::Result<()> {
        self.kernel = KernelPoller::new()?;
        for (_, e) in &mut self.fds {
            e.registered = false;
        }
        let keys: Vec<usize> = self.fds.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.sync_kernel(key);
        }
        Ok(())
    }

    /// Brings the kernel registration of one fd in line with its Wait
    /// directions.
    fn sync_kernel(&mut self, key: usize) {
        let Some(e) = self.fds.get_mut(key) else {
            return;
        };
        let want_r = e.r == DirState::Wait;
        let want_w = e.w == DirState::Wait;
        if want_r || want_w {
            let mut ev = Event::none(key);
            ev.readable = want_r;
            ev.writable = want_w;
            let res = if e.registered {
                self.kernel.modify(e.raw, ev)
            } else {
                self.kernel.add(e.raw, ev)
            };
            if res.is_ok() {
                e.registered = true;
            }
        } else if e.registered {
            let _ = self.kernel.delete(e.raw);
            e.registered = false;
        }
    }

    fn spec_add(&mut self, key: usize) {
        if self.fds[key].spec_pos.is_none() {
            self.fds[key].spec_pos = Some(self.spec.len());
            self.spec.push(key);
        }
    }

    /// Removes from the spec list if neither direction needs it anymore.
    fn spec_trim(&mut self, key: usize) {
        let e = &self.fds[key];
        let needed = matches!(e.r, DirState::Spec | DirState::Stop)
            || matches!(e.w, DirState::Spec | DirState::Stop);
        if !needed {
            self.spec_remove(key);
        }
    }

    fn spec_remove(&mut self, key: usize) {
        let Some(pos) = self.fds[key].spec_pos.take() else {
            return;
        };
        self.spec.swap_remove(pos);
        if let Some(&moved) = self.spec.get(pos) {
            self.fds[moved].spec_pos = Some(pos);
        }
    }
}
