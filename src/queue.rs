//! Pending-connection queues and admission.
//!
//! A session that picked a saturated server waits in that server's FIFO;
//! a session without an assigned server waits in the backend's FIFO. A
//! session sits in at most one queue at a time, tracked by its `pend_pos`.
//! Slots open when a connection is released or a server comes back up, and
//! are handed out strictly in FIFO order, server queue first.

use crate::proxy::server::Server;
use crate::proxy::Backend;

/// Where a queued session is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendPos {
    /// Owning backend.
    pub be: usize,
    /// Server queue when set, backend queue otherwise.
    pub srv: Option<usize>,
}

/// Effective connection cap of a server under current backend load.
///
/// With `fullconn` set, the cap ramps up linearly with the backend's
/// connection count and never drops below one slot.
#[must_use]
pub fn srv_dynamic_maxconn(s: &Server, beconn: u32, fullconn: u32) -> u32 {
    if fullconn == 0 || beconn >= fullconn {
        s.maxconn
    } else {
        let scaled = u64::from(s.maxconn) * u64::from(beconn) / u64::from(fullconn);
        (scaled as u32).max(1)
    }
}

/// Outcome of trying to park a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Parked at the returned position.
    Queued(PendPos),
    /// The server's queue is at `maxqueue`.
    ServerQueueFull,
}

/// Parks a session on a server queue (when `srv` is set) or the backend
/// queue, respecting `maxqueue`.
pub fn pendconn_add(be_id: usize, be: &mut Backend, srv: Option<usize>, sid: usize) -> EnqueueResult {
    match srv {
        Some(s) => {
            let server = &mut be.servers[s];
            if server.maxqueue > 0 && server.nbpend() >= server.maxqueue {
                return EnqueueResult::ServerQueueFull;
            }
            server.pend.push_back(sid);
            EnqueueResult::Queued(PendPos {
                be: be_id,
                srv: Some(s),
            })
        }
        None => {
            be.pend.push_back(sid);
            EnqueueResult::Queued(PendPos { be: be_id, srv: None })
        }
    }
}

/// Removes a parked session (timeout, abort).
pub fn pendconn_remove(be: &mut Backend, pos: PendPos, sid: usize) {
    let q = match pos.srv {
        Some(s) => &mut be.servers[s].pend,
        None => &mut be.pend,
    };
    if let Some(i) = q.iter().position(|&x| x == sid) {
        q.remove(i);
    }
}

/// Total sessions parked on the backend and all its servers.
#[must_use]
pub fn total_pending(be: &Backend) -> usize {
    be.pend.len() + be.servers.iter().map(|s| s.pend.len()).sum::<usize>()
}

/// Pops the next session eligible for `srv`: its own queue first, then the
/// backend's shared queue.
fn pendconn_next(be: &mut Backend, srv: usize) -> Option<usize> {
    if let Some(sid) = be.servers[srv].pend.pop_front() {
        return Some(sid);
    }
    be.pend.pop_front()
}

/// Promotes as many parked sessions as `srv` has free slots for, FIFO.
/// Returns the promoted session ids; the caller assigns the server and
/// wakes each one.
pub fn process_pending(be: &mut Backend, srv: usize) -> Vec<usize> {
    let mut out = Vec::new();
    if !be.servers[srv].usable() {
        return out;
    }
    loop {
        let s = &be.servers[srv];
        let cap = if s.maxconn == 0 {
            u32::MAX
        } else {
            srv_dynamic_maxconn(s, be.beconn, be.fullconn)
        };
        // count already-promoted sessions against the budget: they will
        // take their slot before the next scheduler iteration
        if s.served + out.len() as u32 >= cap {
            break;
        }
        match pendconn_next(be, srv) {
            Some(sid) => out.push(sid),
            None => break,
        }
    }
    out
}
