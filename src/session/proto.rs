//! Non-blocking socket I/O between sessions and their ring buffers.
//!
//! These helpers run from poller callbacks. They drain or fill as much
//! as the socket allows in one go, translate the outcome into buffer
//! flags, and report blocking back to the poller so interest lands in
//! the right place (speculative attempts demote to kernel waits here).

use super::stream_int::{SiFlags, StreamInt};
use crate::buffer::{BufFlags, Buffer};
use crate::poller::{Dir, Poller};
use crate::scheduler::FdOwner;
use crate::ticks::{tick_add_ifset, Tick, TICK_ETERNITY};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpStream};

/// Starts a non-blocking connect. A pending (`EINPROGRESS`) attempt is a
/// success here; completion is observed through write readiness.
pub(crate) fn start_connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_nonblocking(true)?;
    match sock.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(sock.into())
}

/// Reads from the interface's socket into `ib` until the socket blocks,
/// the buffer fills, or the peer closes.
pub(crate) fn si_read(
    now: Tick,
    poller: &mut Poller<FdOwner>,
    si: &mut StreamInt,
    ib: &mut Buffer,
) {
    let Some(tok) = si.tok else {
        return;
    };
    let Some(sock) = si.sock.as_mut() else {
        return;
    };
    loop {
        if ib.is_full() {
            // no room: reading resumes once the consumer made space
            poller.stop(tok, Dir::Read);
            break;
        }
        match ib.read_from(sock) {
            Ok(0) => {
                ib.flags.set(BufFlags::READ_NULL | BufFlags::SHUTR);
                ib.rex = TICK_ETERNITY;
                poller.stop(tok, Dir::Read);
                break;
            }
            Ok(_) => {
                ib.flags.set(BufFlags::READ_ACTIVITY);
                ib.rex = tick_add_ifset(now, ib.rto);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                poller.cant(tok, Dir::Read);
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => {
                ib.flags.set(BufFlags::READ_ERROR);
                ib.rex = TICK_ETERNITY;
                si.flags.set(SiFlags::ERR);
                break;
            }
        }
    }
}

/// Writes buffered bytes from `ob` to the interface's socket until the
/// socket blocks or the buffer drains. Write progress refreshes this
/// side's read deadline too, unless the streams are independent.
pub(crate) fn si_write(
    now: Tick,
    poller: &mut Poller<FdOwner>,
    si: &mut StreamInt,
    ob: &mut Buffer,
    ib: &mut Buffer,
) {
    let Some(tok) = si.tok else {
        return;
    };
    let Some(sock) = si.sock.as_mut() else {
        return;
    };
    loop {
        if ob.is_empty() {
            poller.stop(tok, Dir::Write);
            break;
        }
        match ob.write_to(sock) {
            Ok(0) => break,
            Ok(_) => {
                ob.flags.set(BufFlags::WRITE_ACTIVITY);
                ob.wex = tick_add_ifset(now, ob.wto);
                if !si.flags.has(SiFlags::INDEP_STR) {
                    ib.rex = tick_add_ifset(now, ib.rto);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                poller.cant(tok, Dir::Write);
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => {
                ob.flags.set(BufFlags::WRITE_ERROR);
                ob.wex = TICK_ETERNITY;
                si.flags.set(SiFlags::ERR);
                break;
            }
        }
    }
}

/// Checks the outcome of a pending connect on write readiness. Returns
/// true when the session should be woken (success or failure); a still
/// pending connect re-arms the kernel wait instead.
pub(crate) fn conn_check(
    poller: &mut Poller<FdOwner>,
    si: &mut StreamInt,
    req: &mut Buffer,
) -> bool {
    let Some(tok) = si.tok else {
        return false;
    };
    let Some(sock) = si.sock.as_ref() else {
        return false;
    };
    match sock.take_error() {
        Ok(Some(_)) => {
            si.flags.set(SiFlags::ERR);
            true
        }
        Err(_) => {
            si.flags.set(SiFlags::ERR);
            true
        }
        Ok(None) => match sock.peer_addr() {
            Ok(_) => {
                // connected; a zero-length "write" is the completion mark
                req.flags.set(BufFlags::WRITE_NULL | BufFlags::WRITE_ACTIVITY);
                true
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.raw_os_error() == Some(libc::ENOTCONN) =>
            {
                poller.cant(tok, Dir::Write);
                false
            }
            Err(_) => {
                si.flags.set(SiFlags::ERR);
                true
            }
        },
    }
}
