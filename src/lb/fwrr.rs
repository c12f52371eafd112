//! Fast weighted round-robin.
//!
//! Each partition (active, backup) runs a rotation over three trees. The
//! `curr` tree holds servers ordered by their next emission position; two
//! spare trees alternate in the `init`/`next` roles, keyed by inverted
//! weight so heavy servers come out first. A server's position advances by
//! `next_weight / eweight` per pick with the remainder accumulated in
//! `rweight`, so the product of position and weight behaves like a
//! fractional counter: heavy servers are emitted often but never twice in
//! a row while a lighter one still has credit.
//!
//! Servers whose next position falls outside the current window move to
//! the `next` tree; when both `curr` and `init` run dry the trees switch
//! roles (at most once per pick) and the window restarts.

use super::{
    commit_transition, first_usable_backup, srv_is_full, transition_is_noop,
    update_backend_weight, was_usable, LbAlgo, NodeKey, Tree,
};
use crate::proxy::server::{Server, SrvState, BE_WEIGHT_SCALE, SRV_EWGHT_MAX, SRV_UWGHT_RANGE};
use crate::proxy::Backend;

/// Rotation location of one server.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum FwrrLoc {
    /// Not in any tree (down or unweighted).
    #[default]
    None,
    /// In spare tree 0.
    T0,
    /// In spare tree 1.
    T1,
    /// In the current rotation tree.
    Curr,
}

/// Per-server rotation bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
struct FwrrSrv {
    node: Option<NodeKey>,
    loc: FwrrLoc,
    /// Next emission position.
    npos: i64,
    /// Last emission position.
    lpos: i64,
    /// Accumulated fractional weight remainder.
    rweight: i64,
}

/// One partition's rotation.
#[derive(Debug)]
struct FwrrGroup {
    curr: Tree,
    t0: Tree,
    t1: Tree,
    /// Which spare tree currently plays the `init` role.
    init_is_t0: bool,
    curr_pos: i64,
    curr_weight: i64,
    next_weight: i64,
}

impl Default for FwrrGroup {
    fn default() -> Self {
        Self {
            curr: Tree::default(),
            t0: Tree::default(),
            t1: Tree::default(),
            init_is_t0: true,
            curr_pos: 0,
            curr_weight: 0,
            next_weight: 0,
        }
    }
}

impl FwrrGroup {
    fn init_tree_mut(&mut self) -> &mut Tree {
        if self.init_is_t0 {
            &mut self.t0
        } else {
            &mut self.t1
        }
    }

    fn init_tree(&self) -> &Tree {
        if self.init_is_t0 {
            &self.t0
        } else {
            &self.t1
        }
    }

    fn next_tree_mut(&mut self) -> &mut Tree {
        if self.init_is_t0 {
            &mut self.t1
        } else {
            &mut self.t0
        }
    }

    fn init_loc(&self) -> FwrrLoc {
        if self.init_is_t0 {
            FwrrLoc::T0
        } else {
            FwrrLoc::T1
        }
    }

    fn next_loc(&self) -> FwrrLoc {
        if self.init_is_t0 {
            FwrrLoc::T1
        } else {
            FwrrLoc::T0
        }
    }
}

/// Round-robin state of one backend.
#[derive(Debug, Default)]
pub struct FwrrState {
    act: FwrrGroup,
    bck: FwrrGroup,
    srv: Vec<FwrrSrv>,
}

impl FwrrState {
    /// Grows the per-server bookkeeping after a runtime `pool.add`.
    pub fn server_added(&mut self) {
        self.srv.push(FwrrSrv::default());
    }
}

/// Queues a server into a spare tree, keyed by inverted weight so heavy
/// servers extract first.
fn queue_by_weight(tree: &mut Tree, loc: FwrrLoc, fs: &mut FwrrSrv, s: &Server, sid: usize) {
    fs.node = Some(tree.insert(SRV_EWGHT_MAX - s.eweight, sid));
    fs.loc = loc;
}

fn dequeue(grp: &mut FwrrGroup, fs: &mut FwrrSrv) {
    if let Some(node) = fs.node.take() {
        match fs.loc {
            FwrrLoc::T0 => {
                grp.t0.remove(node);
            }
            FwrrLoc::T1 => {
                grp.t1.remove(node);
            }
            FwrrLoc::Curr => {
                grp.curr.remove(node);
            }
            FwrrLoc::None => {}
        }
    }
}

/// Adjusts a server's position when extracting it from wherever it sits.
fn get_srv(grp: &FwrrGroup, fs: &mut FwrrSrv) {
    if fs.node.is_none() {
        // was down: restart at the current position
        fs.npos = grp.curr_pos;
    } else if fs.loc == grp.init_loc() {
        fs.npos = 0;
        fs.rweight = 0;
    } else if fs.loc == grp.next_loc() {
        fs.npos += grp.curr_weight;
    }
}

/// Queues a server according to its next position: out-of-window servers
/// wait in the `next` tree, the rest re-enter the current rotation.
fn queue_srv(grp: &mut FwrrGroup, fs: &mut FwrrSrv, s: &Server, sid: usize) {
    if !s.usable() {
        fs.node = None;
        fs.loc = FwrrLoc::None;
    } else if s.eweight == 0
        || fs.npos >= 2 * grp.curr_weight
        || fs.npos >= grp.curr_weight + grp.next_weight
    {
        // delay what does not fit into the window, adjusting the position
        // in case this comes back to the current tree after a switch
        fs.npos -= grp.curr_weight;
        let loc = grp.next_loc();
        queue_by_weight(grp.next_tree_mut(), loc, fs, s, sid);
    } else {
        // the key stores positions in user-weight units to avoid overflow;
        // the remainder term keeps equal positions ordered by weight
        let key = i64::from(SRV_UWGHT_RANGE) * fs.npos
            + (i64::from(SRV_EWGHT_MAX) + fs.rweight - i64::from(s.eweight))
                / i64::from(BE_WEIGHT_SCALE);
        fs.node = Some(grp.curr.insert(key as u32, sid));
        fs.loc = FwrrLoc::Curr;
    }
}

/// Advances a server's position after it was picked.
fn update_position(grp: &FwrrGroup, fs: &mut FwrrSrv, eweight: u32) {
    let ew = i64::from(eweight);
    if fs.npos == 0 {
        // first pick ever for this server
        fs.lpos = grp.curr_pos;
        fs.npos = grp.curr_pos + grp.next_weight / ew;
    } else {
        fs.lpos = fs.npos;
        fs.npos += grp.next_weight / ew;
    }
    fs.rweight += grp.next_weight % ew;
    if fs.rweight >= ew {
        fs.rweight -= ew;
        fs.npos += 1;
    }
}

fn switch_trees(grp: &mut FwrrGroup) {
    grp.init_is_t0 = !grp.init_is_t0;
    grp.curr_weight = grp.next_weight;
    grp.curr_pos = grp.curr_weight;
}

/// Next candidate from the current tree, or from `init` when the current
/// tree is empty or its head has not reached the rotation position yet.
fn get_server_from_group(
    grp: &FwrrGroup,
    fsrv: &mut [FwrrSrv],
    servers: &[Server],
) -> Option<usize> {
    let curr_first = grp.curr.first().map(|(_, sid)| sid);
    let hole = match curr_first {
        Some(sid) => fsrv[sid].npos > grp.curr_pos,
        None => true,
    };
    if hole {
        if let Some((_, sid)) = grp.init_tree().first() {
            fsrv[sid].npos = 0;
            fsrv[sid].rweight = 0;
            if servers[sid].eweight == 0 {
                return None;
            }
            return Some(sid);
        }
    }
    curr_first
}

/// Builds the rotation trees from the backend's current servers.
pub fn init(be: &mut Backend) {
    let Backend { servers, lbprm, .. } = be;
    let LbAlgo::Fwrr(st) = &mut lbprm.algo else {
        return;
    };
    st.srv = vec![FwrrSrv::default(); servers.len()];
    for (grp, tot) in [
        (&mut st.act, i64::from(lbprm.tot_wact)),
        (&mut st.bck, i64::from(lbprm.tot_wbck)),
    ] {
        *grp = FwrrGroup::default();
        grp.curr_pos = tot;
        grp.curr_weight = tot;
        grp.next_weight = tot;
    }
    for sid in 0..servers.len() {
        let s = &servers[sid];
        if !s.usable() {
            continue;
        }
        let grp = if s.state.has(SrvState::BACKUP) {
            &mut st.bck
        } else {
            &mut st.act
        };
        let loc = grp.init_loc();
        queue_by_weight(grp.init_tree_mut(), loc, &mut st.srv[sid], s, sid);
    }
}

/// Selects the next server, skipping saturated ones and `avoid` when any
/// alternative exists. Skipped servers are re-queued afterwards; if a tree
/// switch happened in between they lost their position and re-enter by
/// weight through the `init` tree.
pub fn get_next_server(be: &mut Backend, avoid: Option<usize>) -> Option<usize> {
    let Backend {
        servers,
        lbprm,
        srv_act,
        srv_bck,
        beconn,
        fullconn,
        ..
    } = be;
    let LbAlgo::Fwrr(st) = &mut lbprm.algo else {
        return None;
    };
    let use_backup = if *srv_act > 0 {
        false
    } else if let Some(f) = lbprm.fbck {
        return Some(f);
    } else if *srv_bck > 0 {
        true
    } else {
        return None;
    };
    let FwrrState { act, bck, srv: fsrv } = st;
    let grp = if use_backup { bck } else { act };

    let mut switched = false;
    let mut avoided: Option<usize> = None;
    let mut full: Vec<usize> = Vec::new();
    let chosen: Option<usize>;
    loop {
        // an empty window means weights changed recently: collect them
        if grp.curr_weight == 0 {
            grp.curr_pos = grp.next_weight;
            grp.curr_weight = grp.next_weight;
        }

        let mut cand = get_server_from_group(grp, fsrv, servers);
        while cand.is_none() {
            if switched {
                break;
            }
            switched = true;
            switch_trees(grp);
            cand = get_server_from_group(grp, fsrv, servers);
        }
        // when the rotation ran dry the avoided pick is taken after all;
        // it flows through the extraction below a second time (the
        // dequeue is a no-op then, the position advances once more)
        let sid = match cand.or(avoided) {
            Some(sid) => sid,
            None => {
                chosen = None;
                break;
            }
        };

        // dequeue and advance even a saturated candidate so it can be
        // re-queued at a better place afterwards
        update_position(grp, &mut fsrv[sid], servers[sid].eweight);
        dequeue(grp, &mut fsrv[sid]);
        grp.curr_pos += 1;

        if !srv_is_full(&servers[sid], *beconn, *fullconn) {
            if avoid != Some(sid) || avoided.is_some() {
                chosen = Some(sid);
                break;
            }
            avoided = Some(sid);
        }
        full.push(sid);
    }

    if let Some(sid) = chosen {
        queue_srv(grp, &mut fsrv[sid], &servers[sid], sid);
    }
    for sid in full {
        if Some(sid) == chosen {
            continue;
        }
        if switched {
            let loc = grp.init_loc();
            queue_by_weight(grp.init_tree_mut(), loc, &mut fsrv[sid], &servers[sid], sid);
        } else {
            queue_srv(grp, &mut fsrv[sid], &servers[sid], sid);
        }
    }
    chosen
}

/// Applies a transition towards "down": the server leaves its tree and
/// the partition weights shrink.
pub fn set_server_status_down(be: &mut Backend, sid: usize) {
    if transition_is_noop(be, sid) {
        return;
    }
    if be.servers[sid].usable() {
        // the reported change did not actually take the server down
        commit_transition(be, sid);
        return;
    }
    if was_usable(be, sid) {
        let Backend {
            servers,
            lbprm,
            srv_act,
            srv_bck,
            ..
        } = be;
        let LbAlgo::Fwrr(st) = &mut lbprm.algo else {
            return;
        };
        let backup = servers[sid].state.has(SrvState::BACKUP);
        let grp = if backup { &mut st.bck } else { &mut st.act };
        grp.next_weight -= i64::from(servers[sid].prev_eweight);
        if backup {
            lbprm.tot_wbck = grp.next_weight as u32;
            *srv_bck -= 1;
            if lbprm.fbck == Some(sid) {
                lbprm.fbck = first_usable_backup(servers);
            }
        } else {
            lbprm.tot_wact = grp.next_weight as u32;
            *srv_act -= 1;
        }
        dequeue(grp, &mut st.srv[sid]);
        st.srv[sid].loc = FwrrLoc::None;
    }
    update_backend_weight(be);
    commit_transition(be, sid);
}

/// Applies a transition towards "up": the server re-enters its partition
/// with an initial position that keeps it from monopolising the rotation.
pub fn set_server_status_up(be: &mut Backend, sid: usize) {
    if transition_is_noop(be, sid) {
        return;
    }
    if !be.servers[sid].usable() {
        commit_transition(be, sid);
        return;
    }
    if !was_usable(be, sid) {
        let Backend {
            servers,
            lbprm,
            srv_act,
            srv_bck,
            options,
            ..
        } = be;
        let LbAlgo::Fwrr(st) = &mut lbprm.algo else {
            return;
        };
        let backup = servers[sid].state.has(SrvState::BACKUP);
        let grp = if backup { &mut st.bck } else { &mut st.act };
        grp.next_weight += i64::from(servers[sid].eweight);
        if backup {
            lbprm.tot_wbck = grp.next_weight as u32;
            *srv_bck += 1;
            if !options.use_all_backups {
                lbprm.fbck = first_usable_backup(servers);
            }
        } else {
            lbprm.tot_wact = grp.next_weight as u32;
            *srv_act += 1;
        }
        let fs = &mut st.srv[sid];
        get_srv(grp, fs);
        fs.npos = grp.curr_pos
            + (grp.next_weight + grp.curr_weight - grp.curr_pos)
                / i64::from(servers[sid].eweight);
        queue_srv(grp, fs, &servers[sid], sid);
    }
    update_backend_weight(be);
    commit_transition(be, sid);
}

/// Applies an effective-weight change, rebalancing the server's position
/// without disturbing the rest of the rotation.
pub fn update_server_weight(be: &mut Backend, sid: usize) {
    if transition_is_noop(be, sid) {
        return;
    }
    let old = was_usable(be, sid);
    let new = be.servers[sid].usable();
    if !old && !new {
        commit_transition(be, sid);
        return;
    }
    if !old && new {
        set_server_status_up(be, sid);
        return;
    }
    if old && !new {
        set_server_status_down(be, sid);
        return;
    }

    let Backend {
        servers, lbprm, ..
    } = be;
    let LbAlgo::Fwrr(st) = &mut lbprm.algo else {
        return;
    };
    let s = &servers[sid];
    let backup = s.state.has(SrvState::BACKUP);
    {
        let grp = if backup { &mut st.bck } else { &mut st.act };
        grp.next_weight += i64::from(s.eweight) - i64::from(s.prev_eweight);
    }
    lbprm.tot_wact = st.act.next_weight as u32;
    lbprm.tot_wbck = st.bck.next_weight as u32;

    let grp = if backup { &mut st.bck } else { &mut st.act };
    let fs = &mut st.srv[sid];
    if fs.node.is_some() && fs.loc == grp.init_loc() {
        // still waiting by weight: a re-key is all it takes
        dequeue(grp, fs);
        let loc = grp.init_loc();
        queue_by_weight(grp.init_tree_mut(), loc, fs, s, sid);
    } else if fs.node.is_none() {
        dequeue(grp, fs);
        get_srv(grp, fs);
        fs.npos =
            grp.curr_pos + (grp.next_weight + grp.curr_weight - grp.curr_pos) / i64::from(s.eweight);
        queue_srv(grp, fs, s, sid);
    } else {
        // active or delayed: adjust the next position to the new stride,
        // never earlier than just past the rotation head
        get_srv(grp, fs);
        if s.eweight > 0 {
            let prev_next = fs.npos;
            let step = grp.next_weight / i64::from(s.eweight);
            fs.npos = fs.lpos + step;
            fs.rweight = 0;
            if fs.npos > prev_next {
                fs.npos = prev_next;
            }
            if fs.npos < grp.curr_pos + 2 {
                fs.npos = grp.curr_pos + step;
            }
        } else {
            fs.npos = grp.curr_pos + grp.curr_weight;
        }
        dequeue(grp, fs);
        queue_srv(grp, fs, s, sid);
    }

    update_backend_weight(be);
    commit_transition(be, sid);
}
