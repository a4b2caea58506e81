// vim: tw=80
//! Admission queue for an I/O concentrator
//!
//! Requests are admitted in arrival order and dispatched as soon as doing so
//! cannot reorder conflicting I/O.  Two requests conflict when they touch
//! overlapping byte ranges of the same subfile and at least one of them is a
//! write.  Truncates and size queries conflict with everything.

use std::collections::BTreeMap;
use tracing::trace;
use crate::{
    rpc::Request,
    types::*,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Pending,
    InProgress
}

#[derive(Clone, Debug)]
struct Slot {
    req: Request,
    source: Rank,
    state: State,
}

/// A request that has just been handed out for execution
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Dispatched {
    pub seq: u64,
    pub source: Rank,
    pub req: Request,
}

/// Does `later` have to wait for `earlier`?
fn conflicts(earlier: &Request, later: &Request) -> bool {
    if earlier.is_exclusive() || later.is_exclusive() {
        return true;
    }
    if earlier.subfile() != later.subfile() {
        return false;
    }
    if !earlier.is_write() && !later.is_write() {
        return false;
    }
    match (earlier.range(), later.range()) {
        (Some((s0, e0)), Some((s1, e1))) => s0 < e1 && s1 < e0,
        _ => true
    }
}

/// Requests that have been admitted but not yet completed, keyed by sequence
/// number.
#[derive(Debug, Default)]
pub struct IoQueue {
    entries: BTreeMap<u64, Slot>,
    next_seq: u64,
    pending: usize,
    in_progress: usize,
}

impl IoQueue {
    fn check(&self) {
        debug_assert_eq!(self.pending + self.in_progress, self.entries.len(),
            "queue accounting mismatch");
    }

    /// Admit a new request at the tail.  Returns its sequence number.
    pub fn enqueue(&mut self, source: Rank, req: Request) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(seq, Slot{req, source, state: State::Pending});
        self.pending += 1;
        self.check();
        seq
    }

    /// Mark every request that may now run as in-progress, and return them
    /// in arrival order.
    pub fn try_dispatch(&mut self) -> Vec<Dispatched> {
        let mut ready = Vec::new();
        let mut blocked: Vec<&Slot> = Vec::new();
        let mut head = true;
        for (seq, slot) in self.entries.iter_mut() {
            let is_head = head;
            head = false;
            if slot.req.is_exclusive() {
                if is_head && slot.state == State::Pending {
                    slot.state = State::InProgress;
                    ready.push(Dispatched{seq: *seq, source: slot.source,
                                          req: slot.req});
                }
                // Nothing may pass a truncate or size query
                break;
            }
            if slot.state == State::Pending &&
                !blocked.iter().any(|e| conflicts(&e.req, &slot.req))
            {
                slot.state = State::InProgress;
                ready.push(Dispatched{seq: *seq, source: slot.source,
                                      req: slot.req});
            }
            blocked.push(slot);
        }
        self.pending -= ready.len();
        self.in_progress += ready.len();
        self.check();
        if !ready.is_empty() {
            trace!(n = ready.len(), pending = self.pending,
                   in_progress = self.in_progress, "dispatch");
        }
        ready
    }

    /// Remove a finished request
    pub fn complete(&mut self, seq: u64) {
        match self.entries.remove(&seq) {
            Some(Slot{state: State::InProgress, ..}) => {
                self.in_progress -= 1;
            },
            Some(slot) => {
                panic!("completed request {seq} was never dispatched: {slot:?}")
            },
            None => panic!("completed unknown request {seq}")
        }
        self.check();
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn in_progress(&self) -> usize {
        self.in_progress
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// LCOV_EXCL_STOP
