//! Process-wide serving state
//!
//! The serving phase and the currently observed leader are the only values
//! in the server mutated without a broader lock. Both live here so the
//! allowed transitions are visible in one place.

use crate::coordinator::member::Member;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServingPhase {
    /// Components are being built; nothing is served yet
    Created = 0,
    Serving = 1,
    Closed = 2,
}

impl ServingPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServingPhase::Created,
            1 => ServingPhase::Serving,
            _ => ServingPhase::Closed,
        }
    }
}

impl std::fmt::Display for ServingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServingPhase::Created => write!(f, "created"),
            ServingPhase::Serving => write!(f, "serving"),
            ServingPhase::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug)]
pub struct ProcessState {
    phase: AtomicU8,
    leader: ArcSwapOption<Member>,
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(ServingPhase::Created as u8),
            leader: ArcSwapOption::empty(),
        }
    }

    pub fn phase(&self) -> ServingPhase {
        ServingPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn is_serving(&self) -> bool {
        self.phase() == ServingPhase::Serving
    }

    /// Move `from -> to` atomically. Only forward transitions are legal;
    /// returns false if the current phase was not `from`.
    pub fn transition(&self, from: ServingPhase, to: ServingPhase) -> bool {
        if (to as u8) <= (from as u8) {
            return false;
        }
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// The leader this node currently believes in (possibly itself)
    pub fn leader(&self) -> Option<Arc<Member>> {
        self.leader.load_full()
    }

    pub fn set_leader(&self, leader: Option<Member>) {
        self.leader.store(leader.map(Arc::new));
    }
}
