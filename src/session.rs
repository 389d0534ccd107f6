//! Fixed-capacity session table.
//!
//! One slot per in-flight transfer, allocated first-free-slot, keyed by the
//! client's address. The table is the only state shared between the accept
//! loop and session tasks; every access goes through the mutex and a
//! [`SessionSlot`] guard releases its slot on drop, so an abandoned or
//! panicked task can never leak capacity.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

/// Default concurrent-session cap.
pub const DEFAULT_MAX_SESSIONS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Every slot is occupied.
    Full,
    /// The client address already holds a live session.
    Duplicate,
}

#[derive(Debug)]
pub struct SessionTable {
    slots: Mutex<Vec<Option<SocketAddr>>>,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(vec![None; capacity]),
        })
    }

    /// Claim the first free slot for `peer`. At most one live session per
    /// client address.
    pub fn allocate(
        self: &Arc<Self>,
        peer: SocketAddr,
    ) -> std::result::Result<SessionSlot, AllocError> {
        let mut slots = self.lock();
        if slots.iter().any(|slot| *slot == Some(peer)) {
            return Err(AllocError::Duplicate);
        }
        let Some(index) = slots.iter().position(Option::is_none) else {
            return Err(AllocError::Full);
        };
        slots[index] = Some(peer);
        Ok(SessionSlot {
            table: Arc::clone(self),
            index,
            peer,
        })
    }

    pub fn contains(&self, peer: SocketAddr) -> bool {
        self.lock().iter().any(|slot| *slot == Some(peer))
    }

    pub fn active(&self) -> usize {
        self.lock().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, index: usize) {
        self.lock()[index] = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Option<SocketAddr>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Guard for one occupied slot; dropping it frees the slot.
#[derive(Debug)]
pub struct SessionSlot {
    table: Arc<SessionTable>,
    index: usize,
    peer: SocketAddr,
}

impl SessionSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.table.release(self.index);
    }
}
