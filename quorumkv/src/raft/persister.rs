//! Durable storage for a raft peer's persistent state and, when a service
//! chooses to take them, its snapshots. Both blobs are opaque bytes; the
//! combined save is atomic.

use std::sync::{Arc, Mutex};

pub trait Persister: Send + 'static {
    fn raft_state(&self) -> Vec<u8>;
    fn save_raft_state(&self, state: Vec<u8>);
    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>);
    fn snapshot(&self) -> Vec<u8>;
}

impl<T: ?Sized + Persister> Persister for Box<T> {
    fn raft_state(&self) -> Vec<u8> {
        (**self).raft_state()
    }
    fn save_raft_state(&self, state: Vec<u8>) {
        (**self).save_raft_state(state)
    }
    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) {
        (**self).save_state_and_snapshot(state, snapshot)
    }
    fn snapshot(&self) -> Vec<u8> {
        (**self).snapshot()
    }
}

impl<T: ?Sized + Sync + Persister> Persister for Arc<T> {
    fn raft_state(&self) -> Vec<u8> {
        (**self).raft_state()
    }
    fn save_raft_state(&self, state: Vec<u8>) {
        (**self).save_raft_state(state)
    }
    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) {
        (**self).save_state_and_snapshot(state, snapshot)
    }
    fn snapshot(&self) -> Vec<u8> {
        (**self).snapshot()
    }
}

/// In-memory persister used by the cluster test harnesses. The harness keeps
/// an `Arc` so a restarted peer can be seeded with its predecessor's state.
pub struct MemPersister {
    states: Mutex<(
        Vec<u8>, // raft state
        Vec<u8>, // snapshot
    )>,
}

impl MemPersister {
    pub fn new() -> MemPersister {
        MemPersister {
            states: Mutex::default(),
        }
    }
}

impl Persister for MemPersister {
    fn raft_state(&self) -> Vec<u8> {
        self.states.lock().unwrap().0.clone()
    }

    fn save_raft_state(&self, state: Vec<u8>) {
        self.states.lock().unwrap().0 = state;
    }

    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) {
        let mut states = self.states.lock().unwrap();
        states.0 = state;
        states.1 = snapshot;
    }

    fn snapshot(&self) -> Vec<u8> {
        self.states.lock().unwrap().1.clone()
    }
}
