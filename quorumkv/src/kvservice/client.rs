use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use futures::executor::block_on;

use crate::proto::kvpb::*;

use super::ERR_NO_KEY;

static CLERK_ID: AtomicU64 = AtomicU64::new(0);

/// Pause after a full unsuccessful sweep over the servers, to let an
/// election finish instead of hammering candidates.
const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// A client of the service. Assigns itself a process-unique id and a
/// monotone sequence number per request; the pair is what the servers key
/// duplicate suppression on, so a sequence number is never reused.
pub struct Clerk {
    pub name: String,
    pub servers: Vec<KvClient>,
    id: u64,
    seq: Cell<u64>,
    // the slot that last answered as leader; first guess for the next op
    leader: Cell<usize>,
    // mapping from server ids (replies name their sender) to slots in
    // `servers`, which the harness hands out in shuffled order
    slots: RefCell<HashMap<u64, usize>>,
}

impl fmt::Debug for Clerk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clerk").field("name", &self.name).finish()
    }
}

impl Clerk {
    pub fn new(name: String, servers: Vec<KvClient>) -> Clerk {
        Clerk {
            name,
            servers,
            id: CLERK_ID.fetch_add(1, Ordering::Relaxed),
            seq: Cell::new(0),
            leader: Cell::new(0),
            slots: RefCell::new(HashMap::new()),
        }
    }

    fn next_seq(&self) -> u64 {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        seq
    }

    /// Moves to the hinted leader when one was offered and its slot is
    /// known, otherwise to the next server round-robin.
    fn next_server(&self, hint: i64) {
        if hint >= 0 {
            if let Some(&slot) = self.slots.borrow().get(&(hint as u64)) {
                self.leader.set(slot);
                return;
            }
        }
        self.leader.set((self.leader.get() + 1) % self.servers.len());
    }

    /// Fetches the current value for a key; returns "" if the key does not
    /// exist. Keeps trying forever in the face of all other errors.
    pub fn get(&self, key: String) -> String {
        let args = GetArgs {
            clerk_id: self.id,
            seq_id: self.next_seq(),
            key,
        };
        debug!("{}: get({:?})", self.name, args.key);

        let mut attempts = 0;
        loop {
            let server = self.leader.get();
            match block_on(self.servers[server].get(&args)) {
                Ok(ref reply) if !reply.wrong_leader => {
                    if reply.err == ERR_NO_KEY {
                        return String::new();
                    }
                    return reply.value.clone();
                }
                Ok(reply) => {
                    self.slots.borrow_mut().insert(reply.server, server);
                    self.next_server(reply.leader);
                }
                Err(_) => self.next_server(-1),
            }
            attempts += 1;
            if attempts % self.servers.len() == 0 {
                thread::sleep(RETRY_PAUSE);
            }
        }
    }

    /// Shared by put and append.
    fn put_append(&self, key: String, value: String, op: CmdKind) {
        let args = PutAppendArgs {
            clerk_id: self.id,
            seq_id: self.next_seq(),
            key,
            value,
            op: op as i32,
        };
        debug!("{}: {:?}({:?})", self.name, op, args.key);

        let mut attempts = 0;
        loop {
            let server = self.leader.get();
            match block_on(self.servers[server].put_append(&args)) {
                Ok(ref reply) if !reply.wrong_leader => return,
                Ok(reply) => {
                    self.slots.borrow_mut().insert(reply.server, server);
                    self.next_server(reply.leader);
                }
                Err(_) => self.next_server(-1),
            }
            attempts += 1;
            if attempts % self.servers.len() == 0 {
                thread::sleep(RETRY_PAUSE);
            }
        }
    }

    pub fn put(&self, key: String, value: String) {
        self.put_append(key, value, CmdKind::Put)
    }

    pub fn append(&self, key: String, value: String) {
        self.put_append(key, value, CmdKind::Append)
    }
}
