use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use futures::channel::mpsc::UnboundedSender;
use futures::channel::oneshot;

#[cfg(test)]
pub mod config;
pub mod errors;
pub mod persister;

mod append;
mod fsm;
mod vote;

use self::errors::*;
use self::fsm::Event;
use self::persister::Persister;
use crate::proto::raftpb::*;

/// Interval between leader heartbeats. The apply pump ticks at the same
/// period, and election timeouts are drawn as multiples of it.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_millis(100);
const HEARTBEAT_MS: u64 = 100;

/// As a raft peer learns that successive log entries are committed, it sends
/// an `ApplyMsg` per entry, in index order, on the apply channel passed to
/// [`Raft::new`]. `command_valid = false` is reserved for non-command
/// notifications (e.g. future snapshot installs) and carries no entry.
pub struct ApplyMsg {
    pub command_valid: bool,
    pub command: Vec<u8>,
    pub command_index: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Stopped,
}

impl Default for Role {
    fn default() -> Role {
        Role::Follower
    }
}

/// State of a raft peer as observed by the service layer.
#[derive(Default, Clone, Debug)]
pub struct State {
    pub term: u64,
    pub is_leader: bool,
}

impl State {
    /// The current term of this peer.
    pub fn term(&self) -> u64 {
        self.term
    }
    /// Whether this peer believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }
}

/// A single raft peer.
///
/// All role transitions happen on one driver thread (see [`fsm`]); the mutex
/// around this struct only bridges to the service-facing calls (`start`,
/// `get_state`) and the apply pump. Nothing holds it across a channel wait
/// or an RPC call.
pub struct Raft {
    // RPC end points of all peers
    peers: Vec<RaftClient>,
    // object to hold this peer's persisted state
    persister: Box<dyn Persister>,
    // this peer's index into peers[]
    me: usize,

    role: Role,

    // persistent state; every mutation is followed by persist() before any
    // reply or outbound RPC that depends on it
    current_term: u64,
    voted_for: Option<u64>,
    log: Vec<LogEntry>,

    // volatile state
    commit_index: u64,
    last_applied: u64,

    // leader-only volatile state, reset on every election
    next_index: Vec<u64>,
    match_index: Vec<u64>,

    // best-effort guess at the current leader, handed to redirected clients
    leader_hint: Option<u64>,

    apply_ch: UnboundedSender<ApplyMsg>,

    event_tx: SyncSender<Event>,
    // taken by Node::new, which spawns the driver thread
    event_rx: Option<Receiver<Event>>,
}

impl Raft {
    /// Creates a raft peer. `peers[me]` is this peer's own endpoint; all
    /// peers hold the same ordering. `persister` initially holds the most
    /// recently saved state, if any. Committed entries are announced on
    /// `apply_ch`. Returns quickly; long-running work starts in
    /// [`Node::new`].
    pub fn new(
        peers: Vec<RaftClient>,
        me: usize,
        persister: Box<dyn Persister>,
        apply_ch: UnboundedSender<ApplyMsg>,
    ) -> Raft {
        let raft_state = persister.raft_state();

        // the inbound event channel is bounded by the cluster size so a slow
        // handler cannot stall transport callbacks without bound
        let (event_tx, event_rx) = sync_channel(peers.len().max(1));

        let mut rf = Raft {
            peers,
            persister,
            me,
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            // index 0 is a sentinel, never applied
            log: vec![LogEntry::default()],
            commit_index: 0,
            last_applied: 0,
            next_index: vec![],
            match_index: vec![],
            leader_hint: None,
            apply_ch,
            event_tx,
            event_rx: Some(event_rx),
        };

        // initialize from state persisted before a crash
        rf.restore(&raft_state);

        rf
    }

    /// Saves the persistent fields to stable storage, from where they are
    /// recovered after a crash and restart.
    fn persist(&mut self) {
        let state = PersistedState {
            term: self.current_term,
            voted_for: self.voted_for.map(|v| v as i64).unwrap_or(-1),
            entries: self.log.clone(),
        };
        let mut buf = vec![];
        wirecodec::encode(&state, &mut buf).expect("encode raft state");
        self.persister.save_raft_state(buf);
    }

    /// Restores previously persisted state.
    fn restore(&mut self, data: &[u8]) {
        if data.is_empty() {
            // bootstrap without any state
            return;
        }
        match wirecodec::decode::<PersistedState>(data) {
            Ok(state) => {
                self.current_term = state.term;
                self.voted_for = if state.voted_for < 0 {
                    None
                } else {
                    Some(state.voted_for as u64)
                };
                if !state.entries.is_empty() {
                    self.log = state.entries;
                }
                info!(
                    "N{} restored: term {}, {} entries",
                    self.me,
                    self.current_term,
                    self.log.len() - 1
                );
            }
            Err(e) => panic!("N{} corrupt raft state: {:?}", self.me, e),
        }
    }

    /// Index and term of the last log entry.
    fn last_log_info(&self) -> (u64, u64) {
        let last_index = self.log.len() - 1;
        (last_index as u64, self.log[last_index].term)
    }

    /// The universal term rule: any message carrying a newer term demotes
    /// this peer to follower and clears its vote before the payload is
    /// processed. Returns whether a demotion happened.
    fn observe_term(&mut self, term: u64) -> bool {
        if term > self.current_term {
            debug!(
                "N{} observed term {} > {}, back to follower",
                self.me, term, self.current_term
            );
            self.current_term = term;
            self.voted_for = None;
            self.leader_hint = None;
            self.role = Role::Follower;
            self.persist();
            true
        } else {
            false
        }
    }

    /// Leader bookkeeping is reset here, inside the same critical section
    /// that flips the role, so a concurrent `start` can never observe a
    /// leader with stale next/match indexes.
    fn become_leader(&mut self) {
        info!("N{} becomes leader in term {}", self.me, self.current_term);
        self.role = Role::Leader;
        let peer_count = self.peers.len();
        let next = self.log.len() as u64;
        self.next_index = vec![next; peer_count];
        self.match_index = vec![0; peer_count];
        self.leader_hint = Some(self.me as u64);
        // announce leadership right away
        self.broadcast_append_entries();
    }

    fn start<M>(&mut self, command: &M) -> Result<(u64, u64)>
    where
        M: wirecodec::Message,
    {
        if self.role != Role::Leader {
            return Err(Error::NotLeader(self.leader_hint));
        }
        let mut buf = vec![];
        wirecodec::encode(command, &mut buf).map_err(Error::Encode)?;

        let index = self.log.len() as u64;
        self.log.push(LogEntry {
            term: self.current_term,
            command: buf,
        });
        self.persist();
        debug!(
            "N{} starts agreement on index {} in term {}",
            self.me, index, self.current_term
        );
        // don't wait for the heartbeat tick
        self.broadcast_append_entries();
        Ok((index, self.current_term))
    }

    /// Emits every newly committed entry on the apply channel, strictly in
    /// index order with no gaps.
    fn apply_committed(&mut self) {
        while self.commit_index > self.last_applied {
            self.last_applied += 1;
            let index = self.last_applied;
            let msg = ApplyMsg {
                command_valid: true,
                command: self.log[index as usize].command.clone(),
                command_index: index,
            };
            debug!("N{} applying index {}", self.me, index);
            if self.apply_ch.unbounded_send(msg).is_err() {
                // service is gone, nothing left to notify
                return;
            }
        }
    }
}

// The service-facing handle: a cheap clone around the shared peer. RPC
// requests are enqueued to the driver thread together with a oneshot reply
// sender, so every state mutation is serialized there.
#[derive(Clone)]
pub struct Node {
    raft: Arc<Mutex<Raft>>,
    event_tx: SyncSender<Event>,
    killed: Arc<AtomicBool>,
}

impl Node {
    /// Wraps a freshly created raft peer and starts its driver thread and
    /// apply pump.
    pub fn new(mut raft: Raft) -> Node {
        let event_rx = raft.event_rx.take().expect("raft already driven");
        let event_tx = raft.event_tx.clone();
        let node = Node {
            raft: Arc::new(Mutex::new(raft)),
            event_tx,
            killed: Arc::new(AtomicBool::new(false)),
        };

        let raft = node.raft.clone();
        let killed = node.killed.clone();
        thread::spawn(move || fsm::run(&raft, &event_rx, &killed));

        let raft = node.raft.clone();
        let killed = node.killed.clone();
        thread::spawn(move || loop {
            thread::sleep(HEARTBEAT_PERIOD);
            let mut rf = raft.lock().unwrap();
            if killed.load(Ordering::SeqCst) || rf.role == Role::Stopped {
                return;
            }
            rf.apply_committed();
        });

        node
    }

    /// Starts agreement on the next command to be appended to the log. If
    /// this peer is not the leader, returns [`Error::NotLeader`] at once;
    /// otherwise returns the index the command will occupy if it ever
    /// commits, and the current term. Never blocks on replication, and
    /// returns gracefully even after [`Node::kill`].
    pub fn start<M>(&self, command: &M) -> Result<(u64, u64)>
    where
        M: wirecodec::Message,
    {
        self.raft.lock().unwrap().start(command)
    }

    /// The current term of this peer.
    pub fn term(&self) -> u64 {
        self.raft.lock().unwrap().current_term
    }

    /// Whether this peer believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.raft.lock().unwrap().role == Role::Leader
    }

    /// The current state of this peer.
    pub fn get_state(&self) -> State {
        let rf = self.raft.lock().unwrap();
        State {
            term: rf.current_term,
            is_leader: rf.role == Role::Leader,
        }
    }

    /// Shuts the peer down. The driver thread, the apply pump, and every
    /// in-flight sender task wind down; pending RPC handlers resolve with
    /// an error. A kill is a virtual crash: persisted state survives.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        // best effort wake-up; the driver also checks the flag on timeout
        let _ = self.event_tx.try_send(Event::Shutdown);
    }
}

#[async_trait::async_trait]
impl RaftService for Node {
    async fn request_vote(&self, args: RequestVoteArgs) -> simnet::Result<RequestVoteReply> {
        let (tx, rx) = oneshot::channel();
        if self.event_tx.send(Event::VoteArgs(args, tx)).is_err() {
            return Err(simnet::Error::Stopped);
        }
        rx.await.map_err(simnet::Error::Recv)
    }

    async fn append_entries(&self, args: AppendEntriesArgs) -> simnet::Result<AppendEntriesReply> {
        let (tx, rx) = oneshot::channel();
        if self.event_tx.send(Event::AppendArgs(args, tx)).is_err() {
            return Err(simnet::Error::Stopped);
        }
        rx.await.map_err(simnet::Error::Recv)
    }
}
