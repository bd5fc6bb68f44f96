use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use futures::channel::mpsc::{channel, unbounded, Receiver, Sender, UnboundedReceiver};
use futures::channel::oneshot;
use futures::executor::block_on;
use futures::{select, FutureExt, SinkExt, StreamExt};

use crate::proto::kvpb::*;
use crate::proto::raftpb::RaftClient;
use crate::raft::{self, errors::Error as RaftError, persister::Persister, ApplyMsg};

use super::{ERR_NO_KEY, OK};

/// One client RPC on its way to the request serializer, paired with the
/// oneshot its reply travels back on.
enum KvRequest {
    Get(GetArgs, oneshot::Sender<GetReply>),
    PutAppend(PutAppendArgs, oneshot::Sender<PutAppendReply>),
}

/// Outcome of a commit wait, filled in by the apply consumer.
struct Commit {
    wrong_leader: bool,
    leader: i64,
    err: String,
    value: String,
}

/// The single-slot pending-commit waiter: at most one RPC per server is
/// parked on replication at a time, identified by what it submitted and the
/// log index it expects to occupy.
struct Pending {
    clerk_id: u64,
    seq_id: u64,
    index: u64,
    done: oneshot::Sender<Commit>,
}

/// The replicated state machine proper, plus the per-clerk tracker that
/// gives writes their exactly-once semantics.
#[derive(Default)]
struct Store {
    db: HashMap<String, String>,
    clerk_track: HashMap<u64, u64>,
}

impl Store {
    /// Has this write already been applied?
    fn applied(&self, clerk_id: u64, seq_id: u64) -> bool {
        self.clerk_track
            .get(&clerk_id)
            .map_or(false, |&t| seq_id <= t)
    }

    /// Applies a committed command. A write the tracker already covers is a
    /// no-op, so a duplicate that slipped into the log before its first copy
    /// applied still executes once.
    fn execute(&mut self, cmd: &Command) -> (String, String) {
        let mut value = String::new();
        let mut err = OK.to_owned();
        match CmdKind::from_i32(cmd.kind) {
            Some(CmdKind::Put) => {
                if !self.applied(cmd.clerk_id, cmd.seq_id) {
                    self.db.insert(cmd.key.clone(), cmd.value.clone());
                }
            }
            Some(CmdKind::Append) => {
                if !self.applied(cmd.clerk_id, cmd.seq_id) {
                    self.db
                        .entry(cmd.key.clone())
                        .or_default()
                        .push_str(&cmd.value);
                }
            }
            Some(CmdKind::Get) => match self.db.get(&cmd.key) {
                Some(v) => value = v.clone(),
                None => err = ERR_NO_KEY.to_owned(),
            },
            _ => panic!("unknown command kind {} in the log", cmd.kind),
        }
        (value, err)
    }

    /// Records the command as applied. Runs before any waiter learns of the
    /// commit, so a clerk that got its reply always reads its own writes.
    fn track(&mut self, cmd: &Command) {
        let t = self.clerk_track.entry(cmd.clerk_id).or_insert(cmd.seq_id);
        if cmd.seq_id > *t {
            *t = cmd.seq_id;
        }
    }
}

pub struct KvServer {
    pub rf: raft::Node,
    me: usize,
    // snapshot once the raft state grows this big; nothing drives snapshots
    // yet, the knob is carried for the service interface
    #[allow(dead_code)]
    maxraftstate: Option<usize>,
    store: Arc<Mutex<Store>>,
    pending: Arc<Mutex<Option<Pending>>>,
    issue_tx: Sender<KvRequest>,
    issue_rx: Option<Receiver<KvRequest>>,
    apply_rx: Option<UnboundedReceiver<ApplyMsg>>,
}

impl KvServer {
    pub fn new(
        servers: Vec<RaftClient>,
        me: usize,
        persister: Box<dyn Persister>,
        maxraftstate: Option<usize>,
    ) -> KvServer {
        let (apply_tx, apply_rx) = unbounded();
        let rf = raft::Raft::new(servers, me, persister, apply_tx);
        let rf = raft::Node::new(rf);

        let (issue_tx, issue_rx) = channel(1);

        KvServer {
            rf,
            me,
            maxraftstate,
            store: Arc::new(Mutex::new(Store::default())),
            pending: Arc::new(Mutex::new(None)),
            issue_tx,
            issue_rx: Some(issue_rx),
            apply_rx: Some(apply_rx),
        }
    }
}

/// Serves requests one at a time: tracker check, submit to raft, park on the
/// pending-commit slot until the apply consumer resolves it.
struct Serializer {
    me: usize,
    rf: raft::Node,
    store: Arc<Mutex<Store>>,
    pending: Arc<Mutex<Option<Pending>>>,
}

impl Serializer {
    async fn run(self, mut issuing: Receiver<KvRequest>) {
        while let Some(req) = issuing.next().await {
            match req {
                KvRequest::Get(args, reply_tx) => {
                    let reply = self.serve_get(args).await;
                    let _ = reply_tx.send(reply);
                }
                KvRequest::PutAppend(args, reply_tx) => {
                    let reply = self.serve_put_append(args).await;
                    let _ = reply_tx.send(reply);
                }
            }
        }
        debug!("server {} stops serving requests", self.me);
    }

    async fn serve_get(&self, args: GetArgs) -> GetReply {
        let mut reply = GetReply {
            wrong_leader: false,
            leader: -1,
            err: String::new(),
            value: String::new(),
            server: self.me as u64,
        };
        // reads go through the log too, so they are linearizable
        let cmd = Command {
            kind: CmdKind::Get as i32,
            server_id: self.me as u64,
            clerk_id: args.clerk_id,
            seq_id: args.seq_id,
            key: args.key,
            value: String::new(),
        };
        match self.submit(cmd).await {
            Ok(commit) => {
                reply.wrong_leader = commit.wrong_leader;
                reply.leader = commit.leader;
                reply.err = commit.err;
                reply.value = commit.value;
            }
            Err(hint) => {
                reply.wrong_leader = true;
                reply.leader = hint;
            }
        }
        reply
    }

    async fn serve_put_append(&self, args: PutAppendArgs) -> PutAppendReply {
        let mut reply = PutAppendReply {
            wrong_leader: false,
            leader: -1,
            err: String::new(),
            server: self.me as u64,
        };

        // a retry of a write that already applied is answered without
        // another round of replication
        if self.store.lock().unwrap().applied(args.clerk_id, args.seq_id) {
            debug!(
                "server {} suppresses duplicate ({}, {})",
                self.me, args.clerk_id, args.seq_id
            );
            reply.err = OK.to_owned();
            return reply;
        }

        let cmd = Command {
            kind: args.op,
            server_id: self.me as u64,
            clerk_id: args.clerk_id,
            seq_id: args.seq_id,
            key: args.key,
            value: args.value,
        };
        match self.submit(cmd).await {
            Ok(commit) => {
                reply.wrong_leader = commit.wrong_leader;
                reply.leader = commit.leader;
                reply.err = commit.err;
            }
            Err(hint) => {
                reply.wrong_leader = true;
                reply.leader = hint;
            }
        }
        reply
    }

    /// Hands the command to raft and waits for the slot it was promised to
    /// commit. `Err` carries a leader hint when this server is not the
    /// leader; a cancelled wait (shutdown) also reads as "wrong leader".
    async fn submit(&self, cmd: Command) -> Result<Commit, i64> {
        let (done_tx, done_rx) = oneshot::channel();
        {
            // registering under the slot lock closes the window in which the
            // command could commit and apply before the waiter exists
            let mut slot = self.pending.lock().unwrap();
            let index = match self.rf.start(&cmd) {
                Ok((index, _term)) => index,
                Err(RaftError::NotLeader(hint)) => {
                    return Err(hint.map(|h| h as i64).unwrap_or(-1));
                }
                Err(e) => {
                    warn!("server {} failed to start {:?}: {:?}", self.me, cmd, e);
                    return Err(-1);
                }
            };
            debug!(
                "server {} submitted ({}, {}) at index {}",
                self.me, cmd.clerk_id, cmd.seq_id, index
            );
            *slot = Some(Pending {
                clerk_id: cmd.clerk_id,
                seq_id: cmd.seq_id,
                index,
                done: done_tx,
            });
        }
        done_rx.await.map_err(|_| -1)
    }
}

/// Consumes the apply channel: executes each committed command against the
/// store and resolves the pending waiter once its slot is decided.
fn apply_message(
    me: usize,
    store: &Mutex<Store>,
    pending: &Mutex<Option<Pending>>,
    msg: ApplyMsg,
) {
    if !msg.command_valid {
        return;
    }
    let cmd: Command = match wirecodec::decode(&msg.command) {
        Ok(cmd) => cmd,
        Err(e) => panic!("server {} replicated garbage: {:?}", me, e),
    };

    let (value, err) = {
        let mut store = store.lock().unwrap();
        let out = store.execute(&cmd);
        store.track(&cmd);
        out
    };
    debug!(
        "server {} applied ({}, {}) at index {}",
        me, cmd.clerk_id, cmd.seq_id, msg.command_index
    );

    let mut slot = pending.lock().unwrap();
    let decided = slot
        .as_ref()
        .map_or(false, |p| msg.command_index >= p.index);
    if decided {
        let p = slot.take().unwrap();
        // leadership was lost exactly when the op that filled our slot is
        // not the op we handed to raft
        let matched = msg.command_index == p.index
            && cmd.clerk_id == p.clerk_id
            && cmd.seq_id == p.seq_id;
        let _ = p.done.send(Commit {
            wrong_leader: !matched,
            leader: cmd.server_id as i64,
            err: if matched { err } else { String::new() },
            value: if matched { value } else { String::new() },
        });
    }
}

#[derive(Clone)]
pub struct Node {
    me: usize,
    rf: raft::Node,
    issue_tx: Sender<KvRequest>,
    pending: Arc<Mutex<Option<Pending>>>,
    shutdown: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl Node {
    pub fn new(mut kv: KvServer) -> Node {
        let issue_rx = kv.issue_rx.take().expect("server already started");
        let apply_rx = kv.apply_rx.take().expect("server already started");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let node = Node {
            me: kv.me,
            rf: kv.rf.clone(),
            issue_tx: kv.issue_tx.clone(),
            pending: kv.pending.clone(),
            shutdown: Arc::new(Mutex::new(Some(shutdown_tx))),
        };

        let serializer = Serializer {
            me: kv.me,
            rf: kv.rf.clone(),
            store: kv.store.clone(),
            pending: kv.pending.clone(),
        };
        thread::spawn(move || block_on(serializer.run(issue_rx)));

        let me = kv.me;
        let store = kv.store.clone();
        let pending = kv.pending.clone();
        thread::spawn(move || {
            block_on(async move {
                let mut apply = apply_rx.fuse();
                let mut shutdown = shutdown_rx.fuse();
                loop {
                    select! {
                        msg = apply.next() => match msg {
                            Some(msg) => apply_message(me, &store, &pending, msg),
                            None => break,
                        },
                        _ = shutdown => break,
                    }
                }
                debug!("server {} stops applying", me);
            })
        });

        node
    }

    /// The current term of the underlying raft peer.
    pub fn term(&self) -> u64 {
        self.get_state().term()
    }

    /// Whether the underlying raft peer believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.get_state().is_leader()
    }

    pub fn get_state(&self) -> raft::State {
        self.rf.get_state()
    }

    /// Shuts the server down: stops taking requests, releases any parked
    /// waiter (its client is told to retry elsewhere), and kills raft.
    pub fn kill(&self) {
        debug!("server {} is killed", self.me);
        self.issue_tx.clone().close_channel();
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        self.pending.lock().unwrap().take();
        self.rf.kill();
    }
}

#[async_trait::async_trait]
impl KvService for Node {
    async fn get(&self, args: GetArgs) -> simnet::Result<GetReply> {
        let (tx, rx) = oneshot::channel();
        let mut issuing = self.issue_tx.clone();
        if issuing.send(KvRequest::Get(args, tx)).await.is_err() {
            return Err(simnet::Error::Stopped);
        }
        rx.await.map_err(simnet::Error::Recv)
    }

    async fn put_append(&self, args: PutAppendArgs) -> simnet::Result<PutAppendReply> {
        let (tx, rx) = oneshot::channel();
        let mut issuing = self.issue_tx.clone();
        if issuing.send(KvRequest::PutAppend(args, tx)).await.is_err() {
            return Err(simnet::Error::Stopped);
        }
        rx.await.map_err(simnet::Error::Recv)
    }
}
