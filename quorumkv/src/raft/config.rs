//! Cluster harness for the raft tests: N peers on one simulated network,
//! with helpers to disconnect, crash, and restart peers while checking
//! leadership and agreement from the outside.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use futures::channel::mpsc::unbounded;
use futures::future;
use futures::stream::StreamExt;
use rand::Rng;

use crate::proto::raftpb::*;
use crate::raft;
use crate::raft::persister::*;

fn uniqstring() -> String {
    static ID: AtomicUsize = AtomicUsize::new(0);
    format!("{}", ID.fetch_add(1, Ordering::Relaxed))
}

/// The command the tests replicate.
#[derive(Clone, PartialEq, Message)]
pub struct Entry {
    #[prost(uint64, tag = "1")]
    pub x: u64,
}

pub struct Storage {
    // copy of each server's committed entries
    logs: Vec<HashMap<u64, Entry>>,
    max_index: u64,
    max_index0: u64,
}

impl Storage {
    /// how many servers think a log entry is committed?
    pub fn n_committed(&self, index: u64) -> (usize, Option<Entry>) {
        let mut count = 0;
        let mut cmd = None;
        for log in &self.logs {
            let cmd1 = log.get(&index).cloned();
            if cmd1.is_some() {
                if count > 0 && cmd != cmd1 {
                    panic!(
                        "committed values do not match: index {:?}, {:?}, {:?}",
                        index, cmd, cmd1
                    );
                }
                count += 1;
                cmd = cmd1;
            }
        }
        (count, cmd)
    }
}

fn init_logger() {
    use std::sync::Once;
    static LOGGER_INIT: Once = Once::new();
    LOGGER_INIT.call_once(env_logger::init);
}

pub struct Config {
    pub net: simnet::Network,
    n: usize,
    // boxed slice to prohibit growing the cluster
    pub rafts: Arc<Mutex<Box<[Option<raft::Node>]>>>,
    // whether each server is on the net
    pub connected: Box<[bool]>,
    saved: Box<[Arc<MemPersister>]>,
    // the endpoint names each server sends through
    endnames: Box<[Box<[String]>]>,

    pub storage: Arc<Mutex<Storage>>,

    // time at which Config::new was called
    start: Instant,

    // begin()/end() statistics
    t0: Instant,
    rpcs0: usize,
}

impl Config {
    pub fn new(n: usize) -> Config {
        Config::new_with(n, false)
    }

    pub fn new_with(n: usize, unreliable: bool) -> Config {
        init_logger();

        let net = simnet::Network::new();
        net.set_reliable(!unreliable);
        net.set_long_delays(true);
        let storage = Storage {
            logs: vec![HashMap::new(); n],
            max_index: 0,
            max_index0: 0,
        };
        let mut saved = vec![];
        let mut endnames = vec![];
        for _ in 0..n {
            endnames.push(vec![String::new(); n].into_boxed_slice());
            saved.push(Arc::new(MemPersister::new()));
        }
        let mut cfg = Config {
            net,
            n,
            rafts: Arc::new(Mutex::new(vec![None; n].into_boxed_slice())),
            connected: vec![true; n].into_boxed_slice(),
            saved: saved.into_boxed_slice(),
            endnames: endnames.into_boxed_slice(),
            storage: Arc::new(Mutex::new(storage)),

            start: Instant::now(),
            t0: Instant::now(),
            rpcs0: 0,
        };

        for i in 0..n {
            cfg.start1(i);
        }

        for i in 0..n {
            cfg.connect(i);
        }

        cfg
    }

    fn rpc_total(&self) -> usize {
        self.net.total_count()
    }

    /// Checks that there's exactly one leader.
    /// Tries a few times in case re-elections are needed.
    pub fn check_one_leader(&self) -> usize {
        let mut random = rand::thread_rng();
        let mut leaders = HashMap::new();
        for _iters in 0..10 {
            let ms = 450 + (random.gen::<u64>() % 100);
            thread::sleep(Duration::from_millis(ms));

            for (i, connected) in self.connected.iter().enumerate() {
                if *connected {
                    let state = self.rafts.lock().unwrap()[i].as_ref().unwrap().get_state();
                    if state.is_leader() {
                        leaders
                            .entry(state.term())
                            .or_insert_with(Vec::new)
                            .push(i);
                    }
                }
            }

            let mut last_term_with_leader = 0;
            for (term, leaders) in &leaders {
                if leaders.len() > 1 {
                    panic!("term {} has {:?} (>1) leaders", term, leaders);
                }
                if *term > last_term_with_leader {
                    last_term_with_leader = *term;
                }
            }

            if !leaders.is_empty() {
                return leaders[&last_term_with_leader][0];
            }
        }

        panic!("expected one leader, got none")
    }

    /// Checks that everyone agrees on the term.
    pub fn check_terms(&self) -> u64 {
        let mut term = 0;
        for (i, connected) in self.connected.iter().enumerate() {
            if *connected {
                let xterm = self.rafts.lock().unwrap()[i].as_ref().unwrap().term();
                if term == 0 {
                    term = xterm;
                } else if term != xterm {
                    panic!("servers disagree on term");
                }
            }
        }
        term
    }

    /// Checks that there's no leader among the connected servers.
    pub fn check_no_leader(&self) {
        for (i, connected) in self.connected.iter().enumerate() {
            if *connected {
                let is_leader = self.rafts.lock().unwrap()[i].as_ref().unwrap().is_leader();
                if is_leader {
                    panic!("expected no leader, but {} claims to be leader", i);
                }
            }
        }
    }

    pub fn check_timeout(&self) {
        // enforce a two minute real-time limit on each test
        if self.start.elapsed() > Duration::from_secs(120) {
            panic!("test took longer than 120 seconds");
        }
    }

    /// How many servers think a log entry is committed?
    pub fn n_committed(&self, index: u64) -> (usize, Option<Entry>) {
        self.storage.lock().unwrap().n_committed(index)
    }

    /// Waits for at least n servers to commit `index`, but doesn't wait
    /// forever.
    pub fn wait(&self, index: u64, n: usize, start_term: Option<u64>) -> Option<Entry> {
        let mut to = Duration::from_millis(10);
        for _ in 0..30 {
            let (nd, _) = self.n_committed(index);
            if nd >= n {
                break;
            }
            thread::sleep(to);
            if to < Duration::from_secs(1) {
                to *= 2;
            }
            if let Some(start_term) = start_term {
                let rafts = self.rafts.lock().unwrap();
                for r in rafts.iter().flatten() {
                    if r.term() > start_term {
                        // someone has moved on; can no longer guarantee
                        // that we'll "win"
                        return None;
                    }
                }
            }
        }
        let (nd, cmd) = self.n_committed(index);
        if nd < n {
            panic!("only {} decided for index {}; wanted {}", nd, index, n);
        }
        cmd
    }

    /// Runs a complete agreement. It might choose the wrong leader initially
    /// and have to re-submit after giving up; entirely gives up after about
    /// 10 seconds. Indirectly checks that the servers agree on the same
    /// value, since n_committed() checks this. Returns the commit index.
    ///
    /// If retry is false, calls start() only once.
    pub fn one(&self, cmd: Entry, expected_servers: usize, retry: bool) -> u64 {
        let t0 = Instant::now();
        let mut starts = 0;
        while t0.elapsed() < Duration::from_secs(10) {
            // try all the servers, maybe one is the leader.
            let mut index = None;
            for _ in 0..self.n {
                starts = (starts + 1) % self.n;
                if self.connected[starts] {
                    let rafts = self.rafts.lock().unwrap();
                    if let Some(ref rf) = &rafts[starts] {
                        match rf.start(&cmd) {
                            Ok((index1, _)) => {
                                index = Some(index1);
                                break;
                            }
                            Err(e) => debug!("start cmd {:?} failed: {:?}", cmd, e),
                        }
                    }
                }
            }

            if let Some(index) = index {
                // somebody claimed to be the leader and to have submitted
                // our command; wait a while for agreement.
                let t1 = Instant::now();
                while t1.elapsed() < Duration::from_secs(2) {
                    let (nd, cmd1) = self.n_committed(index);
                    if nd > 0 && nd >= expected_servers {
                        if let Some(cmd2) = cmd1 {
                            if cmd2 == cmd {
                                // committed, and it was the command we
                                // submitted.
                                return index;
                            }
                        }
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                if !retry {
                    panic!("one({:?}) failed to reach agreement", cmd);
                }
            } else {
                thread::sleep(Duration::from_millis(50));
            }
        }
        panic!("one({:?}) failed to reach agreement", cmd);
    }

    /// Starts a test and prints its message.
    pub fn begin(&mut self, description: &str) {
        println!(); // force the log to start at a new line
        info!("{} ...", description);
        self.t0 = Instant::now();
        self.rpcs0 = self.rpc_total();

        let mut s = self.storage.lock().unwrap();
        s.max_index0 = s.max_index;
    }

    /// Ends a test -- getting here means there was no failure.
    pub fn end(&self) {
        self.check_timeout();

        let t = self.t0.elapsed();
        let npeers = self.n;
        let nrpc = self.rpc_total() - self.rpcs0;
        let s = self.storage.lock().unwrap();
        let ncmds = s.max_index - s.max_index0;

        info!("  ... Passed --");
        info!("  {:?}  {} {} {}", t, npeers, nrpc, ncmds);
    }

    /// Starts or restarts a raft peer. An existing instance is "killed"
    /// first, with fresh outgoing endpoint names and a fresh persister
    /// seeded from the old one, so the previous incarnation cannot
    /// interfere.
    pub fn start1(&mut self, i: usize) {
        self.crash1(i);

        // fresh outgoing endpoint names so the crashed instance's clients
        // can't send
        self.endnames[i] = vec![String::new(); self.n].into_boxed_slice();
        for j in 0..self.n {
            self.endnames[i][j] = uniqstring();
        }

        let mut clients = Vec::with_capacity(self.n);
        for (j, name) in self.endnames[i].iter().enumerate() {
            let cli = self.net.create_client(name.to_string());
            clients.push(RaftClient::new(cli));
            self.net.connect(name, &format!("{}", j));
        }

        let (tx, apply_ch) = unbounded();
        let rf = raft::Raft::new(clients, i, Box::new(self.saved[i].clone()), tx);
        let node = raft::Node::new(rf);
        self.rafts.lock().unwrap()[i] = Some(node.clone());

        // mirror newly committed entries into storage, checking agreement
        // and ordering on the way
        let storage = self.storage.clone();
        let apply = apply_ch.for_each(move |msg: raft::ApplyMsg| {
            if msg.command_valid {
                let index = msg.command_index;
                let entry =
                    wirecodec::decode(&msg.command).expect("committed command is not an entry");
                let mut s = storage.lock().unwrap();
                for (j, log) in s.logs.iter().enumerate() {
                    if let Some(old) = log.get(&index) {
                        if *old != entry {
                            // some server has already committed a different
                            // value for this entry!
                            panic!(
                                "commit index={:?} server={:?} {:?} != server={:?} {:?}",
                                index, i, entry, j, old
                            );
                        }
                    }
                }
                let log = &mut s.logs[i];
                if index > 1 && log.get(&(index - 1)).is_none() {
                    panic!("server {} apply out of order {}", i, index);
                }
                log.insert(index, entry);
                if index > s.max_index {
                    s.max_index = index;
                }
            }
            future::ready(())
        });
        self.net.spawn_poller(apply);

        let mut builder = simnet::ServerBuilder::new(format!("{}", i));
        add_raft_service(node, &mut builder).unwrap();
        let srv = builder.build();
        self.net.add_server(srv);
    }

    /// Shuts down a raft peer but preserves its persisted state.
    pub fn crash1(&mut self, i: usize) {
        self.disconnect(i);
        // disable client connections to the server
        self.net.delete_server(&format!("{}", i));

        // a fresh persister, in case the old instance keeps updating the
        // old one, seeded with its content so a restart sees the last
        // persisted state
        let raft_state = self.saved[i].raft_state();
        let snapshot = self.saved[i].snapshot();
        let p = MemPersister::new();
        p.save_state_and_snapshot(raft_state, snapshot);
        self.saved[i] = Arc::new(p);

        if let Some(rf) = self.rafts.lock().unwrap()[i].take() {
            rf.kill();
        }
    }

    /// Detaches server i from the net.
    pub fn disconnect(&mut self, i: usize) {
        debug!("disconnect({})", i);

        self.connected[i] = false;

        // outgoing endpoints
        for endname in &*self.endnames[i] {
            self.net.enable(endname, false);
        }

        // incoming endpoints
        for names in &*self.endnames {
            let endname = &names[i];
            self.net.enable(endname, false);
        }
    }

    /// Attaches server i to the net.
    pub fn connect(&mut self, i: usize) {
        debug!("connect({})", i);

        self.connected[i] = true;

        // outgoing endpoints
        for (j, connected) in self.connected.iter().enumerate() {
            if *connected {
                let endname = &*self.endnames[i][j];
                self.net.enable(endname, true);
            }
        }

        // incoming endpoints
        for (j, connected) in self.connected.iter().enumerate() {
            if *connected {
                let endname = &*self.endnames[j][i];
                self.net.enable(endname, true);
            }
        }
    }
}

impl Drop for Config {
    fn drop(&mut self) {
        if let Ok(rafts) = self.rafts.try_lock() {
            for r in rafts.iter().flatten() {
                r.kill();
            }
        }
    }
}
