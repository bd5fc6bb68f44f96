//! The single-threaded role state machine.
//!
//! One driver thread owns every role transition. Incoming RPCs arrive as an
//! event carrying the request plus a oneshot reply sender; responses from
//! sender tasks arrive as events carrying the originating arguments, so
//! stale-term responses can be recognized and dropped. Each role runs its
//! own receive loop against a deadline; returning from a role loop hands
//! control back to [`run`], which re-dispatches on the (possibly changed)
//! role.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use rand::Rng;

use super::{Raft, Role, HEARTBEAT_MS, HEARTBEAT_PERIOD};
use crate::proto::raftpb::*;

pub(crate) enum Event {
    VoteArgs(RequestVoteArgs, oneshot::Sender<RequestVoteReply>),
    AppendArgs(AppendEntriesArgs, oneshot::Sender<AppendEntriesReply>),
    VoteReply {
        from: usize,
        args: RequestVoteArgs,
        reply: RequestVoteReply,
    },
    AppendReply {
        from: usize,
        args: AppendEntriesArgs,
        reply: AppendEntriesReply,
    },
    Shutdown,
}

/// Election timeouts are drawn uniformly from [2, 11) heartbeat periods, so
/// a live leader's heartbeats always arrive well within one timeout.
fn election_timeout() -> Duration {
    let ms = rand::thread_rng().gen_range(2 * HEARTBEAT_MS, 11 * HEARTBEAT_MS);
    Duration::from_millis(ms)
}

fn election_deadline() -> Instant {
    Instant::now() + election_timeout()
}

pub(crate) fn run(raft: &Arc<Mutex<Raft>>, events: &Receiver<Event>, killed: &AtomicBool) {
    loop {
        let mut rf = raft.lock().unwrap();
        if killed.load(Ordering::SeqCst) {
            rf.role = Role::Stopped;
        }
        let role = rf.role;
        drop(rf);

        match role {
            Role::Follower => follower_loop(raft, events),
            Role::Candidate => candidate_loop(raft, events),
            Role::Leader => leader_loop(raft, events),
            Role::Stopped => {
                debug!("raft driver stopped");
                return;
            }
        }
    }
}

fn follower_loop(raft: &Arc<Mutex<Raft>>, events: &Receiver<Event>) {
    let mut deadline = election_deadline();
    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(timeout) {
            Ok(Event::VoteArgs(args, reply_tx)) => {
                let mut rf = raft.lock().unwrap();
                rf.observe_term(args.term);
                let reply = rf.handle_request_vote(&args);
                let granted = reply.vote_granted;
                let _ = reply_tx.send(reply);
                if granted {
                    deadline = election_deadline();
                }
            }
            Ok(Event::AppendArgs(args, reply_tx)) => {
                let mut rf = raft.lock().unwrap();
                rf.observe_term(args.term);
                if args.term == rf.current_term {
                    // a legitimate leader is alive
                    rf.leader_hint = Some(args.leader_id);
                    deadline = election_deadline();
                }
                let reply = rf.handle_append_entries(&args);
                let _ = reply_tx.send(reply);
            }
            Ok(Event::VoteReply { reply, .. }) => {
                // stale response from an earlier candidacy
                raft.lock().unwrap().observe_term(reply.term);
            }
            Ok(Event::AppendReply { reply, .. }) => {
                // stale response from an earlier leadership
                raft.lock().unwrap().observe_term(reply.term);
            }
            Ok(Event::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                raft.lock().unwrap().role = Role::Stopped;
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                let mut rf = raft.lock().unwrap();
                info!(
                    "N{} heard no leader in term {}, standing for election",
                    rf.me, rf.current_term
                );
                rf.role = Role::Candidate;
                return;
            }
        }
    }
}

fn candidate_loop(raft: &Arc<Mutex<Raft>>, events: &Receiver<Event>) {
    {
        let mut rf = raft.lock().unwrap();
        rf.current_term += 1;
        rf.voted_for = Some(rf.me as u64);
        rf.leader_hint = None;
        rf.persist();
        info!("N{} campaigning in term {}", rf.me, rf.current_term);
        rf.broadcast_request_vote();
        if 1 > rf.peers.len() / 2 {
            // a single-peer cluster has no votes to wait for
            rf.become_leader();
            return;
        }
    }

    let mut votes = 1usize;
    let deadline = election_deadline();
    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(timeout) {
            Ok(Event::VoteArgs(args, reply_tx)) => {
                let mut rf = raft.lock().unwrap();
                let stepped_down = rf.observe_term(args.term);
                let reply = rf.handle_request_vote(&args);
                let _ = reply_tx.send(reply);
                if stepped_down {
                    return;
                }
            }
            Ok(Event::AppendArgs(args, reply_tx)) => {
                let mut rf = raft.lock().unwrap();
                if args.term >= rf.current_term {
                    // someone else won this (or a later) election
                    rf.observe_term(args.term);
                    rf.role = Role::Follower;
                    rf.leader_hint = Some(args.leader_id);
                    let reply = rf.handle_append_entries(&args);
                    let _ = reply_tx.send(reply);
                    return;
                }
                let _ = reply_tx.send(AppendEntriesReply {
                    term: rf.current_term,
                    success: false,
                });
            }
            Ok(Event::VoteReply { from, args, reply }) => {
                let mut rf = raft.lock().unwrap();
                if rf.observe_term(reply.term) {
                    return;
                }
                if args.term == rf.current_term && reply.vote_granted {
                    votes += 1;
                    debug!("N{} got vote from N{}, {} total", rf.me, from, votes);
                    if votes > rf.peers.len() / 2 {
                        rf.become_leader();
                        return;
                    }
                }
            }
            Ok(Event::AppendReply { reply, .. }) => {
                if raft.lock().unwrap().observe_term(reply.term) {
                    return;
                }
            }
            Ok(Event::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                raft.lock().unwrap().role = Role::Stopped;
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                // election dragged on too long; stay candidate and rerun
                // with a fresh term and randomized deadline
                return;
            }
        }
    }
}

fn leader_loop(raft: &Arc<Mutex<Raft>>, events: &Receiver<Event>) {
    // become_leader already reset the indexes and broadcast once
    let mut deadline = Instant::now() + HEARTBEAT_PERIOD;
    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(timeout) {
            Ok(Event::AppendReply { from, args, reply }) => {
                let mut rf = raft.lock().unwrap();
                if rf.observe_term(reply.term) {
                    return;
                }
                if rf.role == Role::Leader && args.term == rf.current_term {
                    rf.handle_append_reply(from, &args, &reply);
                }
            }
            Ok(Event::VoteArgs(args, reply_tx)) => {
                let mut rf = raft.lock().unwrap();
                let stepped_down = rf.observe_term(args.term);
                let reply = rf.handle_request_vote(&args);
                let _ = reply_tx.send(reply);
                if stepped_down {
                    return;
                }
            }
            Ok(Event::AppendArgs(args, reply_tx)) => {
                let mut rf = raft.lock().unwrap();
                if rf.observe_term(args.term) {
                    rf.leader_hint = Some(args.leader_id);
                    let reply = rf.handle_append_entries(&args);
                    let _ = reply_tx.send(reply);
                    return;
                }
                // a same- or older-term "leader" cannot exist; refuse it
                let _ = reply_tx.send(AppendEntriesReply {
                    term: rf.current_term,
                    success: false,
                });
            }
            Ok(Event::VoteReply { reply, .. }) => {
                if raft.lock().unwrap().observe_term(reply.term) {
                    return;
                }
            }
            Ok(Event::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                raft.lock().unwrap().role = Role::Stopped;
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                raft.lock().unwrap().broadcast_append_entries();
                deadline = Instant::now() + HEARTBEAT_PERIOD;
            }
        }
    }
}
