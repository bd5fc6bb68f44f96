use super::fsm::Event;
use super::Raft;
use crate::proto::raftpb::*;

impl Raft {
    /// Decides a RequestVote RPC. The caller has already applied the
    /// universal term rule, so `args.term <= current_term` here.
    pub(crate) fn handle_request_vote(&mut self, args: &RequestVoteArgs) -> RequestVoteReply {
        let mut reply = RequestVoteReply {
            term: self.current_term,
            vote_granted: false,
        };

        if args.term < self.current_term {
            debug!(
                "N{} refuses vote to N{}: stale term {} < {}",
                self.me, args.candidate_id, args.term, self.current_term
            );
            return reply;
        }

        if let Some(voted) = self.voted_for {
            if voted != args.candidate_id {
                debug!(
                    "N{} refuses vote to N{}: already voted for N{}",
                    self.me, args.candidate_id, voted
                );
                return reply;
            }
        }

        // only vote for candidates whose log is at least as up to date:
        // compare (last term, last index) lexicographically
        let (last_log_index, last_log_term) = self.last_log_info();
        if (args.last_log_term, args.last_log_index) < (last_log_term, last_log_index) {
            debug!(
                "N{} refuses vote to N{}: log ({}, {}) behind ({}, {})",
                self.me,
                args.candidate_id,
                args.last_log_term,
                args.last_log_index,
                last_log_term,
                last_log_index
            );
            return reply;
        }

        self.voted_for = Some(args.candidate_id);
        self.persist();
        debug!("N{} votes for N{} in term {}", self.me, args.candidate_id, self.current_term);
        reply.vote_granted = true;
        reply
    }

    /// Solicits votes from every other peer with this candidate's last-log
    /// position. Responses come back as events on the driver channel.
    pub(crate) fn broadcast_request_vote(&mut self) {
        let (last_log_index, last_log_term) = self.last_log_info();
        let args = RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.me as u64,
            last_log_index,
            last_log_term,
        };
        for server in 0..self.peers.len() {
            if server != self.me {
                self.send_request_vote(server, args.clone());
            }
        }
    }

    /// Fires one RequestVote at `server` on a short-lived sender task. The
    /// transport may delay the call arbitrarily but always completes it;
    /// failures are simply dropped, the election timer handles the rest.
    fn send_request_vote(&self, server: usize, args: RequestVoteArgs) {
        let peer = self.peers[server].clone();
        let event_tx = self.event_tx.clone();
        self.peers[server].spawn(async move {
            if let Ok(reply) = peer.request_vote(&args).await {
                let _ = event_tx.send(Event::VoteReply {
                    from: server,
                    args,
                    reply,
                });
            }
        });
    }
}
