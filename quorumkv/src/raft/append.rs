use super::fsm::Event;
use super::Raft;
use crate::proto::raftpb::*;

impl Raft {
    /// Decides an AppendEntries RPC. The caller has already applied the
    /// universal term rule.
    pub(crate) fn handle_append_entries(&mut self, args: &AppendEntriesArgs) -> AppendEntriesReply {
        let mut reply = AppendEntriesReply {
            term: self.current_term,
            success: false,
        };

        if args.term < self.current_term {
            return reply;
        }

        let prev = args.prev_log_index as usize;
        if prev > self.log.len() - 1 {
            // we are missing entries before the match point
            debug!(
                "N{} rejects append from N{}: prev {} past last {}",
                self.me,
                args.leader_id,
                prev,
                self.log.len() - 1
            );
            return reply;
        }
        if self.log[prev].term != args.prev_log_term {
            debug!(
                "N{} rejects append from N{}: term {} at {} instead of {}",
                self.me, args.leader_id, self.log[prev].term, prev, args.prev_log_term
            );
            return reply;
        }

        // Walk the entries past the match point. Slots that already agree on
        // term hold the identical entry (log matching) and are left alone; a
        // conflicting slot starts an uncommitted tail, which is discarded and
        // replaced. A delayed duplicate of an earlier append therefore never
        // truncates anything it did not carry.
        let mut changed = false;
        for (i, entry) in args.entries.iter().enumerate() {
            let index = prev + 1 + i;
            if index < self.log.len() {
                if self.log[index].term != entry.term {
                    self.log.truncate(index);
                    self.log.push(entry.clone());
                    changed = true;
                }
            } else {
                self.log.push(entry.clone());
                changed = true;
            }
        }
        if changed {
            self.persist();
        }

        if args.leader_commit > self.commit_index {
            let last_index = (self.log.len() - 1) as u64;
            self.commit_index = args.leader_commit.min(last_index);
        }

        reply.success = true;
        reply
    }

    /// Sends entries (or an empty heartbeat) to every other peer.
    pub(crate) fn broadcast_append_entries(&mut self) {
        for server in 0..self.peers.len() {
            if server != self.me {
                self.send_append_entries(server);
            }
        }
    }

    /// Fires one AppendEntries at `server`, carrying everything from that
    /// peer's next index onward. The response returns as a driver event
    /// together with the arguments it answers.
    pub(crate) fn send_append_entries(&self, server: usize) {
        let next = self.next_index[server] as usize;
        let prev = next - 1;
        let args = AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.me as u64,
            prev_log_index: prev as u64,
            prev_log_term: self.log[prev].term,
            entries: self.log[next..].to_vec(),
            leader_commit: self.commit_index,
        };
        let peer = self.peers[server].clone();
        let event_tx = self.event_tx.clone();
        self.peers[server].spawn(async move {
            if let Ok(reply) = peer.append_entries(&args).await {
                let _ = event_tx.send(Event::AppendReply {
                    from: server,
                    args,
                    reply,
                });
            }
        });
    }

    /// Processes an append response of the current term while still leader.
    pub(crate) fn handle_append_reply(
        &mut self,
        from: usize,
        args: &AppendEntriesArgs,
        reply: &AppendEntriesReply,
    ) {
        if reply.success {
            let matched = args.prev_log_index + args.entries.len() as u64;
            self.next_index[from] = matched + 1;
            if matched > self.match_index[from] {
                self.match_index[from] = matched;
            }
            self.advance_commit_index();
        } else if self.next_index[from] > 1 {
            // walk the match point back one entry and probe again promptly
            self.next_index[from] -= 1;
            debug!(
                "N{} backs off next_index for N{} to {}",
                self.me, from, self.next_index[from]
            );
            self.send_append_entries(from);
        }
    }

    /// Adopts the highest index that a majority has replicated and that
    /// belongs to the current term. Older-term entries are never committed
    /// by counting; they commit transitively under a current-term entry.
    fn advance_commit_index(&mut self) {
        let max_match = self.match_index.iter().cloned().max().unwrap_or(0);
        for n in ((self.commit_index + 1)..=max_match).rev() {
            if self.log[n as usize].term != self.current_term {
                // terms only decrease further down the log
                break;
            }
            let me = self.me;
            let replicas = 1 + self
                .match_index
                .iter()
                .enumerate()
                .filter(|&(peer, &m)| peer != me && m >= n)
                .count();
            if replicas > self.peers.len() / 2 {
                debug!("N{} advances commit index to {}", self.me, n);
                self.commit_index = n;
                break;
            }
        }
    }
}
