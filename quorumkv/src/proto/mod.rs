pub mod raftpb {
    /// A single slot of the replicated log. Slot 0 is a sentinel with term 0
    /// that is never applied; real entries are 1-based.
    #[derive(Clone, PartialEq, Message)]
    pub struct LogEntry {
        #[prost(uint64, tag = "1")]
        pub term: u64,
        #[prost(bytes, tag = "2")]
        pub command: Vec<u8>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct RequestVoteArgs {
        #[prost(uint64, tag = "1")]
        pub term: u64,
        #[prost(uint64, tag = "2")]
        pub candidate_id: u64,
        #[prost(uint64, tag = "3")]
        pub last_log_index: u64,
        #[prost(uint64, tag = "4")]
        pub last_log_term: u64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct RequestVoteReply {
        #[prost(uint64, tag = "1")]
        pub term: u64,
        #[prost(bool, tag = "2")]
        pub vote_granted: bool,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct AppendEntriesArgs {
        #[prost(uint64, tag = "1")]
        pub term: u64,
        #[prost(uint64, tag = "2")]
        pub leader_id: u64,
        #[prost(uint64, tag = "3")]
        pub prev_log_index: u64,
        #[prost(uint64, tag = "4")]
        pub prev_log_term: u64,
        #[prost(message, repeated, tag = "5")]
        pub entries: Vec<LogEntry>,
        #[prost(uint64, tag = "6")]
        pub leader_commit: u64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct AppendEntriesReply {
        #[prost(uint64, tag = "1")]
        pub term: u64,
        #[prost(bool, tag = "2")]
        pub success: bool,
    }

    /// The blob handed to the persister. `voted_for` is -1 when no vote has
    /// been cast in the current term.
    #[derive(Clone, PartialEq, Message)]
    pub struct PersistedState {
        #[prost(uint64, tag = "1")]
        pub term: u64,
        #[prost(int64, tag = "2")]
        pub voted_for: i64,
        #[prost(message, repeated, tag = "3")]
        pub entries: Vec<LogEntry>,
    }

    simnet::service! {
        service raft {
            rpc request_vote(RequestVoteArgs) returns (RequestVoteReply);
            rpc append_entries(AppendEntriesArgs) returns (AppendEntriesReply);
        }
    }
    pub use self::raft::{
        add_service as add_raft_service, Client as RaftClient, Service as RaftService,
    };
}

pub mod kvpb {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
    pub enum CmdKind {
        Unknown = 0,
        Put = 1,
        Append = 2,
        Get = 3,
    }

    /// The record replicated through the raft log, one per client operation.
    /// `server_id` names the server that proposed it, which doubles as the
    /// leader hint handed back to redirected clients.
    #[derive(Clone, PartialEq, Message)]
    pub struct Command {
        #[prost(enumeration = "CmdKind", tag = "1")]
        pub kind: i32,
        #[prost(uint64, tag = "2")]
        pub server_id: u64,
        #[prost(uint64, tag = "3")]
        pub clerk_id: u64,
        #[prost(uint64, tag = "4")]
        pub seq_id: u64,
        #[prost(string, tag = "5")]
        pub key: String,
        #[prost(string, tag = "6")]
        pub value: String,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct GetArgs {
        #[prost(uint64, tag = "1")]
        pub clerk_id: u64,
        #[prost(uint64, tag = "2")]
        pub seq_id: u64,
        #[prost(string, tag = "3")]
        pub key: String,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct GetReply {
        #[prost(bool, tag = "1")]
        pub wrong_leader: bool,
        // best-effort leader hint, -1 when unknown
        #[prost(int64, tag = "2")]
        pub leader: i64,
        #[prost(string, tag = "3")]
        pub err: String,
        #[prost(string, tag = "4")]
        pub value: String,
        #[prost(uint64, tag = "5")]
        pub server: u64,
    }

    /// Put or Append, selected by `op`.
    #[derive(Clone, PartialEq, Message)]
    pub struct PutAppendArgs {
        #[prost(uint64, tag = "1")]
        pub clerk_id: u64,
        #[prost(uint64, tag = "2")]
        pub seq_id: u64,
        #[prost(string, tag = "3")]
        pub key: String,
        #[prost(string, tag = "4")]
        pub value: String,
        #[prost(enumeration = "CmdKind", tag = "5")]
        pub op: i32,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct PutAppendReply {
        #[prost(bool, tag = "1")]
        pub wrong_leader: bool,
        #[prost(int64, tag = "2")]
        pub leader: i64,
        #[prost(string, tag = "3")]
        pub err: String,
        #[prost(uint64, tag = "4")]
        pub server: u64,
    }

    simnet::service! {
        service kv {
            rpc get(GetArgs) returns (GetReply);
            rpc put_append(PutAppendArgs) returns (PutAppendReply);
        }
    }
    pub use self::kv::{add_service as add_kv_service, Client as KvClient, Service as KvService};
}
