//! A replicated state machine built on the Raft consensus algorithm, with a
//! linearizable key/value service on top.
//!
//! The [`raft`] module is the replication engine: leader election, log
//! replication, commit tracking, and durable state. The [`kvservice`] module
//! layers a key/value store over the replicated log, with exactly-once write
//! semantics per client. Both are exercised by in-process cluster tests over
//! the `simnet` simulated network.

#[macro_use]
extern crate log;
#[macro_use]
extern crate prost_derive;

pub mod kvservice;
pub mod proto;
pub mod raft;
