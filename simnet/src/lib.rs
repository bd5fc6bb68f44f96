#![allow(clippy::new_without_default)]

//! An in-process RPC fabric for deterministic cluster tests.
//!
//! Servers and client ends live in one address space; the network decides,
//! per client end, whether calls go through, get dropped, or stall. Tests
//! flip links on and off to simulate partitions and crashes.

mod client;
mod error;
#[macro_use]
mod macros;
mod network;
mod server;

pub use self::client::{Client, Rpc};
pub use self::error::{Error, Result};
pub use self::network::Network;
pub use self::server::{Handler, HandlerFactory, RpcFuture, Server, ServerBuilder};
