//! Application layer: entity queries and mutations on top of the cache, and
//! the session that wires them to transports.

pub mod activity;
pub mod categories;
pub mod error;
pub mod mutation;
pub mod remote;
pub mod session;
pub mod shopping;
pub mod tasks;
