//! hearth: household sync client.
//!
//! Keeps a typed local cache of server-owned household records consistent
//! with optimistic local mutations, server confirmations and change-feed
//! pushes from other devices.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod realtime;
