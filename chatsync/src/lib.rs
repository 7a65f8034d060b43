//! Client-side synchronization engine for pairwise chat.
//!
//! Keeps a per-peer conversation index and an online-user roster consistent
//! with a messenger server over one authenticated WebSocket, reconnecting
//! with exponential backoff and re-synchronizing from HTTP snapshots after
//! every reconnect.

pub mod bootstrap;
pub mod chat;
pub mod config;
pub mod connection;
pub mod roster;
pub mod session;
