//! hostpool library.
//!
//! Allocates machines from a pool of GPU hosts to client sessions and runs
//! one notebook process per session on the allocated machine. Used by:
//! - The hostpool CLI (main.rs)
//! - Integration tests
//!
//! The pieces, bottom up:
//! - [`registry`]: the catalog of machine types.
//! - [`identity`]: privilege level and remote account name of a client.
//! - [`allocation`]: process-wide exclusive/shared machine bookkeeping.
//! - [`remote`]: the remote command channel.
//! - [`launcher`]: per-session remote process control.
//! - [`state`]: the persisted session blob.
//! - [`spawner`]: the lifecycle tying the above together.

pub mod allocation;
pub mod config;
pub mod identity;
pub mod launcher;
pub mod registry;
pub mod remote;
pub mod spawner;
pub mod state;
