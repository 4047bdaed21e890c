//! Remote game launcher core.
//!
//! A long-running server distributes a directory tree of game data to
//! remote launcher clients over a framed TCP protocol, then starts, stops
//! or kills the game through a profile. Synchronization detects per-file
//! differences with SHA-256 hashes and transfers only the changed blocks,
//! driven by a message-based state machine on each side and a worker pool
//! with bounded in-flight work.
//!
//! # Architecture
//!
//! ```text
//! +---------------+   requests    +-----------------+
//! |    Server     | ------------> | LauncherClient  |
//! | (RemoteClient |   responses   |  (task workers, |
//! |  per peer)    | <------------ |   GameRunner)   |
//! +---------------+  linked state +-----------------+
//! ```
//!
//! The server diffs its layout against the client's, deletes stale files
//! and streams changed blocks; the client mirrors the game's run status
//! back over the linked-state channel.

pub mod client;
pub mod config;
pub mod error;
pub mod layout;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod task;
pub mod transport;

pub use client::runner::{CommandRunner, GameRunner, NullRunner, RunParameters};
pub use client::LauncherClient;
pub use config::{ClientConfig, ServerConfig, DEFAULT_PORT};
pub use error::{Error, Result};
pub use protocol::{RunStatus, StopMode};
pub use server::{NullHandler, RemoteClient, Server, ServerHandler, SyncOutcome};
