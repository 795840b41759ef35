//! Malachi - incremental git repository indexer
//!
//! A daemon that listens on a named pipe for JSON commands, one per line.
//! On `add` it compares the repository's head with the commit it last
//! indexed and applies either a full scan or a tree diff to a SQLite
//! index, then records the new commit in a status file.
//!
//! ## Layout
//!
//! - **parser**: bounded, chunk-tolerant command framing
//! - **daemon**: pipe lifecycle and the event loop
//! - **handler**: routing commands to the engine
//! - **indexer**: full and differential reconciliation
//! - **inspector**: git subprocess queries
//! - **store**: roots, leaves, and their FTS5 mirrors
//! - **status**: per-repository status files

pub mod daemon;
pub mod handler;
pub mod indexer;
pub mod inspector;
pub mod parser;
pub mod pipe;
pub mod shutdown;
pub mod status;
pub mod store;

pub use daemon::{Daemon, Session, EXIT_OK, EXIT_PIPE_FAILURE};
pub use handler::{CommandHandler, Dispatcher, Flow};
pub use indexer::{Indexer, Reconciliation};
pub use inspector::{GitInspector, Inspector, InspectorError};
pub use shutdown::{spawn_signal_bridge, ShutdownFlag};
pub use status::StatusPublisher;
pub use store::IndexStore;
