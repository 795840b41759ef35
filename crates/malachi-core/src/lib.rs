//! malachi core - pieces shared by the daemon and the crawler
//!
//! Both sides need the same runtime directory (the command pipe lives
//! there) and the same wire format for commands.

pub mod config;
pub mod paths;
pub mod protocol;

pub use config::Config;
pub use paths::Paths;
pub use protocol::{Command, ProtocolError};
