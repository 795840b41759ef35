//! Command pipe protocol
//!
//! One JSON object per line. Every object carries an `op` tag naming the
//! operation; the remaining fields depend on the operation:
//!
//! ```text
//! {"op":"add","path":"/home/me/src/project"}
//! {"op":"remove","path":"/home/me/src/project"}
//! {"op":"query","query_id":"8c6e…","terms":"parser buffer","repo_filter":"/home/me/src/project"}
//! {"op":"shutdown"}
//! ```
//!
//! The protocol is fire-and-forget: nothing is ever written back.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

/// Record terminator
pub const TERMINATOR: u8 = b'\n';

pub const MAX_OP_SIZE: usize = 16;
pub const MAX_HASH_LEN: usize = 65;
pub const MAX_UUID_LEN: usize = 40;
pub const MAX_QUERY_LEN: usize = 4096;
pub const MAX_JSON_OVERHEAD: usize = 200;
pub const MAX_PATH_LEN: usize = libc::PATH_MAX as usize;

/// Largest plausible single command line
pub const MAX_LINE_SIZE: usize = MAX_OP_SIZE
    + 2 * MAX_PATH_LEN
    + 2 * MAX_HASH_LEN
    + MAX_UUID_LEN
    + MAX_QUERY_LEN
    + MAX_JSON_OVERHEAD;

/// Operation tags understood by the daemon
pub const OPERATIONS: &[&str] = &["add", "remove", "query", "shutdown"];

/// Protocol violations. Neither is fatal: the offending bytes are dropped
/// and the stream continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("parser buffer full ({capacity} bytes) before a complete command")]
    BufferFull { capacity: usize },

    #[error("malformed command: {0}")]
    Malformed(String),
}

fn malformed(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::Malformed(reason.into())
}

/// A decoded command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Command {
    /// Index (or re-index) the repository at `path`
    Add { path: PathBuf },

    /// Stop tracking the repository at `path`
    Remove { path: PathBuf },

    /// Search request, correlated by `query_id`
    Query {
        query_id: String,
        terms: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo_filter: Option<String>,
    },

    /// Stop the daemon once the current read has been processed
    Shutdown,
}

impl Command {
    pub fn op(&self) -> &'static str {
        match self {
            Command::Add { .. } => "add",
            Command::Remove { .. } => "remove",
            Command::Query { .. } => "query",
            Command::Shutdown => "shutdown",
        }
    }

    /// Encode as a single terminated line, ready to write to the pipe
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(TERMINATOR);
        Ok(line)
    }

    /// Decode one record (without its terminator)
    pub fn decode(record: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(record)
            .map_err(|e| malformed(format!("invalid JSON: {}", e)))?;

        let object = value.as_object().ok_or_else(|| {
            malformed(format!(
                "command must be a JSON object, got {}",
                kind(&value)
            ))
        })?;

        match object.get("op") {
            None => return Err(malformed("command missing 'op' field")),
            Some(Value::String(op)) if !OPERATIONS.contains(&op.as_str()) => {
                return Err(malformed(format!("unknown operation: {}", op)));
            }
            Some(Value::String(_)) => {}
            Some(other) => {
                return Err(malformed(format!(
                    "'op' must be a string, got {}",
                    kind(other)
                )));
            }
        }

        let command: Command =
            serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
        command.validate()?;
        Ok(command)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Command::Add { path } | Command::Remove { path } => {
                if path.as_os_str().is_empty() {
                    return Err(malformed(format!("{} missing 'path' field", self.op())));
                }
                if !path.is_absolute() {
                    return Err(malformed(format!(
                        "{} path must be absolute: {}",
                        self.op(),
                        path.display()
                    )));
                }
                if path.as_os_str().len() > MAX_PATH_LEN {
                    return Err(malformed(format!(
                        "path too long: {} bytes",
                        path.as_os_str().len()
                    )));
                }
            }
            Command::Query { query_id, terms, .. } => {
                if query_id.is_empty() || terms.is_empty() {
                    return Err(malformed("query missing 'query_id' or 'terms' field"));
                }
                if query_id.len() > MAX_UUID_LEN {
                    return Err(malformed(format!("query_id too long: {} bytes", query_id.len())));
                }
                if terms.len() > MAX_QUERY_LEN {
                    return Err(malformed(format!("terms too long: {} bytes", terms.len())));
                }
            }
            Command::Shutdown => {}
        }
        Ok(())
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
