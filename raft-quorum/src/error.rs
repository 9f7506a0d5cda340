//! Error types shared across the consensus core.
//!
//! Transport and storage failures are handled where they happen and never
//! take the node down. [`ConsensusError`] is the one error surfaced to
//! callers of a client operation.

use thiserror::Error;

use crate::directory::NodeId;

/// Failure reported by the command log or the query executor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage is unavailable")]
    Unavailable,

    #[error("invalid statement: {0}")]
    Statement(#[from] StatementError),

    #[error("no such table: {0}")]
    NoSuchTable(String),

    #[error("log entry {0} not found")]
    EntryNotFound(u64),

    #[error("log entry {id} is corrupt: {reason}")]
    CorruptEntry { id: u64, reason: String },

    #[error("log diverged: expected to append id {expected}, store assigned {assigned}")]
    Diverged { expected: u64, assigned: u64 },

    #[error("{0}")]
    Other(String),
}

/// Failure to turn a raw SQL string into an executable statement.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StatementError {
    #[error("empty statement")]
    Empty,

    #[error("unsupported statement: {0}")]
    Unsupported(String),

    #[error("unexpected end of statement, expected {0}")]
    UnexpectedEnd(&'static str),

    #[error("unexpected token '{found}', expected {expected}")]
    UnexpectedToken { found: String, expected: &'static str },

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("statement has {placeholders} placeholders but {bound} values were bound")]
    BindMismatch { placeholders: usize, bound: usize },

    #[error("{columns} columns but {values} values")]
    ColumnCount { columns: usize, values: usize },
}

/// An inbound frame the router cannot accept.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("frame is missing its type tag")]
    MissingType,

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Why a client `get`/`post` did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("not the leader, leader is {}", display_leader(.leader))]
    NotLeader { leader: Option<NodeId> },

    #[error("consensus failed: not enough votes")]
    NoQuorum,

    #[error("consensus failed: timed out waiting for votes")]
    Timeout,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("node is shutting down")]
    Shutdown,
}

fn display_leader(leader: &Option<NodeId>) -> String {
    match leader {
        Some(id) => id.to_string(),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_message_names_the_leader() {
        let err = ConsensusError::NotLeader {
            leader: Some(NodeId::new(3)),
        };
        assert_eq!(err.to_string(), "not the leader, leader is 3");

        let err = ConsensusError::NotLeader { leader: None };
        assert_eq!(err.to_string(), "not the leader, leader is unknown");
    }

    #[test]
    fn statement_errors_convert_into_storage_errors() {
        let err: StorageError = StatementError::Empty.into();
        assert_eq!(err, StorageError::Statement(StatementError::Empty));
    }
}
