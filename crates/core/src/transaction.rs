//! The transaction log data model.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::errors::SyncError;

/// Commands recorded in a user's transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Create a record for an item.
    Insert,
    /// Replace the record for an item.
    Update,
    /// Remove an item.
    Delete,
    /// Marker replacing a write whose durable insert failed. Engine
    /// internal; never accepted from clients.
    Rollback,
}

impl Command {
    /// Wire name of the command, as stored in the durable record.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Insert => "Insert",
            Command::Update => "Update",
            Command::Delete => "Delete",
            Command::Rollback => "Rollback",
        }
    }

    /// Whether the command carries an opaque record payload.
    pub fn carries_record(&self) -> bool {
        matches!(self, Command::Insert | Command::Update)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Insert" => Ok(Command::Insert),
            "Update" => Ok(Command::Update),
            "Delete" => Ok(Command::Delete),
            "Rollback" => Ok(Command::Rollback),
            other => Err(SyncError::BadInput(format!("unknown command '{other}'"))),
        }
    }
}

/// A single durable log entry representing a client write.
///
/// `(user_id, sequence_no)` is immutable once persisted; the only
/// permitted rewrite is replacing a non-rollback command with its
/// [rollback marker](Transaction::rollback_marker) under the conditional
/// rule enforced by the record store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Owner of the log this entry belongs to.
    pub user_id: String,
    /// Position in the user's log. Unique per user, contiguous from 0.
    pub sequence_no: u64,
    /// Opaque identifier scoping application-level replay.
    pub item_id: String,
    /// What the client asked for.
    pub command: Command,
    /// Opaque encrypted payload. Present for Insert and Update, absent
    /// for Delete and Rollback.
    pub record: Option<Bytes>,
}

impl Transaction {
    /// The marker that replaces this transaction when its durable insert
    /// fails.
    pub fn rollback_marker(&self) -> Transaction {
        Transaction {
            user_id: self.user_id.clone(),
            sequence_no: self.sequence_no,
            item_id: self.item_id.clone(),
            command: Command::Rollback,
            record: None,
        }
    }
}

/// A client write before a sequence number has been assigned.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// Owner of the log being written.
    pub user_id: String,
    /// Opaque identifier scoping application-level replay.
    pub item_id: String,
    /// What the client asks for. `Rollback` is rejected at validation.
    pub command: Command,
    /// Opaque encrypted payload.
    pub record: Option<Bytes>,
}

impl WriteRequest {
    /// A request without a payload.
    pub fn new(user_id: impl Into<String>, item_id: impl Into<String>, command: Command) -> Self {
        WriteRequest {
            user_id: user_id.into(),
            item_id: item_id.into(),
            command,
            record: None,
        }
    }

    /// Attach the opaque payload.
    pub fn with_record(mut self, record: impl Into<Bytes>) -> Self {
        self.record = Some(record.into());
        self
    }

    pub(crate) fn record_len(&self) -> usize {
        self.record.as_ref().map(|r| r.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_names_roundtrip() {
        for command in [
            Command::Insert,
            Command::Update,
            Command::Delete,
            Command::Rollback,
        ] {
            assert_eq!(command.as_str().parse::<Command>().unwrap(), command);
        }
    }

    #[test]
    fn unknown_command_is_bad_input() {
        let err = "Upsert".parse::<Command>().unwrap_err();
        assert!(matches!(err, SyncError::BadInput(_)));
    }

    #[test]
    fn rollback_marker_drops_the_record() {
        let tx = Transaction {
            user_id: "u".to_owned(),
            sequence_no: 3,
            item_id: "item".to_owned(),
            command: Command::Update,
            record: Some(Bytes::from_static(b"ciphertext")),
        };
        let marker = tx.rollback_marker();
        assert_eq!(marker.sequence_no, 3);
        assert_eq!(marker.command, Command::Rollback);
        assert!(marker.record.is_none());
    }
}
