//! # Offline Queue Types
//!
//! [`QueuedOperation`] is the persistent record for a command issued while
//! the session was not `Connected` (§3, §4.7). Priority ordering is total:
//! all High before Normal before Low, strict FIFO within a priority.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::types::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    // Declaration order is ascending; `Ord` derive follows it, so
    // `Priority::Low < Priority::Normal < Priority::High` falls out for
    // free and callers that want "highest first" sort with `.rev()` or
    // compare against `Priority::High` directly (the queue store does the
    // former via `ORDER BY priority DESC`).
    Low,
    Normal,
    High,
}

impl Priority {
    /// Integer representation stored in the `priority` column (§6's
    /// schema: `priority INT`), ordered so `ORDER BY priority DESC` yields
    /// High, Normal, Low.
    pub fn as_i64(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            _ => None,
        }
    }
}

/// A command buffered while disconnected (§3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub operation_id: String,
    /// Mirrors `Op::name()`, stored separately from `command_bytes` so the
    /// backing store's rows are inspectable without decoding CBOR.
    pub operation_type: String,
    pub priority: Priority,
    /// Canonical-CBOR-encoded [`Command`] (§3: "command_bytes (CBOR)").
    pub command_bytes: Vec<u8>,
    pub queued_at_ms: u64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl QueuedOperation {
    pub fn new(command: &Command, priority: Priority, queued_at_ms: u64) -> crate::error::Result<Self> {
        let command_bytes = serde_cbor::to_vec(command).map_err(|e| crate::error::MkvError::codec(e.to_string()))?;
        Ok(Self {
            operation_id: Uuid::new_v4().to_string(),
            operation_type: command.op.name().to_string(),
            priority,
            command_bytes,
            queued_at_ms,
            attempts: 0,
            last_error: None,
        })
    }

    pub fn decode_command(&self) -> crate::error::Result<Command> {
        serde_cbor::from_slice(&self.command_bytes).map_err(|e| crate::error::MkvError::codec(e.to_string()))
    }
}

/// Snapshot published after every queue mutation (§4.7 "Statistics stream").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub high_count: usize,
    pub normal_count: usize,
    pub low_count: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_dropped: u64,
    /// Age in milliseconds of the oldest queued operation, if any.
    pub oldest_age_ms: Option<u64>,
    pub last_flush_at_ms: Option<u64>,
}

impl QueueStats {
    pub fn total_queued(&self) -> usize {
        self.high_count + self.normal_count + self.low_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_is_high_normal_low() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn priority_int_roundtrips() {
        for p in [Priority::Low, Priority::Normal, Priority::High] {
            assert_eq!(Priority::from_i64(p.as_i64()), Some(p));
        }
    }

    #[test]
    fn queued_operation_roundtrips_command() {
        use crate::command::types::Op;
        let cmd = Command { id: "r1".into(), op: Op::Set { key: "k".into(), value: "v".into() } };
        let queued = QueuedOperation::new(&cmd, Priority::High, 1000).unwrap();
        let decoded = queued.decode_command().unwrap();
        assert_eq!(decoded.id, "r1");
        assert_eq!(queued.operation_type, "SET");
    }
}
