//! Anti-entropy wire protocol (§4.6). Reuses each device's existing command
//! topic rather than minting a fourth topic class: every message, request
//! or response, is published to the addressee's `peer_command_topic`, and
//! carries `from_client_id` so the receiver knows where to send its own
//! reply back. Messages are internally tagged on `"ae_op"`, disjoint from
//! `Command`'s `"op"` tag, so a frame arriving on the command topic can be
//! routed to the right handler by a single fallible parse.

use serde::{Deserialize, Serialize};

use super::merkle::Digest32;
use crate::model::ChangeEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "ae_op")]
pub enum AeMessage {
    #[serde(rename = "DIGEST_REQUEST")]
    DigestRequest { round_id: u64, from_client_id: String },
    #[serde(rename = "DIGEST_RESPONSE")]
    DigestResponse {
        round_id: u64,
        from_client_id: String,
        root: Digest32,
        leaves: Vec<Digest32>,
    },
    #[serde(rename = "ENTRY_REQUEST")]
    EntryRequest { round_id: u64, from_client_id: String, buckets: Vec<usize> },
    #[serde(rename = "ENTRY_RESPONSE")]
    EntryResponse { round_id: u64, from_client_id: String, entries: Vec<ChangeEvent> },
}

impl AeMessage {
    pub fn round_id(&self) -> u64 {
        match self {
            AeMessage::DigestRequest { round_id, .. }
            | AeMessage::DigestResponse { round_id, .. }
            | AeMessage::EntryRequest { round_id, .. }
            | AeMessage::EntryResponse { round_id, .. } => *round_id,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let msg = AeMessage::DigestRequest { round_id: 7, from_client_id: "dev-1".into() };
        let bytes = msg.to_json().unwrap();
        let decoded = AeMessage::from_json(&bytes).unwrap();
        assert_eq!(decoded.round_id(), 7);
    }

    #[test]
    fn tag_is_disjoint_from_command_wire_format() {
        let msg = AeMessage::EntryRequest { round_id: 1, from_client_id: "dev-1".into(), buckets: vec![3, 4] };
        let bytes = msg.to_json().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"ae_op\""));
        assert!(!text.contains("\"op\":"));
    }
}
