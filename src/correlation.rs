//! RPC correlation identifiers and the reply-id codec.
//!
//! An outstanding RPC is identified by an opaque id carried in-band in the
//! request's `correlation_id` property. The replying side appends a
//! 3-digit status to the same id (`<id>-200` for success, `<id>-500` for a
//! consumer failure), and the caller splits it back apart to route the
//! reply over the shared reply stream.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{Error, Result};

/// Reply status for a successfully handled task.
pub const STATUS_OK: u16 = 200;

/// Reply status for a task whose consumer raised an error.
pub const STATUS_CONSUMER_ERROR: u16 = 500;

/// Unique correlation identifier used to match RPC requests and replies.
///
/// Correlation IDs are opaque to the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new unique correlation ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the correlation ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Append a 3-digit status to an opaque id, forming a reply correlation id.
pub fn encode_reply_id(id: &str, status: u16) -> String {
    format!("{id}-{status:03}")
}

/// Split a reply correlation id back into its opaque id and status.
///
/// The split happens at the last `-`; the status segment must be exactly
/// three ASCII digits. The opaque id itself may contain `-` (UUIDs do).
///
/// # Errors
///
/// Returns `Error::InvalidArgument` when the id does not match the
/// `<id>-<3-digit-status>` shape.
pub fn parse_reply_id(raw: &str) -> Result<(String, u16)> {
    let malformed = || Error::InvalidArgument(format!("malformed reply correlation id: {raw}"));

    let (id, status) = raw.rsplit_once('-').ok_or_else(malformed)?;
    if id.is_empty() || status.len() != 3 || !status.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }

    let status = status.parse::<u16>().map_err(|_| malformed())?;
    Ok((id.to_string(), status))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_generate_unique() {
        // ---
        let id1 = CorrelationId::generate();
        let id2 = CorrelationId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_reply_id_round_trip() {
        // ---
        let id = CorrelationId::generate();
        let encoded = encode_reply_id(id.as_str(), STATUS_OK);

        let (parsed, status) = parse_reply_id(&encoded).unwrap();
        assert_eq!(parsed, id.as_str());
        assert_eq!(status, STATUS_OK);
    }

    #[test]
    fn test_reply_id_preserves_dashed_ids() {
        // ---
        // UUIDs contain dashes; only the final segment is the status.
        let encoded = encode_reply_id("a-b-c", STATUS_CONSUMER_ERROR);
        let (id, status) = parse_reply_id(&encoded).unwrap();
        assert_eq!(id, "a-b-c");
        assert_eq!(status, STATUS_CONSUMER_ERROR);
    }

    #[test]
    fn test_reply_id_rejects_malformed() {
        // ---
        assert!(parse_reply_id("no-status-suffix").is_err());
        assert!(parse_reply_id("bare").is_err());
        assert!(parse_reply_id("id-12").is_err());
        assert!(parse_reply_id("id-12a").is_err());
        assert!(parse_reply_id("-200").is_err());
    }
}
