//! Classification of decoded feed lines.
//!
//! Every complete line is one of three things: an empty keep-alive line, a
//! JSON change object, or garbage. Garbage is dropped without surfacing an
//! error; the feed keeps flowing and the next valid line is unaffected.

use crate::types::ChangeRecord;

/// Outcome of classifying one feed line.
#[derive(Debug)]
pub enum Parsed {
    /// Empty line: the server proving the connection is alive.
    Heartbeat,
    /// A decoded change object (possibly the terminal marker).
    Record(ChangeRecord),
    /// A line that did not decode; dropped silently.
    Malformed,
}

/// Classify one complete feed line.
pub fn parse(line: &str) -> Parsed {
    if line.is_empty() {
        return Parsed::Heartbeat;
    }

    match serde_json::from_str::<ChangeRecord>(line) {
        Ok(record) => Parsed::Record(record),
        Err(err) => {
            tracing::debug!(%err, "dropping feed line that did not decode");
            Parsed::Malformed
        }
    }
}
