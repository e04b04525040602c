//! Floor control: who may speak, who gets interrupted, and what the words
//! the human says should do to the conversation.
//!
//! [`barge_in`] mediates overlapping speech between the three parties;
//! [`router`] turns finalized transcripts into floor-control commands.

pub mod barge_in;
pub mod router;

use serde::{Deserialize, Serialize};

/// Interruption priority of an agent speaker. The human is outside this
/// scale at an implicit 100 and always authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Numeric level used for authorization comparisons.
    pub fn value(self) -> u8 {
        match self {
            Self::Low => 25,
            Self::Medium => 50,
            Self::High => 75,
        }
    }
}

/// Implicit priority of the human participant.
pub const HUMAN_PRIORITY: u8 = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Low.value() < Priority::Medium.value());
        assert!(Priority::Medium.value() < Priority::High.value());
        assert!(Priority::High.value() < HUMAN_PRIORITY);
    }
}
