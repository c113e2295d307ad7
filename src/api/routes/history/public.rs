//! Public types for the history API
use serde::{Deserialize, Serialize};

use crate::chat::{Role, Turn};

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl From<Turn> for HistoryEntry {
    fn from(turn: Turn) -> Self {
        Self {
            role: turn.role,
            content: turn.content,
        }
    }
}
