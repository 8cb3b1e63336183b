//! The synchronization data model (spec §3): ContentType, Operation,
//! Version and Node, plus the `i`/`u`/`d` command alphabet.

use serde::{Deserialize, Serialize};

/// One of the three CUD commands an [`Operation`] can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
}

impl Command {
    pub fn as_char(self) -> char {
        match self {
            Command::Insert => 'i',
            Command::Update => 'u',
            Command::Delete => 'd',
        }
    }

    pub fn from_char(c: char) -> Option<Command> {
        match c {
            'i' => Some(Command::Insert),
            'u' => Some(Command::Update),
            'd' => Some(Command::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Identifies a tracked table. `content_type_id` is stable across
/// processes: `CRC32("<model_name>/<table_name>")`, polynomial IEEE 802.3,
/// initial seed 0 (see [`crate::registry::content_type_id`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentType {
    pub content_type_id: u32,
    pub table_name: String,
    pub model_name: String,
}

/// One CUD event. `order` is the monotonic primary key assigned at append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub order: i64,
    pub row_id: i64,
    pub content_type_id: u32,
    pub command: Command,
    pub version_id: Option<i64>,
}

/// A successfully applied batch of operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub version_id: i64,
    pub node_id: Option<i64>,
    pub created: chrono::NaiveDateTime,
}

/// A client registration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: i64,
    pub registered: chrono::NaiveDateTime,
    pub registry_user_id: Option<i64>,
    pub secret: String,
}
