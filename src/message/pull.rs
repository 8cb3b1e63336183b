//! Pull request/response messages (spec §4.6).

use serde::{Deserialize, Serialize};

use crate::model::{Operation, Version};

use super::base::{BaseMessage, Payload, WrappedObject};

/// What a client sends to ask for everything newer than what it already
/// has.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestMessage {
    /// The highest version id this node has already merged, or `None` if
    /// it has never pulled.
    pub latest_version_id: Option<i64>,
    /// The requesting node, if registered. Lets the server record that
    /// this node has caught up, which gates trim.
    pub node_id: Option<i64>,
    /// This node's own pending (unversioned) operations. The server reads
    /// these for the reversed-dependency hint: a row the client has
    /// deleted locally might still be a foreign-key target of a row the
    /// server is about to send back, so its current data needs to ride
    /// along even though it isn't itself newer than `latest_version_id`.
    pub operations: Vec<Operation>,
}

impl PullRequestMessage {
    pub fn new(latest_version_id: Option<i64>, node_id: Option<i64>, operations: Vec<Operation>) -> Self {
        PullRequestMessage { latest_version_id, node_id, operations }
    }
}

/// What the server sends back: every operation and version newer than the
/// request's `latest_version_id`, plus the rows they touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullMessage {
    #[serde(flatten)]
    pub base: BaseMessage,
    pub operations: Vec<Operation>,
    pub versions: Vec<Version>,
}

impl PullMessage {
    pub fn new(created: chrono::NaiveDateTime) -> Self {
        PullMessage { base: BaseMessage::new(created), operations: Vec::new(), versions: Vec::new() }
    }

    pub fn add_object(&mut self, object: WrappedObject) {
        self.base.add_object(object);
    }

    pub fn add_operation(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn add_version(&mut self, version: Version) {
        self.versions.push(version);
    }

    pub fn payload(&self) -> &Payload {
        &self.base.payload
    }

    pub fn query(&self, model_name: &str) -> impl Iterator<Item = &WrappedObject> {
        self.base.query(model_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Command;

    #[test]
    fn accumulates_operations_and_versions() {
        let mut msg = PullMessage::new(chrono::Utc::now().naive_utc());
        msg.add_operation(Operation { order: 1, row_id: 1, content_type_id: 7, command: Command::Insert, version_id: Some(1) });
        msg.add_version(Version { version_id: 1, node_id: None, created: chrono::Utc::now().naive_utc() });
        assert_eq!(msg.operations.len(), 1);
        assert_eq!(msg.versions.len(), 1);
    }
}
