//! The response to a registration request (spec §4.6): a freshly minted
//! [`Node`] record, secret included -- this is the one time the secret
//! crosses the wire plaintext, since the client has no other way to learn
//! it.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::Node;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMessage {
    pub node: Node,
}

impl RegisterMessage {
    pub fn new(node: Node) -> Self {
        RegisterMessage { node }
    }
}

/// A random alphanumeric secret of `length` characters, handed to a node
/// at registration time and used afterwards to sign every push.
pub fn generate_secret(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
