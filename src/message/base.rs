//! The shared payload container every wire message carries alongside its
//! own fields: a map of model name to the set of rows touched, keyed by
//! primary key so adding the same `(model, pk)` twice is naturally a
//! no-op (spec §4.6 "payload is a set keyed by pk").

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// One row's encoded column values, ready to drop onto the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrappedObject {
    pub model_name: String,
    pub pk: i64,
    pub fields: BTreeMap<String, Json>,
}

impl WrappedObject {
    pub fn new(model_name: impl Into<String>, pk: i64) -> Self {
        WrappedObject { model_name: model_name.into(), pk, fields: BTreeMap::new() }
    }

    pub fn with_field(mut self, column: impl Into<String>, value: Json) -> Self {
        self.fields.insert(column.into(), value);
        self
    }
}

/// model_name -> pk -> object.
pub type Payload = HashMap<String, HashMap<i64, WrappedObject>>;

pub fn add_object(payload: &mut Payload, object: WrappedObject) {
    payload
        .entry(object.model_name.clone())
        .or_default()
        .entry(object.pk)
        .or_insert(object);
}

pub fn objects_of<'a>(payload: &'a Payload, model_name: &str) -> impl Iterator<Item = &'a WrappedObject> {
    payload.get(model_name).into_iter().flat_map(|m| m.values())
}

pub fn find_object<'a>(payload: &'a Payload, model_name: &str, pk: i64) -> Option<&'a WrappedObject> {
    payload.get(model_name).and_then(|m| m.get(&pk))
}

/// Fields common to every message on the wire: the payload plus the
/// moment it was assembled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseMessage {
    pub created: chrono::NaiveDateTime,
    pub payload: Payload,
}

impl BaseMessage {
    pub fn new(created: chrono::NaiveDateTime) -> Self {
        BaseMessage { created, payload: Payload::new() }
    }

    pub fn add_object(&mut self, object: WrappedObject) {
        add_object(&mut self.payload, object);
    }

    pub fn query(&self, model_name: &str) -> impl Iterator<Item = &WrappedObject> {
        objects_of(&self.payload, model_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adding_same_pk_twice_is_a_no_op() {
        let mut payload = Payload::new();
        add_object(&mut payload, WrappedObject::new("Trip", 1).with_field("name", Json::from("a")));
        add_object(&mut payload, WrappedObject::new("Trip", 1).with_field("name", Json::from("b")));
        let obj = find_object(&payload, "Trip", 1).unwrap();
        assert_eq!(obj.fields["name"], Json::from("a"));
    }
}
