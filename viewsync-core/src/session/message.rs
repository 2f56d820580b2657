/*
    message.rs - Session messages exchanged with the peer

    Outgoing messages carry changed property values grouped by component,
    their type tags and queued API calls. Incoming messages are tagged by
    "type": a property update, or the result / error of an earlier call.
*/

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::store::PropertyChanges;

/// A method invocation on the peer waiting for a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerCall {
    pub id: u64,
    pub component: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outgoing {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub changes: BTreeMap<String, BTreeMap<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub types: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<PeerCall>,
}

impl Outgoing {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.calls.is_empty()
    }

    pub fn add_changes(&mut self, component: &str, changes: PropertyChanges) {
        if changes.is_empty() {
            return;
        }
        self.changes.insert(component.to_string(), changes.values);
        self.types.insert(component.to_string(), changes.types);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Incoming {
    /// New value or versioned update for one property
    Update {
        component: String,
        property: String,
        value: JsonValue,
    },
    Response {
        id: u64,
        #[serde(default)]
        result: JsonValue,
    },
    Error {
        id: u64,
        message: String,
    },
}

impl Incoming {
    /// Id of the call this message answers
    pub fn call_id(&self) -> Option<u64> {
        match self {
            Incoming::Update { .. } => None,
            Incoming::Response { id, .. } | Incoming::Error { id, .. } => Some(*id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;
    use serde_json::json;

    #[test]
    fn test_empty_sections_are_omitted() {
        let mut outgoing = Outgoing::default();
        assert!(outgoing.is_empty());
        assert_eq!(serde_json::to_value(&outgoing).unwrap(), json!({}));

        outgoing.calls.push(PeerCall {
            id: 3,
            component: "grid".to_string(),
            method: "scrollTo".to_string(),
            args: vec![json!(10)],
        });
        assert_eq!(
            serde_json::to_value(&outgoing).unwrap(),
            json!({"calls": [{"id": 3, "component": "grid", "method": "scrollTo", "args": [10]}]})
        );
    }

    #[test]
    fn test_incoming_is_tagged_by_type() {
        let update: Incoming =
            wire::decode(br#"{"type":"update","component":"grid","property":"title","value":"x"}"#).unwrap();
        assert_eq!(update.call_id(), None);
        assert_eq!(
            update,
            Incoming::Update {
                component: "grid".to_string(),
                property: "title".to_string(),
                value: json!("x"),
            }
        );

        let response: Incoming = wire::decode(br#"{"type":"response","id":4}"#).unwrap();
        assert_eq!(response, Incoming::Response { id: 4, result: JsonValue::Null });

        let error: Incoming = wire::decode(br#"{"type":"error","id":4,"message":"boom"}"#).unwrap();
        assert_eq!(error.call_id(), Some(4));

        assert!(wire::decode::<Incoming>(br#"{"type":"launch"}"#).is_err());
    }
}
