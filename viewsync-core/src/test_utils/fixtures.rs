//! Fixtures: a sample component registry and a transport that records
//! everything sent through it

use serde_json::{json, Value as JsonValue};
use std::sync::{Arc, Mutex};

use crate::access::AccessLevel;
use crate::session::{Transport, TransportError};
use crate::types::{Dependencies, PropertyDescription, PropertyType, ProtectingRule, StaticTypeRegistry, TypeRegistry};

/// Registry of a small data grid component
///
/// - `title`: string the peer may change
/// - `status`: string owned by the server (no access level, so rejected)
/// - `rows`: array of `{id, label}` objects, deep access, `id` read-only
/// - `columns`: map of column name to width, allow
/// - `selection`: attached after `rows`
/// - `enabled`: protecting; while `false` it blocks `title` and `rows`
/// - `visible`: visibility-controlling
pub fn sample_registry() -> Arc<dyn TypeRegistry> {
    Arc::new(sample_static_registry())
}

pub fn sample_static_registry() -> StaticTypeRegistry {
    let row = PropertyType::object([
        ("id", PropertyType::number().with_access(AccessLevel::Reject)),
        ("label", PropertyType::string()),
    ]);
    StaticTypeRegistry::new()
        .with(PropertyDescription::new("title", PropertyType::string()).access(AccessLevel::Allow))
        .with(PropertyDescription::new("status", PropertyType::string()).default_value(json!("idle")))
        .with(
            PropertyDescription::new("rows", PropertyType::array_of(row))
                .access(AccessLevel::Deep)
                .default_value(json!([])),
        )
        .with(
            PropertyDescription::new(
                "columns",
                PropertyType::object(Vec::<(String, PropertyType)>::new()).with_other_fields(PropertyType::number()),
            )
            .access(AccessLevel::Allow)
            .default_value(json!({})),
        )
        .with(
            PropertyDescription::new("selection", PropertyType::array_of(PropertyType::number()))
                .access(AccessLevel::Allow)
                .depends_on(Dependencies::On(vec!["rows".to_string()])),
        )
        .with(
            PropertyDescription::new("enabled", PropertyType::boolean())
                .default_value(json!(true))
                .protecting(ProtectingRule::blocking_on(json!(false)).protecting(["title", "rows"])),
        )
        .with(
            PropertyDescription::new("visible", PropertyType::boolean())
                .default_value(json!(true))
                .visibility(),
        )
}

/// Transport that keeps every message; clones share the log
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message sent so far, decoded as JSON
    pub fn messages(&self) -> Vec<JsonValue> {
        self.raw()
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).unwrap_or(JsonValue::Null))
            .collect()
    }

    pub fn raw(&self) -> Vec<Vec<u8>> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.raw().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return the decoded messages
    pub fn take(&self) -> Vec<JsonValue> {
        let taken = self
            .sent
            .lock()
            .map(|mut sent| std::mem::take(&mut *sent))
            .unwrap_or_default();
        taken
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).unwrap_or(JsonValue::Null))
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.sent
            .lock()
            .map_err(|_| TransportError::SendFailed("recording lock poisoned".to_string()))?
            .push(bytes);
        Ok(())
    }
}
