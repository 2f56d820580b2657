/*
    store - Live property values of one synchronized object

    Holds the properties that have been set, falls back to declared
    defaults for the rest, and tracks which properties must be flushed to
    the peer. Peer-originated updates go through the access policy before
    they touch anything.

    A store is owned by the dispatcher thread; nothing here locks.
*/

mod dirty;

pub use dirty::{ChangeKind, DirtySet};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::access::{self, PropertyPath};
use crate::attach::AttachOrder;
use crate::container::IncomingOutcome;
use crate::error::{SyncError, SyncResult};
use crate::metrics::{record_counter, INCOMING_APPLIED, INCOMING_REJECTED};
use crate::types::{PropertyDescription, TypeRegistry};
use crate::value::{classify_in_place, ElementChange, IntoValue, Value};
use crate::wire;

/// Called with the property name whenever a property is marked dirty
pub type ChangeListener = Box<dyn FnMut(&str, ChangeKind)>;

/// Result of [`PropertyStore::read_and_clear_changes`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyChanges {
    /// Wire value per property: full for ref changes, a patch otherwise
    pub values: BTreeMap<String, JsonValue>,
    /// Declared type tag per property in `values`
    pub types: BTreeMap<String, String>,
}

impl PropertyChanges {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

pub struct PropertyStore {
    registry: Arc<dyn TypeRegistry>,
    values: BTreeMap<String, Value>,
    dirty: DirtySet,
    listener: Option<ChangeListener>,
    attach_order: AttachOrder,
    attached: bool,
}

impl fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyStore")
            .field("values", &self.values)
            .field("dirty", &self.dirty)
            .field("attached", &self.attached)
            .finish_non_exhaustive()
    }
}

impl PropertyStore {
    pub fn new(registry: Arc<dyn TypeRegistry>) -> Self {
        let attach_order = AttachOrder::from_registry(registry.as_ref());
        Self {
            registry,
            values: BTreeMap::new(),
            dirty: DirtySet::new(),
            listener: None,
            attach_order,
            attached: false,
        }
    }

    pub fn registry(&self) -> &dyn TypeRegistry {
        self.registry.as_ref()
    }

    fn describe(&self, name: &str) -> SyncResult<&PropertyDescription> {
        self.registry
            .describe(name)
            .ok_or_else(|| SyncError::UnknownProperty(name.to_string()))
    }

    /// Current value, or the declared default when unset
    pub fn get(&self, name: &str) -> SyncResult<JsonValue> {
        match self.values.get(name) {
            Some(value) => Ok(value.to_json()),
            None => Ok(self.describe(name)?.default_value.clone()),
        }
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Assign a property; returns whether it became dirty
    ///
    /// A value that does not match the declared type is logged and
    /// dropped, leaving the property as it was.
    pub fn set(&mut self, name: &str, value: impl IntoValue) -> SyncResult<bool> {
        let mut value = value.into_value();
        let description = self.describe(name)?;
        if let Err(err) = description.ty.check(name, &value.to_json()) {
            warn!(property = name, %err, "dropping value of the wrong type");
            return Err(err);
        }

        if self.values.get(name).is_some_and(|current| *current == value) {
            trace!(property = name, "assigned equal value");
            return Ok(false);
        }
        if self.attached {
            value.attach();
        }
        if let Some(mut old) = self.values.insert(name.to_string(), value) {
            old.detach();
        }
        self.mark_ref_changed(name);
        Ok(true)
    }

    /// Mutate a property in place, materializing the default first if the
    /// property is unset
    pub fn update<R>(&mut self, name: &str, f: impl FnOnce(&mut Value) -> R) -> SyncResult<R> {
        let attached = self.attached;
        let fresh = !self.values.contains_key(name);
        if fresh {
            let mut initial = Value::from_json(self.describe(name)?.default_value.clone());
            if attached {
                initial.attach();
            }
            self.values.insert(name.to_string(), initial);
        }
        let Some(value) = self.values.get_mut(name) else {
            return Err(SyncError::UnknownProperty(name.to_string()));
        };

        let before = (!value.is_container()).then(|| value.clone());
        let result = f(&mut *value);
        let change = classify_in_place(before, value, attached);
        match change {
            _ if fresh => self.mark_ref_changed(name),
            Some(ElementChange::Ref) => self.mark_ref_changed(name),
            Some(ElementChange::Content) => self.mark_content_changed(name),
            None => {}
        }
        Ok(result)
    }

    pub fn mark_ref_changed(&mut self, name: &str) {
        trace!(property = name, "marked ref-changed");
        self.dirty.mark_ref(name);
        self.notify(name, ChangeKind::Ref);
    }

    /// No effect on the dirty sets while a ref change is pending
    pub fn mark_content_changed(&mut self, name: &str) {
        if self.dirty.mark_content(name) {
            trace!(property = name, "marked content-changed");
        }
        self.notify(name, ChangeKind::Content);
    }

    fn notify(&mut self, name: &str, kind: ChangeKind) {
        if let Some(listener) = self.listener.as_mut() {
            listener(name, kind);
        }
    }

    pub fn set_listener(&mut self, listener: impl FnMut(&str, ChangeKind) + 'static) {
        self.listener = Some(Box::new(listener));
    }

    pub fn clear_listener(&mut self) {
        self.listener = None;
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.dirty.is_dirty(name)
    }

    pub fn dirty(&self) -> &DirtySet {
        &self.dirty
    }

    /// Take the wire values of every dirty property that is visible or
    /// controls visibility; other dirty properties stay dirty
    pub fn read_and_clear_changes(&mut self, visible: &dyn Fn(&str) -> bool) -> PropertyChanges {
        let mut changes = PropertyChanges::default();

        for name in self.dirty.names() {
            let Some(description) = self.registry.describe(&name) else {
                // undeclared names cannot be sent; drop them
                self.dirty.take(&name);
                continue;
            };
            if !description.visibility && !visible(&name) {
                continue;
            }
            let ty = description.ty.clone();
            let default_value = description.default_value.clone();
            let Some(kind) = self.dirty.take(&name) else {
                continue;
            };

            let wire_value = match self.values.get_mut(&name) {
                Some(value) => ty.to_wire(value, kind == ChangeKind::Ref),
                None => Some(default_value),
            };
            if let Some(wire_value) = wire_value {
                changes.types.insert(name.clone(), ty.tag().to_string());
                changes.values.insert(name, wire_value);
            }
        }

        if !changes.is_empty() {
            debug!(properties = changes.len(), pending = self.dirty.len(), "read and cleared changes");
        }
        changes
    }

    pub fn read_and_clear_all_changes(&mut self) -> PropertyChanges {
        self.read_and_clear_changes(&|_| true)
    }

    fn current_values(&self) -> impl Fn(&str) -> Option<JsonValue> + '_ {
        move |name| self.values.get(name).map(Value::to_json)
    }

    /// Whether the peer may mutate `path` (dotted / indexed)
    pub fn check_client_mutation_allowed(&self, path: &str) -> SyncResult<()> {
        self.check_client_mutation_allowed_with_exemptions(path, &[])
    }

    /// Like [`Self::check_client_mutation_allowed`], ignoring blocks by the
    /// protecting properties named in `exempt`
    pub fn check_client_mutation_allowed_with_exemptions(
        &self,
        path: &str,
        exempt: &[&str],
    ) -> SyncResult<()> {
        let path = PropertyPath::parse(path)?;
        let current = self.current_values();
        access::check_client_mutation_allowed_with_exemptions(
            self.registry.as_ref(),
            &path,
            &current,
            exempt,
        )
    }

    /// Apply a property value received from the peer
    ///
    /// Versioned values for a property that currently holds a container are
    /// handed to the container; anything else replaces the value. Refused
    /// updates schedule a resend of the server value.
    pub fn apply_client_update(&mut self, name: &str, raw: JsonValue) -> SyncResult<IncomingOutcome> {
        let ty = self.describe(name)?.ty.clone();
        let path = PropertyPath::root_only(name);

        if let Err(err) = self.check_client_mutation_allowed(name) {
            warn!(property = name, %err, "peer update refused");
            record_counter(INCOMING_REJECTED, 1);
            self.mark_ref_changed(name);
            return Err(err);
        }

        let level = access::computed_level(self.registry.as_ref(), &path);
        let holds_container = self.values.get(name).is_some_and(Value::is_container);
        if holds_container && wire::is_versioned(&raw) {
            let Some(value) = self.values.get_mut(name) else {
                return Err(SyncError::UnknownProperty(name.to_string()));
            };
            let outcome = match value.apply_incoming_wire(&raw, &ty, level) {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(property = name, %err, "peer container update not applied");
                    self.mark_ref_changed(name);
                    return Err(err);
                }
            };
            if value.has_changes() {
                self.mark_content_changed(name);
            }
            debug!(property = name, applied = outcome.applied, denied = outcome.denied.len(), "peer container update");
            return Ok(outcome);
        }

        let decoded = match ty.from_wire(name, &raw) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(property = name, %err, "peer value of the wrong type");
                self.mark_ref_changed(name);
                return Err(err);
            }
        };
        let current = self.get(name)?;
        let screened = access::screen_incoming(&ty, level, Some(&current), decoded, "");
        let mut outcome = IncomingOutcome {
            applied: 1,
            ..IncomingOutcome::default()
        };
        for location in &screened.denied {
            warn!(property = name, %location, "peer change refused by access level");
            outcome.deny(location.clone());
        }

        let mut value = Value::adopt_incoming(screened.value.unwrap_or(current));
        if self.attached {
            value.attach();
        }
        let pending_ack = value.has_changes();
        if let Some(mut old) = self.values.insert(name.to_string(), value) {
            old.detach();
        }
        if !outcome.denied.is_empty() {
            record_counter(INCOMING_REJECTED, 1);
            self.mark_ref_changed(name);
        } else if pending_ack {
            self.mark_content_changed(name);
        }
        record_counter(INCOMING_APPLIED, 1);
        debug!(property = name, denied = outcome.denied.len(), "peer value applied");
        Ok(outcome)
    }

    pub fn attach_order(&self) -> &AttachOrder {
        &self.attach_order
    }

    /// Activate stateful values in attach order
    pub fn attach(&mut self) {
        if self.attached {
            return;
        }
        self.attached = true;
        for name in self.attach_order.attach_order() {
            if let Some(value) = self.values.get_mut(name) {
                trace!(property = name, "attach");
                value.attach();
            }
        }
    }

    /// Deactivate in the exact reverse of the attach order
    pub fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        for name in self.attach_order.detach_order() {
            if let Some(value) = self.values.get_mut(name) {
                trace!(property = name, "detach");
                value.detach();
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessLevel;
    use crate::test_utils::sample_registry;
    use crate::types::{Dependencies, PropertyType, ProtectingRule, StaticTypeRegistry};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn registry() -> Arc<dyn TypeRegistry> {
        Arc::new(
            StaticTypeRegistry::new()
                .with(
                    PropertyDescription::new("title", PropertyType::string())
                        .default_value(json!("untitled"))
                        .access(AccessLevel::Allow),
                )
                .with(PropertyDescription::new("count", PropertyType::number()))
                .with(
                    PropertyDescription::new("items", PropertyType::array_of(PropertyType::string()))
                        .access(AccessLevel::Shallow)
                        .depends_on(Dependencies::On(vec!["title".into()])),
                )
                .with(
                    PropertyDescription::new("hidden", PropertyType::boolean())
                        .default_value(json!(false))
                        .visibility(),
                )
                .with(
                    PropertyDescription::new("readonly", PropertyType::boolean())
                        .default_value(json!(false))
                        .protecting(ProtectingRule::blocking_on(json!(true)).protecting(["title"])),
                ),
        )
    }

    #[test]
    fn test_get_falls_back_to_default() {
        let mut store = PropertyStore::new(registry());
        assert_eq!(store.get("title").unwrap(), json!("untitled"));
        assert!(!store.is_set("title"));

        store.set("title", "hello").unwrap();
        assert_eq!(store.get("title").unwrap(), json!("hello"));
        assert!(matches!(store.get("nope"), Err(SyncError::UnknownProperty(_))));
    }

    #[test]
    fn test_set_reports_dirtiness_by_equality() {
        let mut store = PropertyStore::new(registry());
        assert!(store.set("items", json!(["a"])).unwrap());
        store.read_and_clear_all_changes();

        assert!(!store.set("items", json!(["a"])).unwrap());
        assert!(!store.is_dirty("items"));
        assert!(store.set("items", json!(["b"])).unwrap());
        assert_eq!(store.dirty().kind("items"), Some(ChangeKind::Ref));
    }

    #[test]
    fn test_type_mismatch_leaves_property_unset() {
        let mut store = PropertyStore::new(registry());
        let err = store.set("count", "three").unwrap_err();
        assert!(matches!(err, SyncError::TypeMismatch { .. }));
        assert!(!store.is_set("count"));
        assert!(!store.is_dirty("count"));
    }

    #[test]
    fn test_listener_sees_marks() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut store = PropertyStore::new(registry());
        let sink = seen.clone();
        store.set_listener(move |name, kind| sink.borrow_mut().push((name.to_string(), kind)));

        store.set("count", 1).unwrap();
        store.mark_content_changed("items");
        assert_eq!(
            *seen.borrow(),
            vec![
                ("count".to_string(), ChangeKind::Ref),
                ("items".to_string(), ChangeKind::Content)
            ]
        );
    }

    #[test]
    fn test_read_and_clear_defers_invisible() {
        let mut store = PropertyStore::new(registry());
        store.set("title", "t").unwrap();
        store.set("count", 2).unwrap();
        store.set("hidden", true).unwrap();

        let changes = store.read_and_clear_changes(&|name| name == "title");
        assert_eq!(changes.values.keys().collect::<Vec<_>>(), vec!["hidden", "title"]);
        assert_eq!(changes.types["title"], "string");
        assert!(store.is_dirty("count"));
        assert!(!store.is_dirty("title"));

        let later = store.read_and_clear_all_changes();
        assert_eq!(later.values["count"], json!(2));
        assert!(store.dirty().is_empty());
    }

    #[test]
    fn test_nested_update_flushes_as_patch() {
        let mut store = PropertyStore::new(registry());
        store.attach();
        store.set("items", json!(["a"])).unwrap();
        let first = store.read_and_clear_all_changes();
        assert_eq!(first.values["items"], json!({"version": 2, "value": ["a"]}));

        store
            .update("items", |v| v.as_array_mut().unwrap().push("b"))
            .unwrap();
        assert_eq!(store.dirty().kind("items"), Some(ChangeKind::Content));

        let second = store.read_and_clear_all_changes();
        assert_eq!(
            second.values["items"],
            json!({"version": 2, "updates": [{"op": "add", "index": 1, "value": "b"}]})
        );
    }

    #[test]
    fn test_update_materializes_default() {
        let mut store = PropertyStore::new(registry());
        store.update("hidden", |v| *v = Value::from(json!(true))).unwrap();
        assert_eq!(store.get("hidden").unwrap(), json!(true));
        assert_eq!(store.dirty().kind("hidden"), Some(ChangeKind::Ref));
    }

    #[test]
    fn test_protecting_property_blocks_peer() {
        let mut store = PropertyStore::new(registry());
        assert!(store.check_client_mutation_allowed("title").is_ok());

        store.set("readonly", true).unwrap();
        let err = store.check_client_mutation_allowed("title").unwrap_err();
        assert!(err.is_access_denied());
        assert!(store
            .check_client_mutation_allowed_with_exemptions("title", &["readonly"])
            .is_ok());

        // the protecting property itself is never peer-mutable
        assert!(store.check_client_mutation_allowed("readonly").is_err());
        // undeclared level defaults to reject
        assert!(store.check_client_mutation_allowed("count").is_err());
    }

    #[test]
    fn test_apply_client_update_plain() {
        let mut store = PropertyStore::new(registry());
        let outcome = store.apply_client_update("title", json!("from peer")).unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(store.get("title").unwrap(), json!("from peer"));
        // the peer already has it
        assert!(!store.is_dirty("title"));
    }

    #[test]
    fn test_refused_client_update_resends() {
        let mut store = PropertyStore::new(registry());
        store.set("count", 1).unwrap();
        store.read_and_clear_all_changes();

        let err = store.apply_client_update("count", json!(5)).unwrap_err();
        assert!(err.is_access_denied());
        assert_eq!(store.get("count").unwrap(), json!(1));
        assert_eq!(store.read_and_clear_all_changes().values["count"], json!(1));
    }

    #[test]
    fn test_apply_client_update_granular() {
        let mut store = PropertyStore::new(registry());
        store.attach();
        store.set("items", json!(["a", "b"])).unwrap();
        let version = store.read_and_clear_all_changes().values["items"]["version"]
            .as_u64()
            .unwrap();

        let outcome = store
            .apply_client_update(
                "items",
                json!({"version": version, "updates": [{"op": "ref", "index": 1, "value": "B"}]}),
            )
            .unwrap();
        assert!(outcome.is_clean());
        assert_eq!(store.get("items").unwrap(), json!(["a", "B"]));
        assert!(store.read_and_clear_all_changes().is_empty());
    }

    #[test]
    fn test_raw_update_keeps_refused_nested_fields() {
        let mut store = PropertyStore::new(sample_registry());
        store.attach();
        store.set("rows", json!([{"id": 1, "label": "one"}])).unwrap();
        store.read_and_clear_all_changes();

        let outcome = store
            .apply_client_update("rows", json!([{"id": 999, "label": "x"}]))
            .unwrap();
        assert_eq!(outcome.denied, vec!["[0].id".to_string()]);
        assert!(outcome.resend);
        assert_eq!(store.get("rows").unwrap(), json!([{"id": 1, "label": "x"}]));

        // the whole property goes back so the peer drops its id
        assert_eq!(store.dirty().kind("rows"), Some(ChangeKind::Ref));
        let resend = store.read_and_clear_all_changes();
        assert_eq!(
            wire::unwrap_full(&resend.values["rows"]),
            json!([{"id": 1, "label": "x"}])
        );
    }

    #[test]
    fn test_raw_update_without_refused_fields_is_clean() {
        let mut store = PropertyStore::new(sample_registry());
        store.set("rows", json!([{"id": 1, "label": "one"}])).unwrap();
        store.read_and_clear_all_changes();

        let outcome = store
            .apply_client_update("rows", json!([{"id": 1, "label": "uno"}]))
            .unwrap();
        assert!(outcome.is_clean());
        assert_eq!(store.get("rows").unwrap(), json!([{"id": 1, "label": "uno"}]));
        // only nested version acknowledgements are pending
        assert_eq!(store.dirty().kind("rows"), Some(ChangeKind::Content));
    }

    #[test]
    fn test_attach_propagates_to_values() {
        let mut store = PropertyStore::new(registry());
        store.set("items", json!(["a"])).unwrap();
        assert!(!store.value("items").unwrap().is_attached());

        store.attach();
        assert!(store.value("items").unwrap().is_attached());
        assert_eq!(store.attach_order().as_slice().last().map(String::as_str), Some("items"));

        store.detach();
        assert!(!store.value("items").unwrap().is_attached());
    }
}
