/*
    map.rs - Versioned key/value map

    Only ref and content changes on existing keys are granular. Adding or
    removing a key forces the next emission to be a full snapshot.
*/

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

use super::changes::ChangeSet;
use super::{IncomingOutcome, VersionedContainer};
use crate::access::{self, combine, AccessLevel};
use crate::error::{SyncError, SyncResult};
use crate::metrics::{
    record_counter, INCOMING_APPLIED, INCOMING_REJECTED, PATCHES_EMITTED, SNAPSHOTS_EMITTED,
    VERSION_CONFLICTS,
};
use crate::types::PropertyType;
use crate::value::{classify_in_place, ElementChange, IntoValue, Value};
use crate::wire::{self, ContainerUpdate, Snapshot, WireOp};

/// Granular map change; `value` is a full value for a ref change and a
/// nested update for a content change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntryUpdate {
    pub key: String,
    pub value: JsonValue,
}

impl MapEntryUpdate {
    pub fn new(key: impl Into<String>, value: JsonValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    pub fn is_content_update(&self) -> bool {
        wire::is_granular(&self.value)
    }
}

impl WireOp for MapEntryUpdate {
    fn to_json(&self) -> JsonValue {
        json!({ "key": self.key, "value": self.value })
    }
}

#[derive(Debug, Clone)]
pub struct VersionedMap {
    entries: BTreeMap<String, Value>,
    version: u64,
    changes: ChangeSet<String>,
    attached: bool,
}

impl Default for VersionedMap {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionedMap {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            version: 1,
            changes: ChangeSet::unsent(),
            attached: false,
        }
    }

    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: IntoValue,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into_value()))
                .collect(),
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    pub fn content_eq(&self, other: &VersionedMap) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.entries.get(k).is_some_and(|o| o == v))
    }

    /// Set `key`, returning the previous value
    ///
    /// A new key forces a full resend; an equal value records nothing.
    pub fn insert(&mut self, key: impl Into<String>, value: impl IntoValue) -> Option<Value> {
        let key = key.into();
        let mut value = value.into_value();
        if self.entries.get(&key).is_some_and(|current| *current == value) {
            return None;
        }
        if self.attached {
            value.attach();
        }
        match self.entries.insert(key.clone(), value) {
            Some(mut old) => {
                old.detach();
                trace!(%key, "map entry replaced");
                self.changes.mark_ref(key);
                Some(old)
            }
            None => {
                trace!(%key, "map entry added");
                self.changes.must_send_full = true;
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let mut old = self.entries.remove(key)?;
        old.detach();
        trace!(%key, "map entry removed");
        self.changes.forget(&key.to_string());
        self.changes.must_send_full = true;
        Some(old)
    }

    /// Mutate an existing entry in place
    pub fn update<R>(&mut self, key: &str, f: impl FnOnce(&mut Value) -> R) -> SyncResult<R> {
        let attached = self.attached;
        let value = self
            .entries
            .get_mut(key)
            .ok_or_else(|| SyncError::UnknownProperty(key.to_string()))?;

        let before = (!value.is_container()).then(|| value.clone());
        let result = f(&mut *value);
        match classify_in_place(before, value, attached) {
            Some(ElementChange::Ref) => self.changes.mark_ref(key.to_string()),
            Some(ElementChange::Content) => self.changes.mark_content(key.to_string()),
            None => {}
        }
        Ok(result)
    }

    pub fn clear(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        for value in self.entries.values_mut() {
            value.detach();
        }
        self.entries.clear();
        self.changes.clear();
        self.changes.must_send_full = true;
    }

    pub fn force_full_resend(&mut self) {
        self.changes.must_send_full = true;
    }

    pub(crate) fn emit_full(&mut self) -> Snapshot {
        self.version += 1;
        let value = JsonValue::Object(
            self.entries
                .iter_mut()
                .map(|(k, v)| (k.clone(), v.full_wire()))
                .collect(),
        );
        self.done_handling();
        Snapshot {
            version: self.version,
            value,
        }
    }

    pub(crate) fn adopt(&mut self) {
        for value in self.entries.values_mut() {
            value.adopt();
        }
        self.changes.clear();
        self.changes.version_ack = true;
        self.mark_container_entries_for_ack();
    }

    fn mark_container_entries_for_ack(&mut self) {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, v)| v.is_container())
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.changes.mark_content(key);
        }
    }

    fn build_ops(&mut self) -> Vec<MapEntryUpdate> {
        let mut ops = Vec::new();
        for (key, value) in self.entries.iter_mut() {
            if self.changes.is_ref_changed(key) {
                ops.push(MapEntryUpdate::new(key.clone(), value.full_wire()));
            } else if self.changes.is_content_changed(key) {
                if let Some(nested) = value.changes_wire() {
                    ops.push(MapEntryUpdate::new(key.clone(), nested));
                }
            }
        }
        ops
    }

    fn reject_stale(&mut self, received: u64, outcome: &mut IncomingOutcome) -> bool {
        if received == 0 || received == self.version {
            return false;
        }
        let conflict = SyncError::VersionConflict {
            known: self.version,
            received,
        };
        warn!(%conflict, "discarding stale map update");
        record_counter(VERSION_CONFLICTS, 1);
        self.changes.must_send_full = true;
        outcome.conflict = true;
        outcome.resend = true;
        true
    }

    fn entry_access<'t>(
        ty: &'t PropertyType,
        fallback: &'t PropertyType,
        key: &str,
        level: AccessLevel,
    ) -> (&'t PropertyType, AccessLevel) {
        let entry_ty = ty.field_type(key).unwrap_or(fallback);
        (entry_ty, combine(level, entry_ty.access_level()))
    }

    /// Whole-map replace; entries (or nested fields) the policy refuses keep
    /// the server value
    fn replace_from_peer(
        &mut self,
        snapshot: Snapshot,
        ty: &PropertyType,
        level: AccessLevel,
        outcome: &mut IncomingOutcome,
    ) {
        if !level.permits_peer_mutation() {
            warn!(%level, "peer replace of map denied");
            record_counter(INCOMING_REJECTED, 1);
            self.changes.must_send_full = true;
            outcome.deny(String::new());
            return;
        }
        let JsonValue::Object(raw) = snapshot.unwrap() else {
            warn!("peer replace of map carried a non-object value");
            self.changes.must_send_full = true;
            outcome.resend = true;
            return;
        };

        let fallback = PropertyType::any();
        let mut previous = std::mem::take(&mut self.entries);
        let mut kept = Vec::new();
        let mut structure_differs = false;

        for (key, item) in raw {
            let (entry_ty, entry_level) = Self::entry_access(ty, &fallback, &key, level);
            let location = format!(".{}", key);
            let checked = entry_ty.check(&location, &item);
            if entry_level.permits_peer_mutation() && checked.is_ok() {
                let current = previous.get(&key).map(Value::to_json);
                let screened = access::screen_incoming(entry_ty, entry_level, current.as_ref(), item, &location);
                let refused = !screened.is_clean();
                let Some(accepted) = screened.value else {
                    structure_differs = true;
                    continue;
                };
                for denied in screened.denied {
                    outcome.deny(denied);
                }
                let mut value = Value::adopt_incoming(accepted);
                if self.attached {
                    value.attach();
                }
                if let Some(mut old) = previous.remove(&key) {
                    old.detach();
                }
                self.entries.insert(key.clone(), value);
                if refused {
                    record_counter(INCOMING_REJECTED, 1);
                    kept.push(key);
                }
                continue;
            }

            if let Err(err) = checked {
                warn!(%err, "peer map entry has the wrong type");
            } else {
                warn!(%key, %entry_level, "peer replace of map entry denied");
                record_counter(INCOMING_REJECTED, 1);
            }
            outcome.deny(format!(".{}", key));
            match previous.remove(&key) {
                Some(old) => {
                    self.entries.insert(key.clone(), old);
                    kept.push(key);
                }
                // the peer now holds a key the server does not
                None => structure_differs = true,
            }
        }

        // keys the peer dropped
        for (key, mut old) in previous {
            let (_, entry_level) = Self::entry_access(ty, &fallback, &key, level);
            if entry_level.permits_peer_mutation() {
                old.detach();
            } else {
                outcome.deny(format!(".{}", key));
                self.entries.insert(key, old);
                structure_differs = true;
            }
        }

        self.changes.clear();
        self.mark_container_entries_for_ack();
        for key in kept {
            self.changes.mark_ref(key);
        }
        self.version += 1;
        self.changes.version_ack = true;
        self.changes.must_send_full = structure_differs;

        outcome.applied += 1;
        record_counter(INCOMING_APPLIED, 1);
        debug!(version = self.version, len = self.entries.len(), "map replaced by peer");
    }

    fn apply_entry(
        &mut self,
        update: MapEntryUpdate,
        ty: &PropertyType,
        level: AccessLevel,
        outcome: &mut IncomingOutcome,
    ) {
        let fallback = PropertyType::any();
        let (entry_ty, entry_level) = Self::entry_access(ty, &fallback, &update.key, level);
        let location = format!(".{}", update.key);

        if !entry_level.permits_peer_mutation() {
            warn!(key = %update.key, %entry_level, "peer map entry update denied");
            record_counter(INCOMING_REJECTED, 1);
            if self.entries.contains_key(&update.key) {
                self.changes.mark_ref(update.key);
            } else {
                self.changes.must_send_full = true;
            }
            outcome.deny(location);
            return;
        }
        if !self.entries.contains_key(&update.key) {
            warn!(key = %update.key, "granular update for a key the server does not have");
            self.changes.must_send_full = true;
            outcome.resend = true;
            return;
        }

        let result = if update.is_content_update() {
            self.peer_content(&update.key, &update.value, entry_ty, entry_level, &location, outcome)
        } else {
            self.peer_ref(&update.key, &update.value, entry_ty, entry_level, outcome)
        };
        match result {
            Ok(()) => {
                outcome.applied += 1;
                record_counter(INCOMING_APPLIED, 1);
            }
            Err(err) => {
                warn!(%err, key = %update.key, "peer map entry update not applied");
                self.changes.mark_ref(update.key);
                outcome.resend = true;
            }
        }
    }

    fn peer_ref(
        &mut self,
        key: &str,
        raw: &JsonValue,
        entry_ty: &PropertyType,
        entry_level: AccessLevel,
        outcome: &mut IncomingOutcome,
    ) -> SyncResult<()> {
        let location = format!(".{}", key);
        let decoded = entry_ty.from_wire(&location, raw)?;
        let current = self.entries.get(key).map(Value::to_json);
        let screened = access::screen_incoming(entry_ty, entry_level, current.as_ref(), decoded, &location);
        let refused = !screened.is_clean();
        for denied in screened.denied {
            outcome.deny(denied);
        }
        let Some(accepted) = screened.value.or(current) else {
            return Err(SyncError::UnknownProperty(key.to_string()));
        };

        let mut value = Value::adopt_incoming(accepted);
        if self.attached {
            value.attach();
        }
        let is_container = value.is_container();
        if let Some(mut old) = self.entries.insert(key.to_string(), value) {
            old.detach();
        }
        let key = key.to_string();
        self.changes.forget(&key);
        if refused {
            record_counter(INCOMING_REJECTED, 1);
            self.changes.mark_ref(key);
        } else if is_container {
            self.changes.mark_content(key);
        }
        Ok(())
    }

    fn peer_content(
        &mut self,
        key: &str,
        nested: &JsonValue,
        entry_ty: &PropertyType,
        entry_level: AccessLevel,
        location: &str,
        outcome: &mut IncomingOutcome,
    ) -> SyncResult<()> {
        let value = self
            .entries
            .get_mut(key)
            .ok_or_else(|| SyncError::UnknownProperty(key.to_string()))?;
        let child = value.apply_incoming_wire(nested, entry_ty, entry_level)?;
        let child_pending = value.has_changes();
        outcome.absorb(location, child);
        if child_pending {
            self.changes.mark_content(key.to_string());
        }
        Ok(())
    }
}

impl VersionedContainer for VersionedMap {
    type Op = MapEntryUpdate;

    fn content_version(&self) -> u64 {
        self.version
    }

    fn has_changes(&self) -> bool {
        self.changes.is_pending()
    }

    fn snapshot(&mut self) -> ContainerUpdate<MapEntryUpdate> {
        if !self.has_changes() {
            return ContainerUpdate::NoOp;
        }
        let snapshot = self.emit_full();
        record_counter(SNAPSHOTS_EMITTED, 1);
        debug!(version = snapshot.version, len = self.entries.len(), "map snapshot emitted");
        ContainerUpdate::Full(snapshot)
    }

    fn patch(&mut self) -> ContainerUpdate<MapEntryUpdate> {
        if self.changes.must_send_full || !self.has_changes() {
            return ContainerUpdate::NoOp;
        }
        let updates = self.build_ops();
        let acknowledge = self.changes.version_ack;
        self.done_handling();
        if updates.is_empty() && !acknowledge {
            return ContainerUpdate::NoOp;
        }
        record_counter(PATCHES_EMITTED, 1);
        debug!(version = self.version, ops = updates.len(), "map patch emitted");
        ContainerUpdate::Granular {
            version: self.version,
            updates,
        }
    }

    fn needs_full_resend(&self) -> bool {
        self.changes.must_send_full
    }

    fn done_handling(&mut self) {
        self.changes.clear();
    }

    fn apply_incoming(
        &mut self,
        update: ContainerUpdate<MapEntryUpdate>,
        ty: &PropertyType,
        level: AccessLevel,
    ) -> IncomingOutcome {
        let mut outcome = IncomingOutcome::default();
        match update {
            ContainerUpdate::NoOp => {}
            ContainerUpdate::Full(snapshot) => {
                if !self.reject_stale(snapshot.version, &mut outcome) {
                    self.replace_from_peer(snapshot, ty, level, &mut outcome);
                }
            }
            ContainerUpdate::Granular { version, updates } => {
                if !self.reject_stale(version, &mut outcome) {
                    for update in updates {
                        self.apply_entry(update, ty, level, &mut outcome);
                    }
                }
            }
        }
        outcome
    }

    fn attach(&mut self) {
        self.attached = true;
        for value in self.entries.values_mut() {
            value.attach();
        }
    }

    fn detach(&mut self) {
        self.attached = false;
        for value in self.entries.values_mut() {
            value.detach();
        }
    }

    fn is_attached(&self) -> bool {
        self.attached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(raw: JsonValue) -> VersionedMap {
        let mut map = match Value::from_json(raw) {
            Value::Map(map) => map,
            other => panic!("expected a map, got {:?}", other),
        };
        map.attach();
        assert!(matches!(map.to_wire(), ContainerUpdate::Full(_)));
        map
    }

    fn person() -> PropertyType {
        PropertyType::object([
            ("name", PropertyType::string().with_access(AccessLevel::Allow)),
            ("id", PropertyType::number().with_access(AccessLevel::Reject)),
        ])
    }

    #[test]
    fn test_existing_key_change_is_granular() {
        let mut map = sent(json!({"a": 1, "b": 2}));
        let version = map.content_version();

        assert!(map.insert("a", json!(5)).is_some());
        assert_eq!(
            map.to_wire(),
            ContainerUpdate::Granular {
                version,
                updates: vec![MapEntryUpdate::new("a", json!(5))],
            }
        );
        assert!(map.to_wire().is_noop());
    }

    #[test]
    fn test_structural_change_forces_snapshot() {
        let mut map = sent(json!({"a": 1}));
        let version = map.content_version();

        map.insert("b", json!(2));
        assert!(map.patch().is_noop());
        assert!(map.has_changes());

        let update = map.to_wire();
        assert_eq!(update.version(), Some(version + 1));
        assert_eq!(wire::unwrap_full(&update.to_json()), json!({"a": 1, "b": 2}));

        map.remove("a");
        assert!(matches!(map.to_wire(), ContainerUpdate::Full(_)));
    }

    #[test]
    fn test_equal_insert_is_not_a_change() {
        let mut map = sent(json!({"a": [1]}));
        assert!(map.insert("a", json!([1])).is_none());
        assert!(!map.has_changes());
    }

    #[test]
    fn test_nested_content_change() {
        let mut map = sent(json!({"rows": [1]}));
        map.update("rows", |v| v.as_array_mut().unwrap().push(json!(2)))
            .unwrap();

        let update = map.patch();
        let [entry] = update.updates() else {
            panic!("expected one entry, got {:?}", update);
        };
        assert_eq!(entry.key, "rows");
        assert!(entry.is_content_update());
    }

    #[test]
    fn test_granular_incoming_respects_entry_access() {
        let mut map = sent(json!({"name": "a", "id": 1}));
        let version = map.content_version();

        let outcome = map.apply_incoming(
            ContainerUpdate::Granular {
                version,
                updates: vec![
                    MapEntryUpdate::new("id", json!(2)),
                    MapEntryUpdate::new("name", json!("b")),
                ],
            },
            &person(),
            AccessLevel::Allow,
        );
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.denied, vec![".id".to_string()]);
        assert_eq!(map.to_json(), json!({"name": "b", "id": 1}));

        // only the denied entry goes back
        assert_eq!(map.patch().updates(), &[MapEntryUpdate::new("id", json!(1))]);
    }

    #[test]
    fn test_full_incoming_keeps_denied_entries() {
        let mut map = sent(json!({"name": "a", "id": 1}));
        let version = map.content_version();

        let outcome = map.apply_incoming(
            ContainerUpdate::Full(Snapshot {
                version,
                value: json!({"name": "b", "id": 7}),
            }),
            &person(),
            AccessLevel::Allow,
        );
        assert_eq!(outcome.denied, vec![".id".to_string()]);
        assert_eq!(map.to_json(), json!({"name": "b", "id": 1}));
        assert_eq!(map.content_version(), version + 1);

        assert_eq!(
            map.to_wire(),
            ContainerUpdate::Granular {
                version: version + 1,
                updates: vec![MapEntryUpdate::new("id", json!(1))],
            }
        );
    }

    #[test]
    fn test_full_incoming_dropping_protected_key_resends_full() {
        let mut map = sent(json!({"name": "a", "id": 1}));
        let version = map.content_version();
        let outcome = map.apply_incoming(
            ContainerUpdate::Full(Snapshot {
                version,
                value: json!({"name": "b"}),
            }),
            &person(),
            AccessLevel::Allow,
        );
        assert_eq!(outcome.denied, vec![".id".to_string()]);
        assert_eq!(map.to_json(), json!({"name": "b", "id": 1}));
        assert!(map.needs_full_resend());
    }

    #[test]
    fn test_entry_ref_keeps_refused_nested_field() {
        let ty = PropertyType::object([("owner", person())]);
        let mut map = sent(json!({"owner": {"name": "a", "id": 1}}));
        let version = map.content_version();

        let outcome = map.apply_incoming(
            ContainerUpdate::Granular {
                version,
                updates: vec![MapEntryUpdate::new("owner", json!({"name": "b", "id": 5}))],
            },
            &ty,
            AccessLevel::Allow,
        );
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.denied, vec![".owner.id".to_string()]);
        assert_eq!(map.to_json(), json!({"owner": {"name": "b", "id": 1}}));

        let update = map.to_wire();
        let [entry] = update.updates() else {
            panic!("expected one entry, got {:?}", update);
        };
        assert_eq!(entry.key, "owner");
        assert_eq!(wire::unwrap_full(&entry.value), json!({"name": "b", "id": 1}));
    }

    #[test]
    fn test_rejected_map_is_untouched() {
        let mut map = sent(json!({"name": "a"}));
        let version = map.content_version();
        let outcome = map.apply_incoming(
            ContainerUpdate::Full(Snapshot {
                version,
                value: json!({}),
            }),
            &person(),
            AccessLevel::Reject,
        );
        assert!(outcome.resend);
        assert_eq!(map.to_json(), json!({"name": "a"}));
        assert!(map.needs_full_resend());
    }

    #[test]
    fn test_stale_granular_is_discarded() {
        let mut map = sent(json!({"name": "a"}));
        let outcome = map.apply_incoming(
            ContainerUpdate::Granular {
                version: 99,
                updates: vec![MapEntryUpdate::new("name", json!("b"))],
            },
            &person(),
            AccessLevel::Deep,
        );
        assert!(outcome.conflict);
        assert_eq!(map.to_json(), json!({"name": "a"}));
    }

    #[test]
    fn test_nested_incoming_content() {
        let ty = PropertyType::object([("rows", PropertyType::array_of(PropertyType::number()))])
            .with_access(AccessLevel::Deep);
        let mut map = sent(json!({"rows": [1, 2]}));
        let version = map.content_version();
        let rows_version = map.get("rows").unwrap().as_array().unwrap().content_version();

        let nested = json!({"version": rows_version, "updates": [{"op": "remove", "index": 0}]});
        let outcome = map.apply_incoming(
            ContainerUpdate::Granular {
                version,
                updates: vec![MapEntryUpdate::new("rows", nested)],
            },
            &ty,
            AccessLevel::Deep,
        );
        assert!(outcome.is_clean());
        assert_eq!(map.to_json(), json!({"rows": [2]}));
        assert!(map.patch().is_noop());
    }
}
