/*
    array.rs - Versioned ordered sequence

    Every element lives in a slot with a stable id. The ids the peer last
    saw are kept in `known`; structural changes are derived by diffing
    `known` against the current slots when a patch is built, so inserts and
    removals never need index bookkeeping of their own.

    Patch operation order (indexes apply sequentially on the peer):
    1. remove, for known ids that are gone, highest known index first
    2. add, for new slots, lowest final index first
    3. ref / content, at final indexes, for surviving slots
*/

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::HashSet;
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
use crate::wire::{ContainerUpdate, Snapshot, WireOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrayOpKind {
    Add,
    Remove,
    Ref,
    Content,
}

/// One granular array operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayOp {
    pub op: ArrayOpKind,
    pub index: usize,
    /// Full value for add/ref, nested update for content, absent for remove
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
}

impl ArrayOp {
    pub fn add(index: usize, value: JsonValue) -> Self {
        Self {
            op: ArrayOpKind::Add,
            index,
            value: Some(value),
        }
    }

    pub fn remove(index: usize) -> Self {
        Self {
            op: ArrayOpKind::Remove,
            index,
            value: None,
        }
    }

    pub fn reference(index: usize, value: JsonValue) -> Self {
        Self {
            op: ArrayOpKind::Ref,
            index,
            value: Some(value),
        }
    }

    pub fn content(index: usize, nested: JsonValue) -> Self {
        Self {
            op: ArrayOpKind::Content,
            index,
            value: Some(nested),
        }
    }
}

impl WireOp for ArrayOp {
    fn to_json(&self) -> JsonValue {
        match &self.value {
            Some(value) => json!({ "op": self.op, "index": self.index, "value": value }),
            None => json!({ "op": self.op, "index": self.index }),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    id: u64,
    value: Value,
}

/// Ordered sequence of values with a content version and a change set
#[derive(Debug, Clone)]
pub struct VersionedArray {
    slots: Vec<Slot>,
    next_id: u64,
    version: u64,
    /// Slot ids as the peer last saw them, in order
    known: Vec<u64>,
    changes: ChangeSet<u64>,
    attached: bool,
}

impl Default for VersionedArray {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionedArray {
    /// Empty array at version 1 that has never been sent
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            next_id: 0,
            version: 1,
            known: Vec::new(),
            changes: ChangeSet::unsent(),
            attached: false,
        }
    }

    pub fn from_values<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: IntoValue,
    {
        let mut array = Self::new();
        for value in values {
            array.push(value);
        }
        array
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.slots.get(index).map(|slot| &slot.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.slots.iter().map(|slot| &slot.value)
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Array(self.iter().map(Value::to_json).collect())
    }

    /// Element-wise equality, ignoring versions and pending changes
    pub fn content_eq(&self, other: &VersionedArray) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }

    pub fn push(&mut self, value: impl IntoValue) {
        let slot = self.new_slot(value);
        trace!(id = slot.id, index = self.slots.len(), "array push");
        self.slots.push(slot);
    }

    pub fn insert(&mut self, index: usize, value: impl IntoValue) -> SyncResult<()> {
        let len = self.slots.len();
        if index > len {
            return Err(SyncError::IndexOutOfBounds { index, len });
        }
        let slot = self.new_slot(value);
        trace!(id = slot.id, index, "array insert");
        self.slots.insert(index, slot);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> SyncResult<Value> {
        let len = self.slots.len();
        if index >= len {
            return Err(SyncError::IndexOutOfBounds { index, len });
        }
        let mut slot = self.slots.remove(index);
        trace!(id = slot.id, index, "array remove");
        self.changes.forget(&slot.id);
        slot.value.detach();
        Ok(slot.value)
    }

    /// Replace the element at `index`, returning the previous one
    ///
    /// A value equal to the current element records no change; the passed
    /// value is handed back and the stored element is kept.
    pub fn set(&mut self, index: usize, value: impl IntoValue) -> SyncResult<Value> {
        let len = self.slots.len();
        let attached = self.attached;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(SyncError::IndexOutOfBounds { index, len })?;

        let mut value = value.into_value();
        if slot.value == value {
            return Ok(value);
        }
        if attached {
            value.attach();
        }
        let mut old = std::mem::replace(&mut slot.value, value);
        old.detach();
        let id = slot.id;
        self.mark_ref(id);
        Ok(old)
    }

    /// Mutate the element at `index` in place
    ///
    /// Plain values that end up different are recorded as ref changes;
    /// attached nested containers that report changes as content updates.
    pub fn update<R>(&mut self, index: usize, f: impl FnOnce(&mut Value) -> R) -> SyncResult<R> {
        let len = self.slots.len();
        let attached = self.attached;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(SyncError::IndexOutOfBounds { index, len })?;

        let before = (!slot.value.is_container()).then(|| slot.value.clone());
        let result = f(&mut slot.value);
        let id = slot.id;
        match classify_in_place(before, &mut slot.value, attached) {
            Some(ElementChange::Ref) => self.mark_ref(id),
            Some(ElementChange::Content) => self.mark_content(id),
            None => {}
        }
        Ok(result)
    }

    pub fn clear(&mut self) {
        for mut slot in self.slots.drain(..) {
            self.changes.forget(&slot.id);
            slot.value.detach();
        }
    }

    /// Force the next emission to be a full snapshot
    pub fn force_full_resend(&mut self) {
        self.changes.must_send_full = true;
    }

    fn new_slot(&mut self, value: impl IntoValue) -> Slot {
        let mut value = value.into_value();
        if self.attached {
            value.attach();
        }
        let id = self.next_id;
        self.next_id += 1;
        Slot { id, value }
    }

    fn is_known(&self, id: u64) -> bool {
        self.known.contains(&id)
    }

    // unknown ids are adds and go out in full anyway
    fn mark_ref(&mut self, id: u64) {
        if self.is_known(id) {
            self.changes.mark_ref(id);
        }
    }

    fn mark_content(&mut self, id: u64) {
        if self.is_known(id) {
            self.changes.mark_content(id);
        }
    }

    fn is_structurally_changed(&self) -> bool {
        self.slots.len() != self.known.len()
            || self
                .slots
                .iter()
                .zip(&self.known)
                .any(|(slot, known)| slot.id != *known)
    }

    fn position_of(&self, id: u64) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id == id)
    }

    /// Full value at a bumped version; clears the change set
    pub(crate) fn emit_full(&mut self) -> Snapshot {
        self.version += 1;
        let value = JsonValue::Array(
            self.slots
                .iter_mut()
                .map(|slot| slot.value.full_wire())
                .collect(),
        );
        self.done_handling();
        Snapshot {
            version: self.version,
            value,
        }
    }

    /// Treat the current contents as just received from the peer: nothing to
    /// send except a version acknowledgement, here and in nested containers
    pub(crate) fn adopt(&mut self) {
        for slot in &mut self.slots {
            slot.value.adopt();
        }
        self.known = self.slots.iter().map(|slot| slot.id).collect();
        self.changes.clear();
        self.changes.version_ack = true;
        self.mark_container_slots_for_ack();
    }

    fn mark_container_slots_for_ack(&mut self) {
        let ids: Vec<u64> = self
            .slots
            .iter()
            .filter(|slot| slot.value.is_container())
            .map(|slot| slot.id)
            .collect();
        for id in ids {
            self.mark_content(id);
        }
    }

    fn build_ops(&mut self) -> Vec<ArrayOp> {
        let live: HashSet<u64> = self.slots.iter().map(|slot| slot.id).collect();
        let known: HashSet<u64> = self.known.iter().copied().collect();
        let mut ops = Vec::new();

        for (index, id) in self.known.iter().enumerate().rev() {
            if !live.contains(id) {
                ops.push(ArrayOp::remove(index));
            }
        }
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !known.contains(&slot.id) {
                ops.push(ArrayOp::add(index, slot.value.full_wire()));
            }
        }
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !known.contains(&slot.id) {
                continue;
            }
            if self.changes.is_ref_changed(&slot.id) {
                ops.push(ArrayOp::reference(index, slot.value.full_wire()));
            } else if self.changes.is_content_changed(&slot.id) {
                if let Some(nested) = slot.value.changes_wire() {
                    ops.push(ArrayOp::content(index, nested));
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
        warn!(%conflict, "discarding stale array update");
        record_counter(VERSION_CONFLICTS, 1);
        self.changes.must_send_full = true;
        outcome.conflict = true;
        outcome.resend = true;
        true
    }

    fn replace_from_peer(
        &mut self,
        snapshot: Snapshot,
        ty: &PropertyType,
        level: AccessLevel,
        outcome: &mut IncomingOutcome,
    ) {
        let element_level = combine(level, ty.element_type().and_then(PropertyType::access_level));
        if !level.permits_peer_mutation() || !element_level.permits_peer_mutation() {
            warn!(%level, %element_level, "peer replace of array denied");
            record_counter(INCOMING_REJECTED, 1);
            self.changes.must_send_full = true;
            outcome.deny(String::new());
            return;
        }

        let raw = snapshot.unwrap();
        if let Err(err) = ty.check("", &raw) {
            warn!(%err, "peer replace of array has the wrong shape");
            self.changes.must_send_full = true;
            outcome.resend = true;
            return;
        }
        let JsonValue::Array(items) = raw else {
            warn!("peer replace of array carried a non-array value");
            self.changes.must_send_full = true;
            outcome.resend = true;
            return;
        };

        // each element is screened against the server element at its index
        let fallback = PropertyType::any();
        let element_ty = ty.element_type().unwrap_or(&fallback);
        let current: Vec<JsonValue> = self.slots.iter().map(|slot| slot.value.to_json()).collect();
        let mut accepted = Vec::with_capacity(items.len());
        let mut refused = Vec::new();
        let mut dropped = false;
        for (index, item) in items.into_iter().enumerate() {
            let screened = access::screen_incoming(
                element_ty,
                element_level,
                current.get(index),
                item,
                &format!("[{}]", index),
            );
            if !screened.is_clean() {
                refused.push(accepted.len());
                for location in screened.denied {
                    outcome.deny(location);
                }
            }
            match screened.value {
                Some(value) => accepted.push(value),
                None => dropped = true,
            }
        }

        for slot in &mut self.slots {
            slot.value.detach();
        }
        let slots: Vec<Slot> = accepted
            .into_iter()
            .map(|item| self.new_slot(Value::adopt_incoming(item)))
            .collect();
        self.slots = slots;
        self.known = self.slots.iter().map(|slot| slot.id).collect();
        self.changes.clear();
        self.mark_container_slots_for_ack();
        for position in refused {
            if let Some(id) = self.slots.get(position).map(|slot| slot.id) {
                self.changes.mark_ref(id);
            }
        }
        if !outcome.denied.is_empty() {
            warn!(denied = ?outcome.denied, "peer replace of array partly refused");
            record_counter(INCOMING_REJECTED, 1);
        }
        self.version += 1;
        self.changes.version_ack = true;
        self.changes.must_send_full = dropped;

        outcome.applied += 1;
        record_counter(INCOMING_APPLIED, 1);
        debug!(version = self.version, len = self.slots.len(), "array replaced by peer");
    }

    fn apply_op(
        &mut self,
        op: ArrayOp,
        element_ty: &PropertyType,
        element_level: AccessLevel,
        outcome: &mut IncomingOutcome,
    ) {
        let location = format!("[{}]", op.index);

        if !element_level.permits_peer_mutation() {
            warn!(index = op.index, op = ?op.op, %element_level, "peer array operation denied");
            record_counter(INCOMING_REJECTED, 1);
            match (op.op, self.known.get(op.index).copied()) {
                (ArrayOpKind::Ref | ArrayOpKind::Content, Some(id)) => self.changes.mark_ref(id),
                _ => self.changes.must_send_full = true,
            }
            outcome.deny(location);
            return;
        }

        let applied = match op.op {
            ArrayOpKind::Add => {
                let raw = op.value.unwrap_or(JsonValue::Null);
                self.peer_add(op.index, &raw, element_ty, element_level, outcome)
            }
            ArrayOpKind::Remove => self.peer_remove(op.index),
            ArrayOpKind::Ref => {
                let raw = op.value.unwrap_or(JsonValue::Null);
                self.peer_ref(op.index, &raw, element_ty, element_level, outcome)
            }
            ArrayOpKind::Content => match op.value {
                Some(nested) => self.peer_content(op.index, &nested, element_ty, element_level, &location, outcome),
                None => Err(SyncError::MalformedUpdate(format!("content op at {} without value", location))),
            },
        };

        match applied {
            Ok(()) => {
                outcome.applied += 1;
                record_counter(INCOMING_APPLIED, 1);
            }
            Err(err) => {
                // the peer's view can no longer be trusted
                warn!(%err, index = op.index, "peer array operation not applied");
                self.changes.must_send_full = true;
                outcome.resend = true;
            }
        }
    }

    fn known_id(&self, index: usize) -> SyncResult<u64> {
        self.known.get(index).copied().ok_or(SyncError::IndexOutOfBounds {
            index,
            len: self.known.len(),
        })
    }

    fn peer_add(
        &mut self,
        index: usize,
        raw: &JsonValue,
        element_ty: &PropertyType,
        element_level: AccessLevel,
        outcome: &mut IncomingOutcome,
    ) -> SyncResult<()> {
        if index > self.known.len() {
            return Err(SyncError::IndexOutOfBounds {
                index,
                len: self.known.len(),
            });
        }
        let location = format!("[{}]", index);
        let decoded = element_ty.from_wire(&location, raw)?;
        let screened = access::screen_incoming(element_ty, element_level, None, decoded, &location);
        let refused = !screened.is_clean();
        let Some(accepted) = screened.value else {
            return Err(SyncError::access_denied(location, "element refused by access level"));
        };
        for denied in screened.denied {
            outcome.deny(denied);
        }

        // land right after the nearest element in front of it that both
        // sides still hold
        let position = self.known[..index]
            .iter()
            .rev()
            .find_map(|id| self.position_of(*id))
            .map_or(0, |p| p + 1);
        let slot = self.new_slot(Value::adopt_incoming(accepted));
        let id = slot.id;
        let is_container = slot.value.is_container();
        self.slots.insert(position, slot);
        self.known.insert(index, id);
        if refused {
            record_counter(INCOMING_REJECTED, 1);
            self.changes.mark_ref(id);
        } else if is_container {
            self.mark_content(id);
        }
        trace!(id, index, position, "peer add");
        Ok(())
    }

    fn peer_remove(&mut self, index: usize) -> SyncResult<()> {
        let id = self.known_id(index)?;
        self.known.remove(index);
        self.changes.forget(&id);
        if let Some(position) = self.position_of(id) {
            let mut slot = self.slots.remove(position);
            slot.value.detach();
        }
        trace!(id, index, "peer remove");
        Ok(())
    }

    fn peer_ref(
        &mut self,
        index: usize,
        raw: &JsonValue,
        element_ty: &PropertyType,
        element_level: AccessLevel,
        outcome: &mut IncomingOutcome,
    ) -> SyncResult<()> {
        let id = self.known_id(index)?;
        let location = format!("[{}]", index);
        let decoded = match element_ty.from_wire(&location, raw) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.changes.mark_ref(id);
                return Err(err);
            }
        };
        let Some(position) = self.position_of(id) else {
            // removed locally since the peer last saw it
            return Ok(());
        };

        let current = self.slots[position].value.to_json();
        let screened = access::screen_incoming(element_ty, element_level, Some(&current), decoded, &location);
        let refused = !screened.is_clean();
        for denied in screened.denied {
            outcome.deny(denied);
        }
        let mut value = Value::adopt_incoming(screened.value.unwrap_or(current));
        if self.attached {
            value.attach();
        }
        let is_container = value.is_container();
        let mut old = std::mem::replace(&mut self.slots[position].value, value);
        old.detach();
        self.changes.forget(&id);
        if refused {
            record_counter(INCOMING_REJECTED, 1);
            self.changes.mark_ref(id);
        } else if is_container {
            self.mark_content(id);
        }
        trace!(id, index, refused, "peer ref change");
        Ok(())
    }

    fn peer_content(
        &mut self,
        index: usize,
        nested: &JsonValue,
        element_ty: &PropertyType,
        element_level: AccessLevel,
        location: &str,
        outcome: &mut IncomingOutcome,
    ) -> SyncResult<()> {
        let id = self.known_id(index)?;
        let Some(position) = self.position_of(id) else {
            return Ok(());
        };
        let child = self.slots[position]
            .value
            .apply_incoming_wire(nested, element_ty, element_level)?;
        let child_pending = self.slots[position].value.has_changes();
        outcome.absorb(location, child);
        if child_pending {
            self.mark_content(id);
        }
        Ok(())
    }
}

impl VersionedContainer for VersionedArray {
    type Op = ArrayOp;

    fn content_version(&self) -> u64 {
        self.version
    }

    fn has_changes(&self) -> bool {
        self.changes.is_pending() || self.is_structurally_changed()
    }

    fn snapshot(&mut self) -> ContainerUpdate<ArrayOp> {
        if !self.has_changes() {
            return ContainerUpdate::NoOp;
        }
        let snapshot = self.emit_full();
        record_counter(SNAPSHOTS_EMITTED, 1);
        debug!(version = snapshot.version, len = self.slots.len(), "array snapshot emitted");
        ContainerUpdate::Full(snapshot)
    }

    fn patch(&mut self) -> ContainerUpdate<ArrayOp> {
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
        debug!(version = self.version, ops = updates.len(), "array patch emitted");
        ContainerUpdate::Granular {
            version: self.version,
            updates,
        }
    }

    fn needs_full_resend(&self) -> bool {
        self.changes.must_send_full
    }

    fn done_handling(&mut self) {
        self.known = self.slots.iter().map(|slot| slot.id).collect();
        self.changes.clear();
    }

    fn apply_incoming(
        &mut self,
        update: ContainerUpdate<ArrayOp>,
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
                    let fallback = PropertyType::any();
                    let element_ty = ty.element_type().unwrap_or(&fallback);
                    let element_level = combine(level, element_ty.access_level());
                    for op in updates {
                        self.apply_op(op, element_ty, element_level, &mut outcome);
                    }
                }
            }
        }
        outcome
    }

    fn attach(&mut self) {
        self.attached = true;
        for slot in &mut self.slots {
            slot.value.attach();
        }
    }

    fn detach(&mut self) {
        self.attached = false;
        for slot in &mut self.slots {
            slot.value.detach();
        }
    }

    fn is_attached(&self) -> bool {
        self.attached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;
    use proptest::prelude::*;

    fn sent(values: Vec<JsonValue>) -> VersionedArray {
        let mut array = VersionedArray::from_values(values);
        array.attach();
        let first = array.to_wire();
        assert!(matches!(first, ContainerUpdate::Full(_)));
        array
    }

    /// Peer-side replay of a granular update over plain JSON
    fn replay(mut items: Vec<JsonValue>, update: &ContainerUpdate<ArrayOp>) -> Vec<JsonValue> {
        for op in update.updates() {
            match op.op {
                ArrayOpKind::Remove => {
                    items.remove(op.index);
                }
                ArrayOpKind::Add => items.insert(op.index, wire::unwrap_full(op.value.as_ref().unwrap())),
                ArrayOpKind::Ref => items[op.index] = wire::unwrap_full(op.value.as_ref().unwrap()),
                ArrayOpKind::Content => panic!("flat arrays never produce content ops"),
            }
        }
        items
    }

    #[test]
    fn test_first_emission_is_full() {
        let mut array = VersionedArray::from_values([json!(1), json!(2)]);
        assert_eq!(array.content_version(), 1);
        assert!(array.patch().is_noop());

        let update = array.to_wire();
        assert_eq!(
            update,
            ContainerUpdate::Full(Snapshot {
                version: 2,
                value: json!([1, 2]),
            })
        );
        assert!(!array.has_changes());
        assert!(array.to_wire().is_noop());
    }

    #[test]
    fn test_set_and_append_patch() {
        let mut array = sent(vec![json!("A"), json!("B")]);
        let version = array.content_version();

        array.set(1, json!("C")).unwrap();
        array.push(json!("D"));

        let update = array.patch();
        assert_eq!(
            update,
            ContainerUpdate::Granular {
                version,
                updates: vec![ArrayOp::add(2, json!("D")), ArrayOp::reference(1, json!("C"))],
            }
        );
        assert!(!array.has_changes());
        assert!(array.patch().is_noop());
        assert!(array.snapshot().is_noop());
    }

    #[test]
    fn test_set_equal_value_is_not_a_change() {
        let mut array = sent(vec![json!(1)]);
        array.set(0, json!(1)).unwrap();
        assert!(!array.has_changes());
    }

    #[test]
    fn test_insert_then_remove_before_send_cancels_out() {
        let mut array = sent(vec![json!(1), json!(2)]);
        array.insert(1, json!(9)).unwrap();
        array.remove(1).unwrap();
        assert!(!array.has_changes());
        assert!(array.patch().is_noop());
    }

    #[test]
    fn test_removes_are_emitted_highest_index_first() {
        let mut array = sent(vec![json!(0), json!(1), json!(2), json!(3)]);
        array.remove(3).unwrap();
        array.remove(1).unwrap();
        let update = array.patch();
        assert_eq!(update.updates(), &[ArrayOp::remove(3), ArrayOp::remove(1)]);
    }

    #[test]
    fn test_ref_supersedes_content_for_nested() {
        let mut array = sent(vec![json!([1, 2])]);
        array
            .update(0, |v| v.as_array_mut().unwrap().push(json!(3)))
            .unwrap();
        array.set(0, json!([7])).unwrap();

        let update = array.patch();
        let [op] = update.updates() else {
            panic!("expected one op, got {:?}", update);
        };
        assert_eq!(op.op, ArrayOpKind::Ref);
        assert_eq!(wire::unwrap_full(op.value.as_ref().unwrap()), json!([7]));
    }

    #[test]
    fn test_nested_content_update() {
        let mut array = sent(vec![json!([1]), json!("x")]);
        array
            .update(0, |v| v.as_array_mut().unwrap().push(json!(2)))
            .unwrap();

        let update = array.patch();
        let [op] = update.updates() else {
            panic!("expected one op, got {:?}", update);
        };
        assert_eq!(op.op, ArrayOpKind::Content);
        assert_eq!(op.index, 0);
        let nested = ContainerUpdate::<ArrayOp>::from_json(op.value.clone().unwrap()).unwrap();
        assert_eq!(nested.updates(), &[ArrayOp::add(1, json!(2))]);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut array = VersionedArray::new();
        assert_eq!(
            array.set(0, json!(1)).unwrap_err(),
            SyncError::IndexOutOfBounds { index: 0, len: 0 }
        );
        assert!(array.insert(1, json!(1)).is_err());
        assert!(array.remove(0).is_err());
        assert!(array.insert(0, json!(1)).is_ok());
    }

    #[test]
    fn test_incoming_conflict_forces_full_resend() {
        let mut array = sent(vec![json!(1)]);
        let version = array.content_version();

        let outcome = array.apply_incoming(
            ContainerUpdate::Granular {
                version: version + 5,
                updates: vec![ArrayOp::reference(0, json!(2))],
            },
            &PropertyType::array_of(PropertyType::number()),
            AccessLevel::Deep,
        );
        assert!(outcome.conflict);
        assert_eq!(array.to_json(), json!([1]));

        let resend = array.to_wire();
        assert_eq!(resend.version(), Some(version + 1));
        assert!(matches!(resend, ContainerUpdate::Full(_)));
    }

    #[test]
    fn test_incoming_full_replace_is_acknowledged() {
        let mut array = sent(vec![json!(1)]);
        let version = array.content_version();

        let outcome = array.apply_incoming(
            ContainerUpdate::Full(Snapshot {
                version,
                value: json!([4, 5]),
            }),
            &PropertyType::array_of(PropertyType::number()),
            AccessLevel::Allow,
        );
        assert!(outcome.is_clean());
        assert_eq!(array.to_json(), json!([4, 5]));
        assert_eq!(array.content_version(), version + 1);

        assert_eq!(
            array.to_wire(),
            ContainerUpdate::Granular {
                version: version + 1,
                updates: vec![],
            }
        );
        assert!(array.to_wire().is_noop());
    }

    #[test]
    fn test_incoming_granular_uses_peer_indexes() {
        let mut array = sent(vec![json!("a"), json!("b"), json!("c")]);
        let version = array.content_version();
        // local change not yet flushed shifts positions
        array.insert(0, json!("z")).unwrap();

        let outcome = array.apply_incoming(
            ContainerUpdate::Granular {
                version,
                updates: vec![
                    ArrayOp::remove(0),
                    ArrayOp::reference(1, json!("C")),
                    ArrayOp::add(2, json!("d")),
                ],
            },
            &PropertyType::array_of(PropertyType::string()),
            AccessLevel::Allow,
        );
        assert_eq!(outcome.applied, 3);
        assert_eq!(array.to_json(), json!(["z", "b", "C", "d"]));

        // only the local insert is left to send
        let update = array.patch();
        assert_eq!(update.updates(), &[ArrayOp::add(0, json!("z"))]);
    }

    #[test]
    fn test_peer_add_after_locally_removed_element() {
        let mut array = sent(vec![json!("a"), json!("b"), json!("c")]);
        let version = array.content_version();
        array.remove(1).unwrap();

        let outcome = array.apply_incoming(
            ContainerUpdate::Granular {
                version,
                updates: vec![ArrayOp::add(2, json!("X"))],
            },
            &PropertyType::array_of(PropertyType::string()),
            AccessLevel::Allow,
        );
        assert!(outcome.is_clean());
        assert_eq!(array.to_json(), json!(["a", "X", "c"]));

        let update = array.patch();
        assert_eq!(update.updates(), &[ArrayOp::remove(1)]);
        let peer = vec![json!("a"), json!("b"), json!("X"), json!("c")];
        assert_eq!(JsonValue::Array(replay(peer, &update)), array.to_json());
    }

    #[test]
    fn test_peer_add_with_no_surviving_predecessor_goes_first() {
        let mut array = sent(vec![json!("a"), json!("b")]);
        let version = array.content_version();
        array.remove(0).unwrap();
        array.insert(0, json!("z")).unwrap();

        array.apply_incoming(
            ContainerUpdate::Granular {
                version,
                updates: vec![ArrayOp::add(1, json!("X"))],
            },
            &PropertyType::array_of(PropertyType::string()),
            AccessLevel::Allow,
        );
        assert_eq!(array.to_json(), json!(["X", "z", "b"]));

        let update = array.patch();
        let peer = vec![json!("a"), json!("X"), json!("b")];
        assert_eq!(JsonValue::Array(replay(peer, &update)), array.to_json());
    }

    #[test]
    fn test_incoming_denied_when_rejected() {
        let mut array = sent(vec![json!(1), json!(2)]);
        let version = array.content_version();

        let outcome = array.apply_incoming(
            ContainerUpdate::Granular {
                version,
                updates: vec![ArrayOp::reference(1, json!(9))],
            },
            &PropertyType::array_of(PropertyType::number()),
            AccessLevel::Reject,
        );
        assert_eq!(outcome.denied, vec!["[1]".to_string()]);
        assert_eq!(array.to_json(), json!([1, 2]));

        // the element is resent to undo the peer's optimistic change
        let update = array.patch();
        assert_eq!(update.updates(), &[ArrayOp::reference(1, json!(2))]);
    }

    #[test]
    fn test_incoming_type_mismatch_resends_element() {
        let mut array = sent(vec![json!(1)]);
        let version = array.content_version();
        let outcome = array.apply_incoming(
            ContainerUpdate::Granular {
                version,
                updates: vec![ArrayOp::reference(0, json!("one"))],
            },
            &PropertyType::array_of(PropertyType::number()),
            AccessLevel::Allow,
        );
        assert!(outcome.resend);
        assert_eq!(array.to_json(), json!([1]));
        assert!(matches!(array.to_wire(), ContainerUpdate::Full(_)));
    }

    #[test]
    fn test_denied_full_replace_keeps_state() {
        let mut array = sent(vec![json!(1)]);
        let version = array.content_version();
        let ty = PropertyType::array_of(PropertyType::number().with_access(AccessLevel::Reject));

        let outcome = array.apply_incoming(
            ContainerUpdate::Full(Snapshot {
                version,
                value: json!([2]),
            }),
            &ty,
            AccessLevel::Allow,
        );
        assert_eq!(outcome.denied, vec![String::new()]);
        assert_eq!(array.to_json(), json!([1]));
        assert!(array.needs_full_resend());
    }

    #[test]
    fn test_unattached_nested_change_is_sent_as_ref() {
        let mut array = VersionedArray::from_values([json!([1])]);
        array.to_wire();
        array
            .update(0, |v| v.as_array_mut().unwrap().push(json!(2)))
            .unwrap();
        let update = array.patch();
        assert_eq!(update.updates()[0].op, ArrayOpKind::Ref);
    }

    #[derive(Debug, Clone)]
    enum Edit {
        Push(i64),
        Insert(usize, i64),
        Remove(usize),
        Set(usize, i64),
    }

    fn edit() -> impl Strategy<Value = Edit> {
        prop_oneof![
            any::<i64>().prop_map(Edit::Push),
            (0usize..8, any::<i64>()).prop_map(|(i, v)| Edit::Insert(i, v)),
            (0usize..8).prop_map(Edit::Remove),
            (0usize..8, any::<i64>()).prop_map(|(i, v)| Edit::Set(i, v)),
        ]
    }

    fn apply_local(array: &mut VersionedArray, edits: Vec<Edit>) {
        for edit in edits {
            let len = array.len();
            match edit {
                Edit::Push(v) => array.push(json!(v)),
                Edit::Insert(i, v) => { let _ = array.insert(i.min(len), json!(v)); }
                Edit::Remove(i) if len > 0 => { let _ = array.remove(i % len); }
                Edit::Set(i, v) if len > 0 => { let _ = array.set(i % len, json!(v)); }
                _ => {}
            }
        }
    }

    /// Apply edits to the peer's own copy and return them as the ops it sends
    fn peer_ops(peer: &mut Vec<JsonValue>, edits: Vec<Edit>) -> Vec<ArrayOp> {
        let mut ops = Vec::new();
        for edit in edits {
            let len = peer.len();
            match edit {
                Edit::Push(v) => {
                    peer.push(json!(v));
                    ops.push(ArrayOp::add(len, json!(v)));
                }
                Edit::Insert(i, v) => {
                    peer.insert(i.min(len), json!(v));
                    ops.push(ArrayOp::add(i.min(len), json!(v)));
                }
                Edit::Remove(i) if len > 0 => {
                    peer.remove(i % len);
                    ops.push(ArrayOp::remove(i % len));
                }
                Edit::Set(i, v) if len > 0 => {
                    peer[i % len] = json!(v);
                    ops.push(ArrayOp::reference(i % len, json!(v)));
                }
                _ => {}
            }
        }
        ops
    }

    proptest! {
        #[test]
        fn prop_patch_replays_to_server_state(
            initial in proptest::collection::vec(any::<i64>(), 0..6),
            edits in proptest::collection::vec(edit(), 0..20),
        ) {
            let mut array = sent(initial.iter().map(|v| json!(v)).collect());
            let peer: Vec<JsonValue> = initial.iter().map(|v| json!(v)).collect();
            let version = array.content_version();

            apply_local(&mut array, edits);

            let update = array.patch();
            prop_assert!(update.version().map_or(true, |v| v == version));
            prop_assert_eq!(JsonValue::Array(replay(peer, &update)), array.to_json());
            prop_assert!(array.patch().is_noop());
            prop_assert_eq!(array.content_version(), version);
        }

        #[test]
        fn prop_peer_ops_over_unflushed_edits_converge(
            initial in proptest::collection::vec(any::<i64>(), 0..6),
            before in proptest::collection::vec(edit(), 0..10),
            remote in proptest::collection::vec(edit(), 0..10),
            after in proptest::collection::vec(edit(), 0..10),
        ) {
            let mut array = sent(initial.iter().map(|v| json!(v)).collect());
            let mut peer: Vec<JsonValue> = initial.iter().map(|v| json!(v)).collect();
            let version = array.content_version();

            apply_local(&mut array, before);
            let ops = peer_ops(&mut peer, remote);
            let outcome = array.apply_incoming(
                ContainerUpdate::Granular { version, updates: ops },
                &PropertyType::array_of(PropertyType::number()),
                AccessLevel::Deep,
            );
            prop_assert!(outcome.is_clean());
            apply_local(&mut array, after);

            let update = array.patch();
            prop_assert_eq!(JsonValue::Array(replay(peer, &update)), array.to_json());
            prop_assert!(array.patch().is_noop());
        }
    }
}
