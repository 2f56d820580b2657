/*
    policy.rs - Whether a peer-originated mutation may be applied

    Pure functions over the type registry and the current property values.
    A mutation is refused when:
    - the target is itself a protecting property,
    - some other protecting property currently sits at its blocking value
      and covers the target,
    - or the computed access level along the full path is reject.
*/

use serde_json::Value as JsonValue;
use tracing::trace;

use super::{combine, AccessLevel, PropertyPath};
use crate::error::{SyncError, SyncResult};
use crate::types::TypeRegistry;

/// Computed access level of a path, walking root to leaf
pub fn computed_level(registry: &dyn TypeRegistry, path: &PropertyPath) -> AccessLevel {
    let Some(description) = registry.describe(path.root()) else {
        return AccessLevel::UNDECLARED_ROOT;
    };

    let mut level = description.ty.access.unwrap_or(AccessLevel::UNDECLARED_ROOT);
    let mut ty = Some(&description.ty);
    for segment in path.segments() {
        let child = ty.and_then(|t| t.child(segment));
        level = combine(level, child.and_then(|c| c.access));
        ty = child;
    }
    level
}

/// Names of every protecting property currently blocking `name`
///
/// `current` yields the live value of a property, or `None` when unset (the
/// declared default is used then).
pub fn blocking_protectors<'r>(
    registry: &'r dyn TypeRegistry,
    name: &str,
    current: &dyn Fn(&str) -> Option<JsonValue>,
) -> Vec<&'r str> {
    registry
        .descriptions()
        .into_iter()
        .filter_map(|description| {
            let rule = description.protecting.as_ref()?;
            if description.name == name || !rule.covers(name) {
                return None;
            }
            let value = current(&description.name).unwrap_or_else(|| description.default_value.clone());
            (value == rule.blocking_value).then_some(description.name.as_str())
        })
        .collect()
}

/// Check a peer mutation of `path`
pub fn check_client_mutation_allowed(
    registry: &dyn TypeRegistry,
    path: &PropertyPath,
    current: &dyn Fn(&str) -> Option<JsonValue>,
) -> SyncResult<()> {
    check_client_mutation_allowed_with_exemptions(registry, path, current, &[])
}

/// Like [`check_client_mutation_allowed`], but blocks by the protecting
/// properties named in `exempt` are ignored; any other blocker still denies
pub fn check_client_mutation_allowed_with_exemptions(
    registry: &dyn TypeRegistry,
    path: &PropertyPath,
    current: &dyn Fn(&str) -> Option<JsonValue>,
    exempt: &[&str],
) -> SyncResult<()> {
    let name = path.root();

    if registry.describe(name).is_some_and(|d| d.is_protecting()) {
        return Err(SyncError::access_denied(
            path.to_string(),
            "protecting properties cannot be changed by the peer",
        ));
    }

    for blocker in blocking_protectors(registry, name, current) {
        if exempt.contains(&blocker) {
            trace!(property = %path, blocker, "protection block exempted");
            continue;
        }
        return Err(SyncError::access_denied(
            path.to_string(),
            format!("blocked by protecting property '{}'", blocker),
        ));
    }

    let level = computed_level(registry, path);
    if !level.permits_peer_mutation() {
        return Err(SyncError::access_denied(
            path.to_string(),
            format!("computed access level is {}", level),
        ));
    }

    Ok(())
}
