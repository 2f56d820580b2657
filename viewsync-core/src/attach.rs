/*
    attach.rs - Order in which stateful property values are activated

    Properties fall into three groups:
    - independents (no declared dependencies), in declaration order
    - dependents, by level ascending and by name within a level
    - properties depending on everything else, in declaration order

    A dependent's level is 0 when none of its dependencies is another
    dependent, otherwise 1 + the highest level among those. Cycles never
    fail: the member where the cycle is detected is put at level 0.

    Deactivation walks the exact reverse.
*/

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::types::{Dependencies, TypeRegistry};

/// Deterministic attach order over a set of properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachOrder {
    order: Vec<String>,
    cycle_members: BTreeSet<String>,
}

struct Levels<'a> {
    graph: BTreeMap<&'a str, Vec<&'a str>>,
    levels: BTreeMap<&'a str, usize>,
    visiting: BTreeSet<&'a str>,
    cycle_members: BTreeSet<String>,
}

impl<'a> Levels<'a> {
    fn level_of(&mut self, name: &'a str) -> usize {
        if let Some(&level) = self.levels.get(name) {
            return level;
        }
        if !self.visiting.insert(name) {
            warn!(property = name, "dependency cycle detected, placing property at level 0");
            self.cycle_members.insert(name.to_string());
            self.levels.insert(name, 0);
            return 0;
        }

        let deps = self.graph.get(name).cloned().unwrap_or_default();
        let mut level = 0;
        for dep in deps {
            level = level.max(self.level_of(dep) + 1);
        }

        self.visiting.remove(name);
        // a cycle member keeps the level assigned when the cycle was found
        *self.levels.entry(name).or_insert(level)
    }
}

impl AttachOrder {
    /// Compute the order for `(name, dependencies)` pairs given in
    /// declaration order
    pub fn compute<'a, I>(properties: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a Dependencies)>,
    {
        let mut independents = Vec::new();
        let mut dependents: Vec<(&str, &[String])> = Vec::new();
        let mut after_all = Vec::new();

        for (name, deps) in properties {
            match deps {
                Dependencies::None => independents.push(name),
                Dependencies::On(list) if list.is_empty() => independents.push(name),
                Dependencies::On(list) => dependents.push((name, list.as_slice())),
                Dependencies::All => after_all.push(name),
            }
        }

        let dependent_names: BTreeSet<&str> = dependents.iter().map(|(name, _)| *name).collect();
        let graph = dependents
            .iter()
            .map(|(name, list)| {
                let edges = list
                    .iter()
                    .map(String::as_str)
                    .filter(|dep| dependent_names.contains(dep) && dep != name)
                    .collect();
                (*name, edges)
            })
            .collect();

        let mut levels = Levels {
            graph,
            levels: BTreeMap::new(),
            visiting: BTreeSet::new(),
            cycle_members: BTreeSet::new(),
        };
        for name in &dependent_names {
            levels.level_of(*name);
        }

        let mut ranked: Vec<(usize, &str)> = dependent_names
            .iter()
            .map(|name| (levels.levels.get(name).copied().unwrap_or(0), *name))
            .collect();
        ranked.sort();

        let order: Vec<String> = independents
            .into_iter()
            .chain(ranked.into_iter().map(|(_, name)| name))
            .chain(after_all)
            .map(str::to_string)
            .collect();

        debug!(properties = order.len(), cycles = levels.cycle_members.len(), "attach order computed");
        Self {
            order,
            cycle_members: levels.cycle_members,
        }
    }

    /// Order over every property the registry describes
    pub fn from_registry(registry: &dyn TypeRegistry) -> Self {
        Self::compute(
            registry
                .descriptions()
                .into_iter()
                .map(|d| (d.name.as_str(), &d.depends_on)),
        )
    }

    pub fn attach_order(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn detach_order(&self) -> impl Iterator<Item = &str> {
        self.attach_order().rev()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.order
    }

    /// Properties placed at level 0 because a cycle ran through them
    pub fn cycle_members(&self) -> &BTreeSet<String> {
        &self.cycle_members
    }

    pub fn has_cycle(&self) -> bool {
        !self.cycle_members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn on(names: &[&str]) -> Dependencies {
        Dependencies::On(names.iter().map(|s| s.to_string()).collect())
    }

    fn order_of(props: &[(&str, Dependencies)]) -> AttachOrder {
        AttachOrder::compute(props.iter().map(|(name, deps)| (*name, deps)))
    }

    #[test]
    fn test_groups_and_levels() {
        let props = vec![
            ("z_all", Dependencies::All),
            ("c", on(&["b"])),
            ("x", Dependencies::None),
            ("b", on(&["a"])),
            ("a", on(&["x"])),
            ("d", on(&["a"])),
            ("y", Dependencies::None),
        ];
        let order = order_of(&props);
        assert_eq!(order.as_slice(), &["x", "y", "a", "b", "d", "c", "z_all"]);
        assert!(!order.has_cycle());
    }

    #[test]
    fn test_undeclared_dependencies_are_ignored() {
        let props = vec![("a", on(&["missing"])), ("b", on(&["a"]))];
        assert_eq!(order_of(&props).as_slice(), &["a", "b"]);
    }

    #[test]
    fn test_two_node_cycle_is_not_fatal() {
        let props = vec![("b", on(&["a"])), ("a", on(&["b"]))];
        let order = order_of(&props);
        assert_eq!(order.as_slice(), &["a", "b"]);
        assert!(order.has_cycle());
        assert!(order.cycle_members().contains("a"));

        // deterministic across runs
        assert_eq!(order, order_of(&props));
    }

    #[test]
    fn test_self_dependency_is_level_zero() {
        let props = vec![("a", on(&["a"])), ("b", on(&["a"]))];
        let order = order_of(&props);
        assert_eq!(order.as_slice(), &["a", "b"]);
        assert!(!order.has_cycle());
    }

    #[test]
    fn test_detach_is_exact_reverse() {
        let props = vec![("a", Dependencies::None), ("b", on(&["a"])), ("c", Dependencies::All)];
        let order = order_of(&props);
        let detach: Vec<&str> = order.detach_order().collect();
        assert_eq!(detach, vec!["c", "b", "a"]);
    }

    proptest! {
        /// Edges only point to lower indexes, so every graph is acyclic
        #[test]
        fn prop_dependencies_come_first_without_cycles(
            edges in proptest::collection::vec(proptest::collection::vec(any::<prop::sample::Index>(), 0..3), 1..12)
        ) {
            let names: Vec<String> = (0..edges.len()).map(|i| format!("p{:02}", i)).collect();
            let props: Vec<(String, Dependencies)> = edges
                .iter()
                .enumerate()
                .map(|(i, picks)| {
                    let deps: Vec<String> = if i == 0 {
                        Vec::new()
                    } else {
                        picks.iter().map(|p| names[p.index(i)].clone()).collect()
                    };
                    (names[i].clone(), Dependencies::On(deps))
                })
                .collect();

            let order = AttachOrder::compute(props.iter().map(|(n, d)| (n.as_str(), d)));
            prop_assert!(!order.has_cycle());
            prop_assert_eq!(order.len(), props.len());

            let position = |name: &str| order.attach_order().position(|n| n == name);
            for (name, deps) in &props {
                if let Dependencies::On(list) = deps {
                    for dep in list {
                        prop_assert!(position(dep) < position(name));
                    }
                }
            }
        }
    }
}
