/*
    queue.rs - Pending work units

    Units are kept in arrival order. Taking a unit scans from the front and
    removes the first one whose level reaches the floor; lower units stay
    where they are. A unit queued from inside another unit is placed right
    after the last unit queued by the same spawner, so siblings stay
    contiguous and in submission order.
*/

use std::collections::VecDeque;

use super::{DispatchContext, Level};

pub(crate) type Work<S> = Box<dyn FnOnce(&DispatchContext<S>) -> anyhow::Result<()> + Send>;

pub(crate) struct PendingUnit<S> {
    pub id: u64,
    pub level: Level,
    pub spawned_by: Option<u64>,
    pub work: Work<S>,
}

impl<S> std::fmt::Debug for PendingUnit<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingUnit")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("spawned_by", &self.spawned_by)
            .finish_non_exhaustive()
    }
}

pub(crate) struct UnitQueue<S> {
    units: VecDeque<PendingUnit<S>>,
    pub exit: bool,
}

impl<S> UnitQueue<S> {
    pub fn new() -> Self {
        Self {
            units: VecDeque::new(),
            exit: false,
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn push(&mut self, unit: PendingUnit<S>) {
        let sibling = unit.spawned_by.and_then(|parent| {
            self.units
                .iter()
                .rposition(|queued| queued.spawned_by == Some(parent))
        });
        match sibling {
            Some(position) => self.units.insert(position + 1, unit),
            None => self.units.push_back(unit),
        }
    }

    pub fn take_eligible(&mut self, floor: Level) -> Option<PendingUnit<S>> {
        let position = self.units.iter().position(|unit| unit.level >= floor)?;
        self.units.remove(position)
    }

    pub fn drain(&mut self) -> Vec<PendingUnit<S>> {
        self.units.drain(..).collect()
    }

    #[cfg(test)]
    fn ids(&self) -> Vec<u64> {
        self.units.iter().map(|unit| unit.id).collect()
    }
}
