use crate::entity::{EntityType, Record, ID};
use std::collections::BTreeMap;

/// A record waiting to be flushed
#[derive(Debug, Clone, PartialEq)]
pub struct Staged {
    pub record: Record,
    /// local id assigned by the producer, `None` for metric values
    pub local_id: Option<ID>,
    /// position in staging order across all entity types of the scope
    pub position: u64,
}

/// Per entity type, the ordered records of one staging scope (one process or one log file)
#[derive(Debug, Default)]
pub struct StagingArea {
    stages: BTreeMap<EntityType, Vec<Staged>>,
    position: u64,
}

impl StagingArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record to its type's buffer and return its local id.
    ///
    /// Identified records without an explicit id receive `len - 1` of their buffer; metric values
    /// never carry one.
    pub fn stage(&mut self, record: Record, local_id: Option<ID>) -> Option<ID> {
        let entity = record.entity_type();
        let stage = self.stages.entry(entity).or_default();

        let local_id = if entity.is_identified() {
            Some(local_id.unwrap_or(stage.len() as ID))
        } else {
            None
        };

        stage.push(Staged {
            record,
            local_id,
            position: self.position,
        });
        self.position += 1;

        local_id
    }

    /// Take all records of one type, leaving its buffer empty
    pub fn drain(&mut self, entity: EntityType) -> Vec<Staged> {
        self.stages
            .get_mut(&entity)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Take the buffers of every type at once
    pub fn drain_all(&mut self) -> BTreeMap<EntityType, Vec<Staged>> {
        EntityType::ALL
            .iter()
            .map(|entity| (*entity, self.drain(*entity)))
            .filter(|(_, staged)| !staged.is_empty())
            .collect()
    }

    /// Put previously drained buffers back in front of anything staged since.
    pub fn restore(&mut self, batches: BTreeMap<EntityType, Vec<Staged>>) {
        for (entity, mut staged) in batches {
            let stage = self.stages.entry(entity).or_default();
            staged.append(stage);
            *stage = staged;
        }
    }

    pub fn len(&self, entity: EntityType) -> usize {
        self.stages.get(&entity).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.values().all(Vec::is_empty)
    }

    pub fn counts(&self) -> BTreeMap<EntityType, usize> {
        self.stages
            .iter()
            .filter(|(_, staged)| !staged.is_empty())
            .map(|(entity, staged)| (*entity, staged.len()))
            .collect()
    }
}
