//! Dependency-ordered flush of a staging area into a backend.
//!
//! Every entity type is drained in [`FLUSH_ORDER`], its foreign keys are rewritten from local to
//! global ids through the maps built by the types flushed before it, and the batch is inserted
//! with the primitive matching its [`EntityClass`]. One flush is one backend transaction: on any
//! failure the transaction is rolled back, the drained records are put back into staging and the
//! engine's maps stay as they were.

use crate::{
    database::{BulkInsertBackend, ConnectionError},
    dedup::dedup_by_key,
    entity::{EntityClass, EntityType, NaturalKey, Record, ID},
    error::ReconcileError,
    staging::{Staged, StagingArea},
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info, instrument};

/// Topological order of the reference graph, referents first
pub const FLUSH_ORDER: [EntityType; 10] = [
    EntityType::Metric,
    EntityType::Machine,
    EntityType::Application,
    EntityType::DataCollection,
    EntityType::Dataset,
    EntityType::MachineMetric,
    EntityType::Trial,
    EntityType::Execution,
    EntityType::NondeterministicMetric,
    EntityType::DeterministicMetric,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Resolution {
    global: ID,
    /// staging position of the first record bound to this local id
    position: u64,
}

/// Local to global id maps of one staging scope
#[derive(Debug, Clone, Default)]
pub struct IdMaps {
    maps: BTreeMap<EntityType, HashMap<ID, Resolution>>,
}

impl IdMaps {
    pub fn get(&self, entity: EntityType, local: ID) -> Option<ID> {
        self.maps
            .get(&entity)?
            .get(&local)
            .map(|resolution| resolution.global)
    }

    pub fn len(&self, entity: EntityType) -> usize {
        self.maps.get(&entity).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.maps.values().all(HashMap::is_empty)
    }

    fn bind(
        &mut self,
        entity: EntityType,
        local: ID,
        global: ID,
        position: u64,
    ) -> Result<(), ReconcileError> {
        let map = self.maps.entry(entity).or_default();

        match map.get(&local) {
            Some(existing) if existing.global != global => Err(ReconcileError::LocalIdConflict {
                entity,
                local,
                first: existing.global,
                second: global,
            }),
            Some(_) => Ok(()),
            None => {
                map.insert(local, Resolution { global, position });
                Ok(())
            }
        }
    }

    /// Global id for a foreign key of `referrer`, which sits at `position` in staging
    fn resolve(
        &self,
        referrer: EntityType,
        position: u64,
        entity: EntityType,
        local: ID,
    ) -> Result<ID, ReconcileError> {
        let resolution = self
            .maps
            .get(&entity)
            .and_then(|map| map.get(&local))
            .ok_or(ReconcileError::DanglingReference {
                entity,
                local,
                referrer,
            })?;

        if resolution.position > position {
            return Err(ReconcileError::StagedAfterReferrer {
                entity,
                local,
                referrer,
            });
        }

        Ok(resolution.global)
    }
}

/// Rows written and highest global id seen, per entity type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub rows: BTreeMap<EntityType, usize>,
    pub maxima: BTreeMap<EntityType, ID>,
}

impl FlushReport {
    pub fn total(&self) -> usize {
        self.rows.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    fn add(&mut self, entity: EntityType, rows: usize, ids: &[ID]) {
        *self.rows.entry(entity).or_default() += rows;

        if let Some(max) = ids.iter().max() {
            let current = self.maxima.entry(entity).or_insert(*max);
            *current = (*current).max(*max);
        }
    }

    pub fn merge(&mut self, other: &FlushReport) {
        for (entity, rows) in &other.rows {
            *self.rows.entry(*entity).or_default() += rows;
        }

        for (entity, max) in &other.maxima {
            let current = self.maxima.entry(*entity).or_insert(*max);
            *current = (*current).max(*max);
        }
    }
}

/// Drives flush cycles for one staging scope and remembers its resolved ids between cycles
#[derive(Debug, Default)]
pub struct FlushEngine {
    maps: IdMaps,
}

impl FlushEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// forget every resolution, starting a new staging scope
    pub fn reset(&mut self) {
        self.maps = IdMaps::default();
    }

    pub fn resolve(&self, entity: EntityType, local: ID) -> Option<ID> {
        self.maps.get(entity, local)
    }

    pub fn maps(&self) -> &IdMaps {
        &self.maps
    }

    /// Flush everything staged as one transaction.
    #[instrument(skip_all, fields(staged = ?staging.counts()))]
    pub fn flush<B: BulkInsertBackend + ?Sized>(
        &mut self,
        staging: &mut StagingArea,
        backend: &mut B,
    ) -> Result<FlushReport, ReconcileError> {
        let batches = staging.drain_all();
        if batches.is_empty() {
            debug!("Nothing staged, skipping flush");

            return Ok(FlushReport::default());
        }

        if let Err(error) = backend.begin() {
            staging.restore(batches);

            return Err(error.into());
        }

        let mut maps = self.maps.clone();
        let result = flush_cycle(&mut maps, &batches, backend)
            .and_then(|report| backend.commit().map(|_| report).map_err(Into::into));

        match result {
            Ok(report) => {
                self.maps = maps;
                info!(rows = report.total(), "Flushed staging area");

                Ok(report)
            }
            Err(error) => {
                error!(error = %error, "Flush failed, rolling back");

                if let Err(rollback) = backend.rollback() {
                    error!(error = ?rollback, "Failed to roll back flush: {rollback}");
                }
                staging.restore(batches);

                Err(error)
            }
        }
    }
}

fn flush_cycle<B: BulkInsertBackend + ?Sized>(
    maps: &mut IdMaps,
    batches: &BTreeMap<EntityType, Vec<Staged>>,
    backend: &mut B,
) -> Result<FlushReport, ReconcileError> {
    let mut report = FlushReport::default();

    for entity in FLUSH_ORDER {
        let staged = match batches.get(&entity) {
            Some(staged) if !staged.is_empty() => staged,
            _ => continue,
        };

        let rows = rewrite_references(maps, entity, staged)?;

        match entity.class() {
            EntityClass::Dimension => {
                let keys = rows
                    .iter()
                    .map(|row| {
                        row.natural_key().ok_or(ConnectionError::WrongPolicy {
                            entity,
                            expected: EntityClass::Dimension,
                        })
                    })
                    .collect::<Result<Vec<NaturalKey>, _>>()?;
                let deduplicated = dedup_by_key(&keys, NaturalKey::clone);
                let unique = deduplicated.select(&rows);

                let ids = backend.insert_dedup_and_fetch_ids(entity, &unique)?;
                check_count(entity, unique.len(), ids.len())?;
                let globals = deduplicated.expand(&ids);

                bind_all(maps, entity, staged, &globals)?;
                report.add(entity, unique.len(), &ids);

                debug!(
                    entity = %entity,
                    staged = staged.len(),
                    distinct = unique.len(),
                    "Flushed dimension"
                );
            }
            EntityClass::Fact => {
                let ids = backend.insert_and_derive_ids(entity, &rows)?;
                check_count(entity, rows.len(), ids.len())?;

                bind_all(maps, entity, staged, &ids)?;
                report.add(entity, rows.len(), &ids);

                debug!(entity = %entity, rows = rows.len(), "Flushed fact");
            }
            EntityClass::Value => {
                let inserted = backend.insert_all(entity, &rows)?;
                report.add(entity, inserted, &[]);

                debug!(entity = %entity, rows = inserted, "Flushed values");
            }
        }
    }

    Ok(report)
}

/// Copy a drained batch with every foreign key turned into a global id
fn rewrite_references(
    maps: &IdMaps,
    entity: EntityType,
    staged: &[Staged],
) -> Result<Vec<Record>, ReconcileError> {
    staged
        .iter()
        .map(|item| {
            let mut record = item.record.clone();

            for (target, id) in record.references_mut() {
                *id = maps.resolve(entity, item.position, target, *id)?;
            }

            Ok(record)
        })
        .collect()
}

fn bind_all(
    maps: &mut IdMaps,
    entity: EntityType,
    staged: &[Staged],
    globals: &[ID],
) -> Result<(), ReconcileError> {
    for (item, global) in staged.iter().zip(globals) {
        if let Some(local) = item.local_id {
            maps.bind(entity, local, *global, item.position)?;
        }
    }

    Ok(())
}

fn check_count(entity: EntityType, expected: usize, found: usize) -> Result<(), ConnectionError> {
    if expected == found {
        Ok(())
    } else {
        Err(ConnectionError::IdCount {
            entity,
            expected,
            found,
        })
    }
}
