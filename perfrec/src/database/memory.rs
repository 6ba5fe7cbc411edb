use super::{batch_keys, check_rows, check_values, BulkInsertBackend, ConnectionError};
use crate::{
    entity::{EntityClass, EntityType, NaturalKey, Record, ID},
    sequence::derive_by_sequence,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// A row as held by the in-memory store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: Option<ID>,
    pub record: Record,
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    rows: Vec<StoredRow>,
    keys: HashMap<NaturalKey, ID>,
    ids: BTreeSet<ID>,
    last_id: ID,
}

impl MemoryTable {
    fn push(&mut self, record: Record, with_id: bool) -> Option<ID> {
        let id = with_id.then(|| {
            self.last_id += 1;
            self.ids.insert(self.last_id);
            self.last_id
        });

        self.rows.push(StoredRow { id, record });

        id
    }
}

type Tables = BTreeMap<EntityType, MemoryTable>;

/// Store with the same semantics as the SQLite backend, kept entirely in memory.
///
/// Used for dry runs and to exercise failure paths: `reject` makes every insert into one table
/// fail.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: Tables,
    snapshot: Option<Tables>,
    rejected: BTreeSet<EntityType>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// fail every subsequent insert into `entity`
    pub fn reject(&mut self, entity: EntityType) {
        self.rejected.insert(entity);
    }

    pub fn accept(&mut self, entity: EntityType) {
        self.rejected.remove(&entity);
    }

    pub fn rows(&self, entity: EntityType) -> &[StoredRow] {
        self.tables
            .get(&entity)
            .map_or(&[], |table| table.rows.as_slice())
    }

    pub fn len(&self, entity: EntityType) -> usize {
        self.rows(entity).len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(|table| table.rows.is_empty())
    }

    pub fn id_for(&self, entity: EntityType, key: &NaturalKey) -> Option<ID> {
        self.tables.get(&entity)?.keys.get(key).copied()
    }

    pub fn contains(&self, entity: EntityType, id: ID) -> bool {
        self.tables
            .get(&entity)
            .map_or(false, |table| table.ids.contains(&id))
    }

    pub fn get(&self, entity: EntityType, id: ID) -> Option<&Record> {
        self.rows(entity)
            .iter()
            .find(|row| row.id == Some(id))
            .map(|row| &row.record)
    }

    fn guard(&self, entity: EntityType, rows: &[Record]) -> Result<(), ConnectionError> {
        if self.rejected.contains(&entity) {
            warn!(entity = %entity, "Rejecting batch");

            return Err(ConnectionError::Rejected { entity });
        }

        // same guarantee the SQLite schema gives through its foreign keys
        for row in rows {
            for (target, id) in row.references() {
                if !self.contains(target, id) {
                    debug!(entity = %entity, target = %target, id = id, "Dangling foreign key");

                    return Err(ConnectionError::Rejected { entity });
                }
            }
        }

        Ok(())
    }
}

impl BulkInsertBackend for MemoryBackend {
    fn begin(&mut self) -> Result<(), ConnectionError> {
        self.snapshot = Some(self.tables.clone());

        Ok(())
    }

    fn commit(&mut self) -> Result<(), ConnectionError> {
        self.snapshot
            .take()
            .map(|_| ())
            .ok_or(ConnectionError::NoTransaction)
    }

    fn rollback(&mut self) -> Result<(), ConnectionError> {
        self.tables = self.snapshot.take().ok_or(ConnectionError::NoTransaction)?;

        Ok(())
    }

    fn insert_dedup_and_fetch_ids(
        &mut self,
        entity: EntityType,
        rows: &[Record],
    ) -> Result<Vec<ID>, ConnectionError> {
        check_rows(entity, EntityClass::Dimension, rows)?;
        let keys = batch_keys(entity, rows)?;
        self.guard(entity, rows)?;

        let table = self.tables.entry(entity).or_default();
        let mut ids = Vec::with_capacity(rows.len());

        for (row, key) in rows.iter().zip(keys) {
            let id = match table.keys.get(&key) {
                Some(id) => *id,
                None => {
                    let id = table.push(row.clone(), true).unwrap_or_default();
                    table.keys.insert(key, id);
                    id
                }
            };

            ids.push(id);
        }

        Ok(ids)
    }

    fn insert_and_derive_ids(
        &mut self,
        entity: EntityType,
        rows: &[Record],
    ) -> Result<Vec<ID>, ConnectionError> {
        check_rows(entity, EntityClass::Fact, rows)?;
        self.guard(entity, rows)?;

        let table = self.tables.entry(entity).or_default();
        let first = table.last_id + 1;

        for row in rows {
            table.push(row.clone(), true);
        }

        Ok(derive_by_sequence(first, rows.len()))
    }

    fn insert_all(&mut self, entity: EntityType, rows: &[Record]) -> Result<usize, ConnectionError> {
        check_rows(entity, EntityClass::Value, rows)?;
        check_values(entity, rows)?;
        self.guard(entity, rows)?;

        let table = self.tables.entry(entity).or_default();

        for row in rows {
            table.push(row.clone(), false);
        }

        Ok(rows.len())
    }
}
